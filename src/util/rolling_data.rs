
/// A fixed-size sliding window over the most recent `N` samples, with a cached sum so that the
///  mean is available in O(1).
pub struct RollingData<const N: usize> {
    buf: BufferImpl<N>,
    cached_sum: f64,
}
impl<const N: usize> RollingData<N> {
    pub fn new() -> Self {
        RollingData {
            buf: BufferImpl::new(),
            cached_sum: 0.0,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
        }
        self.cached_sum += value;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    /// 0.0 for an empty window
    pub fn mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (self.cached_sum / self.buf.len() as f64).clamp(0.0, f64::MAX)
    }
}

impl<const N: usize> Default for RollingData<N> {
    fn default() -> Self {
        Self::new()
    }
}


enum BufferImpl<const N: usize> {
    Growing(Vec<f64>),
    Ring {
        buf: Vec<f64>,
        next: usize,
    },
}
impl <const N: usize> BufferImpl<N> {
    fn new() -> BufferImpl<N> {
        BufferImpl::Growing(Vec::with_capacity(N))
    }

    fn len(&self) -> usize {
        match self {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}
