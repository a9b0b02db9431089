use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::messaging::datagram_socket::DatagramSocket;
use crate::messaging::net_address::NetAddress;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkConditions {
    /// probability for a datagram to be dropped, 0.0 to 1.0
    pub loss: f64,
    /// probability for a delivered datagram to arrive twice
    pub duplication: f64,
    /// probability for a delivered datagram to overtake datagrams already waiting in the
    ///  receiver's inbox
    pub reordering: f64,
}

impl NetworkConditions {
    pub fn lossy(loss: f64) -> NetworkConditions {
        NetworkConditions {
            loss,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub unroutable: u64,
}

struct NetworkState {
    rng: StdRng,
    conditions: NetworkConditions,
    inboxes: FxHashMap<NetAddress, VecDeque<(NetAddress, Vec<u8>)>>,
    stats: NetworkStats,
}

/// An in-memory datagram network with configurable loss, duplication and reordering. All
///  randomness comes from a seeded generator, so a given seed and sequence of operations
///  always produces the same outcome.
#[derive(Clone)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedNetwork {
    pub fn new(seed: u64, conditions: NetworkConditions) -> SimulatedNetwork {
        SimulatedNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                rng: StdRng::seed_from_u64(seed),
                conditions,
                inboxes: Default::default(),
                stats: Default::default(),
            })),
        }
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, NetworkState>> {
        self.state.lock()
            .map_err(|_| io::Error::other("simulated network state is poisoned"))
    }

    /// Creates a socket that receives datagrams sent to `address`
    pub fn socket(&self, address: NetAddress) -> anyhow::Result<SimulatedSocket> {
        let mut state = self.lock()?;
        if state.inboxes.contains_key(&address) {
            anyhow::bail!("address {} is already in use", address);
        }
        state.inboxes.insert(address, VecDeque::new());

        Ok(SimulatedSocket {
            network: self.clone(),
            address,
        })
    }

    pub fn set_conditions(&self, conditions: NetworkConditions) -> anyhow::Result<()> {
        self.lock()?.conditions = conditions;
        Ok(())
    }

    pub fn stats(&self) -> NetworkStats {
        self.lock()
            .map(|s| s.stats)
            .unwrap_or_default()
    }

    /// number of datagrams waiting to be received across all sockets
    pub fn num_in_flight(&self) -> usize {
        self.lock()
            .map(|s| s.inboxes.values().map(|i| i.len()).sum())
            .unwrap_or_default()
    }
}

pub struct SimulatedSocket {
    network: SimulatedNetwork,
    address: NetAddress,
}

impl DatagramSocket for SimulatedSocket {
    fn send_to(&self, to: NetAddress, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.network.lock()?;
        let state = &mut *state;
        state.stats.sent += 1;

        let conditions = state.conditions;
        if state.rng.gen_bool(conditions.loss) {
            trace!("simulated network: dropping datagram {} -> {}", self.address, to);
            state.stats.dropped += 1;
            return Ok(buf.len());
        }
        let num_copies = if state.rng.gen_bool(conditions.duplication) {
            state.stats.duplicated += 1;
            2
        }
        else {
            1
        };
        let overtake = state.rng.gen_bool(conditions.reordering);

        let Some(inbox) = state.inboxes.get_mut(&to) else {
            trace!("simulated network: no socket at {}", to);
            state.stats.unroutable += 1;
            return Ok(buf.len());
        };
        for _ in 0..num_copies {
            let datagram = (self.address, buf.to_vec());
            if overtake && !inbox.is_empty() {
                let pos = state.rng.gen_range(0..inbox.len());
                inbox.insert(pos, datagram);
            }
            else {
                inbox.push_back(datagram);
            }
        }
        Ok(buf.len())
    }

    fn receive_from(&self, buf: &mut [u8]) -> io::Result<(NetAddress, usize)> {
        let mut state = self.network.lock()?;
        let Some((from, datagram)) = state.inboxes.get_mut(&self.address).and_then(|i| i.pop_front()) else {
            return Err(ErrorKind::WouldBlock.into());
        };

        // like UDP, excess bytes are discarded if the buffer is too small
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok((from, len))
    }

    fn local_address(&self) -> NetAddress {
        self.address
    }
}

impl Drop for SimulatedSocket {
    fn drop(&mut self) {
        if let Ok(mut state) = self.network.lock() {
            state.inboxes.remove(&self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn receive_all(socket: &SimulatedSocket) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match socket.receive_from(&mut buf) {
                Ok((_, len)) => result.push(buf[..len].to_vec()),
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::WouldBlock);
                    return result;
                }
            }
        }
    }

    #[test]
    fn test_perfect_network() {
        let network = SimulatedNetwork::new(1, NetworkConditions::default());
        let a = network.socket(NetAddress::localhost(1)).unwrap();
        let b = network.socket(NetAddress::localhost(2)).unwrap();

        for i in 0..10u8 {
            a.send_to(b.local_address(), &[i]).unwrap();
        }
        let mut buf = [0u8; 4];
        assert_eq!(b.receive_from(&mut buf).unwrap(), (NetAddress::localhost(1), 1));
        assert_eq!(receive_all(&b).len(), 9);
        assert!(receive_all(&a).is_empty());
    }

    #[test]
    fn test_address_in_use() {
        let network = SimulatedNetwork::new(1, NetworkConditions::default());
        let a = network.socket(NetAddress::localhost(1)).unwrap();
        assert!(network.socket(NetAddress::localhost(1)).is_err());
        drop(a);
        assert!(network.socket(NetAddress::localhost(1)).is_ok());
    }

    #[test]
    fn test_unroutable() {
        let network = SimulatedNetwork::new(1, NetworkConditions::default());
        let a = network.socket(NetAddress::localhost(1)).unwrap();
        assert_eq!(a.send_to(NetAddress::localhost(99), &[1, 2]).unwrap(), 2);
        assert_eq!(network.stats().unroutable, 1);
    }

    #[rstest]
    #[case::none(0.0)]
    #[case::some(0.1)]
    #[case::half(0.5)]
    fn test_loss_rate(#[case] loss: f64) {
        let network = SimulatedNetwork::new(7, NetworkConditions::lossy(loss));
        let a = network.socket(NetAddress::localhost(1)).unwrap();
        let b = network.socket(NetAddress::localhost(2)).unwrap();
        for _ in 0..2000 {
            a.send_to(b.local_address(), &[0]).unwrap();
        }
        let received = receive_all(&b).len() as f64;
        assert!((received / 2000.0 - (1.0 - loss)).abs() < 0.05);
        assert_eq!(network.stats().dropped + received as u64, 2000);
    }

    #[test]
    fn test_duplication_and_reordering() {
        let network = SimulatedNetwork::new(3, NetworkConditions {
            loss: 0.0,
            duplication: 0.2,
            reordering: 0.3,
        });
        let a = network.socket(NetAddress::localhost(1)).unwrap();
        let b = network.socket(NetAddress::localhost(2)).unwrap();
        for i in 0..100u8 {
            a.send_to(b.local_address(), &[i]).unwrap();
        }

        let received = receive_all(&b).into_iter().map(|d| d[0]).collect::<Vec<_>>();
        assert_eq!(received.len() as u64, 100 + network.stats().duplicated);
        assert!(network.stats().duplicated > 0);
        assert!(received.windows(2).any(|w| w[0] > w[1]));

        let mut distinct = received.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_seed_same_outcome() {
        let run = || {
            let network = SimulatedNetwork::new(42, NetworkConditions::lossy(0.3));
            let a = network.socket(NetAddress::localhost(1)).unwrap();
            let b = network.socket(NetAddress::localhost(2)).unwrap();
            for i in 0..50u8 {
                a.send_to(b.local_address(), &[i]).unwrap();
            }
            receive_all(&b)
        };
        assert_eq!(run(), run());
    }
}
