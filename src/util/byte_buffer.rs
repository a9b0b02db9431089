//! A growable byte buffer with separate read and write cursors, used for all wire-level
//!  encoding in this crate.
//!
//! Scalars are written in the buffer's configured [Endianness]. Callers hand in the *native*
//!  byte representation of a value (`to_ne_bytes()`), and the buffer swaps bytes iff the
//!  configured endianness differs from the platform's. Raw payload bytes are copied verbatim.
//!
//! Reads never fail: they return the number of bytes that were actually available, and it is
//!  the caller's responsibility to check that count. The `try_read_*` convenience functions
//!  turn a short read into an error for parsing code.

use std::fmt::{Debug, Formatter};
use std::sync::OnceLock;
use anyhow::anyhow;
use bytes::BytesMut;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::util::safe_converter::SafeCast;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    /// The platform's byte order, determined once by looking at how a known integer is laid
    ///  out in memory
    pub fn native() -> Endianness {
        static NATIVE: OnceLock<Endianness> = OnceLock::new();
        *NATIVE.get_or_init(|| {
            if 0x0102u16.to_ne_bytes()[0] == 0x02 {
                Endianness::Little
            }
            else {
                Endianness::Big
            }
        })
    }
}


pub struct ByteBuffer {
    data: BytesMut,
    read_pos: usize,
    write_pos: usize,
    endianness: Endianness,
    swap_bytes: bool,
}

impl ByteBuffer {
    const INITIAL_CAPACITY: usize = 64;

    pub fn new(endianness: Endianness) -> ByteBuffer {
        Self::with_capacity(endianness, Self::INITIAL_CAPACITY)
    }

    pub fn with_capacity(endianness: Endianness, capacity: usize) -> ByteBuffer {
        ByteBuffer {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
            write_pos: 0,
            endianness,
            swap_bytes: endianness != Endianness::native(),
        }
    }

    /// Wraps received bytes for reading. The write cursor is positioned after the data.
    pub fn from_slice(endianness: Endianness, data: &[u8]) -> ByteBuffer {
        let mut result = Self::with_capacity(endianness, data.len());
        result.write_bytes(data);
        result
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// number of bytes written so far (high water mark, independent of the write cursor)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// number of written bytes that were not consumed by reads yet
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    pub fn write_position(&self) -> usize {
        self.write_pos
    }

    /// Moves the write cursor. Positions beyond the written data are clamped to its end.
    pub fn set_write_position(&mut self, pos: usize) {
        self.write_pos = pos.min(self.data.len());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.write_pos = 0;
    }

    fn ensure_capacity(&mut self, required_len: usize) {
        let capacity = self.data.capacity();
        if required_len <= capacity {
            return;
        }
        // grow by doubling, or to the requested size if that is more
        let target = (capacity * 2).max(required_len);
        self.data.reserve(target - self.data.len());
    }

    /// copies raw bytes to the write cursor, overwriting or appending as needed
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let end = self.write_pos + bytes.len();
        self.ensure_capacity(end);
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.write_pos..end].copy_from_slice(bytes);
        self.write_pos = end;
    }

    /// writes the native-endian representation of a scalar in the configured byte order
    pub fn write_ordered(&mut self, native_bytes: &[u8]) {
        if self.swap_bytes {
            let start = self.write_pos;
            self.write_bytes(native_bytes);
            self.data[start..self.write_pos].reverse();
        }
        else {
            self.write_bytes(native_bytes);
        }
    }

    /// Copies up to `out.len()` bytes from the read cursor, returning the number of bytes
    ///  actually copied
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.data[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        n
    }

    /// Consumes up to `max_bytes` and returns them as a slice
    pub fn read_bytes(&mut self, max_bytes: usize) -> &[u8] {
        let n = max_bytes.min(self.remaining());
        let start = self.read_pos;
        self.read_pos += n;
        &self.data[start..start + n]
    }

    /// reads a scalar written by [ByteBuffer::write_ordered], leaving its native-endian
    ///  representation in `out`
    pub fn read_ordered(&mut self, out: &mut [u8]) -> usize {
        let n = self.read_into(out);
        if self.swap_bytes {
            out[..n].reverse();
        }
        n
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_ordered(&value.to_ne_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_ordered(&value.to_ne_bytes());
    }

    pub fn try_read_u8(&mut self) -> anyhow::Result<u8> {
        let mut raw = [0u8; 1];
        if self.read_into(&mut raw) < raw.len() {
            return Err(anyhow!("buffer underflow reading u8"));
        }
        Ok(raw[0])
    }

    pub fn try_read_u16(&mut self) -> anyhow::Result<u16> {
        let mut raw = [0u8; 2];
        if self.read_ordered(&mut raw) < raw.len() {
            return Err(anyhow!("buffer underflow reading u16"));
        }
        Ok(u16::from_ne_bytes(raw))
    }

    pub fn try_read_u32(&mut self) -> anyhow::Result<u32> {
        let mut raw = [0u8; 4];
        if self.read_ordered(&mut raw) < raw.len() {
            return Err(anyhow!("buffer underflow reading u32"));
        }
        Ok(u32::from_ne_bytes(raw))
    }

    /// 7 bits per byte, high bit set if more bytes follow, least significant group first
    pub fn write_var_size(&mut self, size: u32) {
        let mut encoded: Vec<u8> = Vec::with_capacity(5);
        encoded.put_u32_varint(size);
        self.write_bytes(&encoded);
    }

    pub fn read_var_size(&mut self) -> anyhow::Result<u32> {
        let mut unread = &self.data[self.read_pos..];
        let before = unread.len();
        let size = unread.try_get_u32_varint()
            .map_err(|e| anyhow!("invalid var size: {:?}", e))?;
        self.read_pos += before - unread.len();
        Ok(size)
    }

    /// Writes the string's length as a var size, followed by its UTF-8 bytes. Strings longer
    ///  than `u32::MAX` bytes are rejected.
    pub fn write_string(&mut self, s: &str) -> anyhow::Result<()> {
        self.write_var_size(string_len(s.len())?);
        self.write_bytes(s.as_bytes());
        Ok(())
    }

    pub fn read_string(&mut self) -> anyhow::Result<String> {
        let len: usize = self.read_var_size()?.safe_cast();
        if self.remaining() < len {
            return Err(anyhow!("string of length {} exceeds remaining {} bytes", len, self.remaining()));
        }
        let raw = self.read_bytes(len).to_vec();
        Ok(String::from_utf8(raw)?)
    }
}

impl Debug for ByteBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteBuffer{{{:?}@{}/{}:{:?}}}", self.endianness, self.read_pos, self.write_pos, self.as_bytes())
    }
}

fn string_len(len: usize) -> anyhow::Result<u32> {
    u32::try_from(len)
        .map_err(|_| anyhow!("string of {} bytes exceeds the maximum length of {} bytes", len, u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, vec![0])]
    #[case::one(1, vec![1])]
    #[case::max_single_byte(127, vec![0x7f])]
    #[case::min_two_bytes(128, vec![0x80, 0x01])]
    #[case::three_bytes(16384, vec![0x80, 0x80, 0x01])]
    #[case::i32_max(0x7fff_ffff, vec![0xff, 0xff, 0xff, 0xff, 0x07])]
    fn test_var_size(#[case] size: u32, #[case] expected: Vec<u8>) {
        let mut buf = ByteBuffer::new(Endianness::Little);
        buf.write_var_size(size);
        assert_eq!(buf.as_bytes(), expected.as_slice());

        assert_eq!(buf.read_var_size().unwrap(), size);
        assert_eq!(buf.remaining(), 0);
    }

    #[rstest]
    #[case::empty("")]
    #[case::ascii("ping")]
    #[case::utf8("grüße")]
    #[case::long("abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyz")]
    fn test_string(#[case] s: &str) {
        let mut buf = ByteBuffer::new(Endianness::Big);
        buf.write_string(s).unwrap();
        buf.write_u8(99);
        assert_eq!(buf.read_string().unwrap(), s);
        assert_eq!(buf.try_read_u8().unwrap(), 99);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_string_len_limit() {
        assert_eq!(string_len(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(string_len(u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn test_truncated_string() {
        let mut buf = ByteBuffer::new(Endianness::Little);
        buf.write_var_size(10);
        buf.write_bytes(b"abc");
        assert!(buf.read_string().is_err());
    }

    #[rstest]
    #[case::little(Endianness::Little, vec![0x34, 0x12, 0x78, 0x56, 0x34, 0x12])]
    #[case::big(Endianness::Big, vec![0x12, 0x34, 0x12, 0x34, 0x56, 0x78])]
    fn test_endianness(#[case] endianness: Endianness, #[case] expected: Vec<u8>) {
        let mut buf = ByteBuffer::new(endianness);
        buf.write_u16(0x1234);
        buf.write_u32(0x1234_5678);
        assert_eq!(buf.as_bytes(), expected.as_slice());

        assert_eq!(buf.try_read_u16().unwrap(), 0x1234);
        assert_eq!(buf.try_read_u32().unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_native_endianness_probe() {
        let expected = if cfg!(target_endian = "little") { Endianness::Little } else { Endianness::Big };
        assert_eq!(Endianness::native(), expected);
    }

    #[test]
    fn test_short_read_returns_available() {
        let mut buf = ByteBuffer::new(Endianness::Little);
        buf.write_bytes(&[1, 2, 3]);

        let mut out = [0u8; 8];
        assert_eq!(buf.read_into(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert_eq!(buf.read_into(&mut out), 0);
        assert!(buf.try_read_u16().is_err());
    }

    #[test]
    fn test_growth_keeps_data() {
        let mut buf = ByteBuffer::with_capacity(Endianness::Little, 2);
        for i in 0..200u8 {
            buf.write_u8(i);
        }
        assert!(buf.capacity() >= 200);
        assert_eq!(buf.len(), 200);
        assert_eq!(buf.read_bytes(1000), (0..200u8).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn test_overwrite_at_start() {
        let mut buf = ByteBuffer::new(Endianness::Little);
        buf.write_bytes(&[0, 0, 9, 9]);
        let end = buf.write_position();
        buf.set_write_position(0);
        buf.write_u16(0x0201);
        buf.set_write_position(end);
        buf.write_u8(7);
        assert_eq!(buf.as_bytes(), &[1, 2, 9, 9, 7]);
    }
}
