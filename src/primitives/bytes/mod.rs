#![forbid(unsafe_code)]
//! Fixed-width and varint codecs used by page layouts and the redo log.

pub mod mach {
    //! Big-endian fixed-width fields at absolute offsets inside a page.
    //!
    //! Out-of-range offsets are programming errors and panic.

    /// Copies a slice of exactly `N` bytes into an array.
    #[inline]
    pub(crate) fn array<const N: usize>(src: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(src);
        out
    }

    /// Reads one byte.
    #[inline]
    pub fn read_u8(src: &[u8], off: usize) -> u8 {
        src[off]
    }

    /// Reads a big-endian u16.
    #[inline]
    pub fn read_u16(src: &[u8], off: usize) -> u16 {
        u16::from_be_bytes(array(&src[off..off + 2]))
    }

    /// Reads a big-endian u32.
    #[inline]
    pub fn read_u32(src: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(array(&src[off..off + 4]))
    }

    /// Reads a big-endian u64.
    #[inline]
    pub fn read_u64(src: &[u8], off: usize) -> u64 {
        u64::from_be_bytes(array(&src[off..off + 8]))
    }

    /// Writes one byte.
    #[inline]
    pub fn write_u8(dst: &mut [u8], off: usize, v: u8) {
        dst[off] = v;
    }

    /// Writes a big-endian u16.
    #[inline]
    pub fn write_u16(dst: &mut [u8], off: usize, v: u16) {
        dst[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u32.
    #[inline]
    pub fn write_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Writes a big-endian u64.
    #[inline]
    pub fn write_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }
}

pub mod var {
    //! Unsigned LEB128 varints.

    use crate::types::{Result, UndoError};

    /// Largest number of bytes a u64 varint can occupy.
    pub const MAX_LEN: usize = 10;

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Number of bytes [`encode_u64`] produces for `v`.
    pub fn encoded_len(v: u64) -> usize {
        let bits = 64 - v.leading_zeros() as usize;
        bits.max(1).div_ceil(7)
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..MAX_LEN {
            let byte = *src
                .get(*off)
                .ok_or(UndoError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == MAX_LEN - 1 && payload > 1 {
                return Err(UndoError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(UndoError::Corruption("varint longer than 10 bytes"))
    }
}

pub mod buf {
    //! A slice-backed cursor for parsing redo payloads.

    use core::fmt;

    use super::var;
    use crate::types::{Result, UndoError};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, failing if the buffer is too short.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(UndoError::Corruption("cursor offset overflow"))?;
            if end > self.buf.len() {
                return Err(UndoError::Corruption("cursor take beyond buffer"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            Ok(u16::from_be_bytes(super::mach::array(self.take(2)?)))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            Ok(u32::from_be_bytes(super::mach::array(self.take(4)?)))
        }

        /// Reads an unsigned varint.
        pub fn var_u64(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Returns true once every byte has been consumed.
        pub fn is_empty(&self) -> bool {
            self.remaining() == 0
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{buf::Cursor, mach, var};
    use proptest::prelude::*;

    #[test]
    fn mach_fields_are_big_endian() {
        let mut page = [0u8; 16];
        mach::write_u16(&mut page, 2, 0x0102);
        mach::write_u32(&mut page, 4, 0x0304_0506);
        mach::write_u64(&mut page, 8, 0x0708_090a_0b0c_0d0e);
        assert_eq!(&page[2..4], &[1, 2]);
        assert_eq!(&page[4..8], &[3, 4, 5, 6]);
        assert_eq!(mach::read_u16(&page, 2), 0x0102);
        assert_eq!(mach::read_u32(&page, 4), 0x0304_0506);
        assert_eq!(mach::read_u64(&page, 8), 0x0708_090a_0b0c_0d0e);
    }

    #[test]
    #[should_panic]
    fn mach_out_of_range_panics() {
        let page = [0u8; 4];
        let _ = mach::read_u32(&page, 2);
    }

    #[test]
    fn varint_edges() {
        let mut buf = Vec::new();
        var::encode_u64(0, &mut buf);
        assert_eq!(buf, vec![0]);
        let mut off = 0;
        assert_eq!(var::decode_u64(&buf, &mut off).unwrap(), 0);

        buf.clear();
        var::encode_u64(u64::MAX, &mut buf);
        assert_eq!(buf.len(), var::MAX_LEN);
        off = 0;
        assert_eq!(var::decode_u64(&buf, &mut off).unwrap(), u64::MAX);
        assert_eq!(off, buf.len());
    }

    #[test]
    fn varint_decode_rejects_truncated() {
        let data = vec![0x80];
        let mut off = 0;
        assert!(var::decode_u64(&data, &mut off).is_err());
    }

    #[test]
    fn varint_decode_rejects_too_long() {
        let data = vec![0x81; 11];
        let mut off = 0;
        assert!(var::decode_u64(&data, &mut off).is_err());
    }

    #[test]
    fn cursor_reports_overread() {
        let mut cur = Cursor::new(&[1, 2, 3]);
        assert_eq!(cur.u16().unwrap(), 0x0102);
        assert!(cur.u16().is_err());
        assert_eq!(cur.remaining(), 1);
    }

    proptest! {
        #[test]
        fn varint_len_matches_encoding(v in any::<u64>()) {
            let mut buf = Vec::new();
            var::encode_u64(v, &mut buf);
            prop_assert_eq!(buf.len(), var::encoded_len(v));
            let mut off = 0;
            prop_assert_eq!(var::decode_u64(&buf, &mut off).unwrap(), v);
            prop_assert_eq!(off, buf.len());
        }
    }
}
