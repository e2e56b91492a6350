#![forbid(unsafe_code)]
//! Varint and cursor utilities shared by the leaf and metadata codecs.

use crate::types::{FtError, Result};

pub mod var {
    //! Unsigned LEB128 varints.

    use super::{FtError, Result};

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

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(FtError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(FtError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(FtError::Corruption("varint longer than 10 bytes"))
    }
}

pub mod buf {
    //! A slice-backed cursor for parsing images.

    use core::fmt;

    use super::{var, FtError, Result};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(FtError::Corruption("cursor offset overflow"))?;
            if end > self.buf.len() {
                return Err(FtError::Corruption("image truncated"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads a single byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16_be(&mut self) -> Result<u16> {
            let mut arr = [0u8; 2];
            arr.copy_from_slice(self.take(2)?);
            Ok(u16::from_be_bytes(arr))
        }

        /// Reads a big-endian u64.
        pub fn u64_be(&mut self) -> Result<u64> {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(arr))
        }

        /// Reads an unsigned varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads a varint length followed by that many bytes.
        pub fn len_prefixed(&mut self) -> Result<&'a [u8]> {
            let len = usize::try_from(self.varint()?)
                .map_err(|_| FtError::Corruption("length does not fit in memory"))?;
            self.take(len)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
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

    /// Appends a varint length followed by `bytes`.
    pub fn put_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
        var::encode_u64(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }
}
