//! A cursor for consuming a byte slice one field at a time.

use crate::{BytesError, BytesResult};

/// A type for reading messages from a slice of bytes.
///
/// The `Reader` tracks how far into the slice it has consumed; every
/// `take_*` operation advances the cursor or fails with
/// [`BytesError::Truncated`] without consuming anything.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    /// The underlying slice that we're reading from.
    b: &'a [u8],
    /// The current position within the slice.
    off: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader from a slice of bytes.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader { b: slice, off: 0 }
    }

    /// Return the total length of the underlying slice.
    pub fn total_len(&self) -> usize {
        self.b.len()
    }

    /// Return the number of bytes that remain to be read.
    pub fn remaining(&self) -> usize {
        self.b.len() - self.off
    }

    /// Return the rest of the unconsumed bytes, consuming the reader.
    pub fn into_rest(self) -> &'a [u8] {
        &self.b[self.off..]
    }

    /// Skip `n` bytes, or fail if fewer than `n` remain.
    pub fn advance(&mut self, n: usize) -> BytesResult<()> {
        let _ = self.take(n)?;
        Ok(())
    }

    /// Return an error unless the reader is exhausted.
    pub fn should_be_exhausted(&self) -> BytesResult<()> {
        if self.remaining() != 0 {
            return Err(BytesError::ExtraneousBytes);
        }
        Ok(())
    }

    /// Consume and return the next `n` bytes.
    pub fn take(&mut self, n: usize) -> BytesResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(BytesError::Truncated);
        }
        let result = &self.b[self.off..self.off + n];
        self.off += n;
        Ok(result)
    }

    /// Consume and return a single byte.
    pub fn take_u8(&mut self) -> BytesResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Consume and return a big-endian u16.
    pub fn take_u16(&mut self) -> BytesResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Consume and return a big-endian u32.
    pub fn take_u32(&mut self) -> BytesResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Consume bytes up to (but not including) the next `term` byte.
    ///
    /// The terminator itself is consumed but not returned; if no
    /// terminator is present, this is a truncation error.
    pub fn take_until(&mut self, term: u8) -> BytesResult<&'a [u8]> {
        let pos = self.b[self.off..]
            .iter()
            .position(|&x| x == term)
            .ok_or(BytesError::Truncated)?;
        let result = self.take(pos)?;
        self.advance(1)?;
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn bytecursor_read_ok() {
        let bytes = b"On a mountain halfway between Reno and Rome";
        let mut r = Reader::from_slice(&bytes[..]);

        assert_eq!(r.take(2).unwrap(), &b"On"[..]);
        assert_eq!(r.total_len(), 44);
        r.advance(1).unwrap();
        assert_eq!(r.take_u8().unwrap(), 0x61);
        assert_eq!(r.take_u16().unwrap(), 0x206d);
        assert_eq!(r.take_u32().unwrap(), 0x6f756e74);
        assert_eq!(r.remaining(), 33);
        r.advance(32).unwrap();
        assert!(r.should_be_exhausted().is_err());
        r.advance(1).unwrap();
        r.should_be_exhausted().unwrap();
    }

    #[test]
    fn read_errors() {
        let mut r = Reader::from_slice(&b"ab"[..]);
        assert_eq!(r.take_u32(), Err(BytesError::Truncated));
        assert_eq!(r.take_u16().unwrap(), 0x6162);
        assert_eq!(r.take_u8(), Err(BytesError::Truncated));
    }

    #[test]
    fn take_until() {
        let mut r = Reader::from_slice(&b"hello:world\0rest"[..]);
        assert_eq!(r.take_until(0).unwrap(), &b"hello:world"[..]);
        assert_eq!(r.into_rest(), &b"rest"[..]);

        let mut r = Reader::from_slice(&b"no terminator"[..]);
        assert_eq!(r.take_until(0), Err(BytesError::Truncated));
    }
}
