//! A trait for writing messages onto a growable byte buffer.

use bytes::{BufMut, BytesMut};

/// An object that accepts bytes of an encoded message.
///
/// Writes are infallible: every implementation is a growable buffer.
/// Length-limit checks (such as "does this fit in a cell body?") are the
/// encoder's job, not the writer's.
pub trait Writer {
    /// Append the contents of `bytes` to the writer.
    fn write_all(&mut self, bytes: &[u8]);

    /// Append a single byte.
    fn write_u8(&mut self, x: u8) {
        self.write_all(&[x]);
    }

    /// Append a big-endian u16.
    fn write_u16(&mut self, x: u16) {
        self.write_all(&x.to_be_bytes());
    }

    /// Append a big-endian u32.
    fn write_u32(&mut self, x: u32) {
        self.write_all(&x.to_be_bytes());
    }

    /// Append `n` zero bytes.
    fn write_zeros(&mut self, n: usize) {
        let zeros = vec![0_u8; n];
        self.write_all(&zeros[..]);
    }
}

impl Writer for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl Writer for BytesMut {
    fn write_all(&mut self, bytes: &[u8]) {
        self.put_slice(bytes);
    }
}
