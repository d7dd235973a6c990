//! Wrap a velum-cell ChannelCodec for use with the futures_codec crate.

use std::io::Error as IoError;

use asynchronous_codec as futures_codec;
use bytes::BytesMut;
use futures::{AsyncRead, AsyncWrite};
use velum_cell::chancell::{codec, AnyChanCell};

/// An error from a ChannelCodec.
///
/// This is a separate error type for now because the error type we use
/// for the rest of this crate doesn't do everything that a codec error
/// type needs to do.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    /// An error from the underlying IO stream underneath a codec.
    ///
    /// (This isn't wrapped in an Arc, because we don't need this type to
    /// be clone; it's crate-internal.)
    #[error("Io error reading or writing a channel cell")]
    Io(#[from] IoError),
    /// An error from the cell encoding/decoding logic.
    #[error("Error while encoding or decoding a channel cell")]
    Cell(#[from] velum_cell::Error),
}

/// Asynchronous wrapper around a ChannelCodec, with implementations for
/// the futures_codec `Encoder` and `Decoder` traits.
pub struct ChannelCodec(codec::ChannelCodec);

impl ChannelCodec {
    /// Create a new ChannelCodec with a given link protocol version.
    pub fn new(link_version: u16) -> Self {
        ChannelCodec(codec::ChannelCodec::new(link_version))
    }
}

impl futures_codec::Encoder for ChannelCodec {
    type Item = AnyChanCell;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.0.write_cell(item, dst)?;
        Ok(())
    }
}

impl futures_codec::Decoder for ChannelCodec {
    type Item = AnyChanCell;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.0.decode_cell(src)?)
    }
}

/// Type alias: a Sink and Stream that transforms a byte-oriented
/// connection into a cell-based communication mechanism.
pub type CellFrame<T> = futures_codec::Framed<T, ChannelCodec>;

/// Wrap a byte-oriented connection (such as a TLS stream) as a
/// [`CellFrame`] speaking the given link protocol version.
pub fn new_frame<T>(io: T, link_version: u16) -> CellFrame<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    futures_codec::Framed::new(io, ChannelCodec::new(link_version))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use asynchronous_codec::{Decoder as _, Encoder as _};
    use velum_cell::chancell::msg::{self, AnyChanMsg};
    use velum_cell::chancell::{ChanCell, CircId};

    #[test]
    fn codec_roundtrip() {
        let mut codec = ChannelCodec::new(4);
        let mut buf = BytesMut::new();
        let cell = ChanCell::new(
            CircId::new(0x8000_0001),
            msg::CreateFast::new(&b"hello"[..]).into(),
        );
        codec.encode(cell, &mut buf).unwrap();
        assert_eq!(buf.len(), 514);

        let cell = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(cell.circid(), CircId::new(0x8000_0001));
        assert!(matches!(cell.msg(), AnyChanMsg::CreateFast(_)));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
