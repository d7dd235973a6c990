//! Implementation for parsing and encoding relay cells.
//!
//! A relay cell is the body of a RELAY channel message, onion-encrypted
//! for a single hop of a circuit.  Its header carries the relay command,
//! the "recognized" field (zero after successful decryption at the
//! intended hop), the stream ID, a running digest, and the body length.

pub mod msg;

use std::num::NonZeroU16;

use crate::chancell::{BoxedCellBody, CELL_DATA_LEN};
use crate::reader::Reader;
use crate::relaycell::msg::RelayMsg;
use crate::writer::Writer;
use crate::{Error, Result};

use caret::caret_int;
use rand::{CryptoRng, Rng};

caret_int! {
    /// A command that identifies the type of a relay cell.
    pub struct RelayCmd(u8) {
        /// Start a new stream.
        BEGIN = 1,
        /// Data on a stream.
        DATA = 2,
        /// Close a stream.
        END = 3,
        /// Acknowledge a BEGIN; stream is open.
        CONNECTED = 4,
        /// Used for flow control.
        SENDME = 5,
        /// Extend a circuit to a new hop; deprecated.
        EXTEND = 6,
        /// Reply to EXTEND handshake; deprecated.
        EXTENDED = 7,
        /// Partially close a circuit.
        TRUNCATE = 8,
        /// Circuit has been partially closed.
        TRUNCATED = 9,
        /// Padding cell.
        DROP = 10,
        /// Start a DNS lookup.
        RESOLVE = 11,
        /// Reply to a DNS lookup.
        RESOLVED = 12,
        /// Start a directory stream.
        BEGIN_DIR = 13,
        /// Extend a circuit to a new hop.
        EXTEND2 = 14,
        /// Reply to an EXTEND2 cell.
        EXTENDED2 = 15,
    }
}

/// Possible requirements on stream IDs for a relay command.
enum StreamIdReq {
    /// Can only be used with a stream ID of 0.
    WantNone,
    /// Can only be used with a stream ID that isn't 0.
    WantSome,
    /// Can be used with any stream ID.
    Any,
}

impl RelayCmd {
    /// Check whether this command requires a certain kind of StreamId, and
    /// return a corresponding StreamIdReq.
    fn expects_streamid(self) -> StreamIdReq {
        match self {
            RelayCmd::BEGIN
            | RelayCmd::DATA
            | RelayCmd::END
            | RelayCmd::CONNECTED
            | RelayCmd::RESOLVE
            | RelayCmd::RESOLVED
            | RelayCmd::BEGIN_DIR => StreamIdReq::WantSome,
            RelayCmd::EXTEND
            | RelayCmd::EXTENDED
            | RelayCmd::TRUNCATE
            | RelayCmd::TRUNCATED
            | RelayCmd::DROP
            | RelayCmd::EXTEND2
            | RelayCmd::EXTENDED2 => StreamIdReq::WantNone,
            // SENDME may be circuit-level (no stream ID) or stream-level.
            RelayCmd::SENDME => StreamIdReq::Any,
            _ => StreamIdReq::Any,
        }
    }

    /// Return true if this command is one that accepts the particular
    /// stream ID `id`.
    pub fn accepts_streamid_val(self, id: Option<StreamId>) -> bool {
        match self.expects_streamid() {
            StreamIdReq::WantNone => id.is_none(),
            StreamIdReq::WantSome => id.is_some(),
            StreamIdReq::Any => true,
        }
    }
}

/// Identify a single stream on a circuit.
///
/// These identifiers are local to each hop on a circuit.  This can't be
/// zero; if you need something that can be zero in the protocol, use
/// `Option<StreamId>`.
#[derive(Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct StreamId(NonZeroU16);

impl From<NonZeroU16> for StreamId {
    fn from(id: NonZeroU16) -> Self {
        Self(id)
    }
}
impl From<StreamId> for NonZeroU16 {
    fn from(id: StreamId) -> NonZeroU16 {
        id.0
    }
}
impl From<StreamId> for u16 {
    fn from(id: StreamId) -> u16 {
        id.0.get()
    }
}
impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}
impl StreamId {
    /// Creates a `StreamId` for non-zero `stream_id`.
    ///
    /// Returns `None` when `stream_id` is zero.  Messages with a zero/None
    /// stream ID apply to the circuit as a whole.
    pub fn new(stream_id: u16) -> Option<Self> {
        NonZeroU16::new(stream_id).map(Self)
    }

    /// Convenience function to convert to a `u16`; `None` is mapped to 0.
    pub fn get_or_zero(stream_id: Option<Self>) -> u16 {
        match stream_id {
            Some(stream_id) => stream_id.0.get(),
            None => 0,
        }
    }
}

/// Byte offsets of the fields of the relay header within a cell body.
///
/// The layout is: command (1 byte), recognized (2), stream ID (2),
/// digest (4), length (2), then data.
pub mod fields {
    use std::ops::Range;
    /// Range of the "recognized" field.
    pub const RECOGNIZED_RANGE: Range<usize> = 1..3;
    /// Range of the stream-ID field.
    pub const STREAMID_RANGE: Range<usize> = 3..5;
    /// Range of the digest field.
    pub const DIGEST_RANGE: Range<usize> = 5..9;
    /// Length of the whole header.
    pub const HEADER_LEN: usize = 11;
    /// An all-zero value to substitute for the digest when computing it.
    pub const EMPTY_DIGEST: [u8; 4] = [0; 4];
}

/// The maximum amount of data payload that a single relay cell can carry.
pub const RELAY_DATA_LEN: usize = CELL_DATA_LEN - fields::HEADER_LEN;

/// A decoded relay message, together with the stream ID it was addressed
/// to (if any).
///
/// This type is the only place where the inner relay structure is parsed
/// or emitted.
#[derive(Debug)]
pub struct AnyRelayMsgOuter {
    /// The stream ID for the stream that this msg corresponds to.
    streamid: Option<StreamId>,
    /// The message for the relay cell.
    msg: msg::AnyRelayMsg,
}

impl AnyRelayMsgOuter {
    /// Construct a new relay message addressed to an optional stream.
    pub fn new(streamid: Option<StreamId>, msg: msg::AnyRelayMsg) -> Self {
        AnyRelayMsgOuter { streamid, msg }
    }

    /// Consume this cell and return its components.
    pub fn into_streamid_and_msg(self) -> (Option<StreamId>, msg::AnyRelayMsg) {
        (self.streamid, self.msg)
    }

    /// Return the command for this cell.
    pub fn cmd(&self) -> RelayCmd {
        self.msg.cmd()
    }

    /// Return the stream ID for the stream that this cell corresponds to.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.streamid
    }

    /// Return a reference to the underlying message of this cell.
    pub fn msg(&self) -> &msg::AnyRelayMsg {
        &self.msg
    }

    /// Consume this cell and return the underlying message.
    pub fn into_msg(self) -> msg::AnyRelayMsg {
        self.msg
    }

    /// Consume this relay message and encode it as a 509-byte padded cell
    /// body.
    ///
    /// The digest and recognized fields are left as zero; the cryptographic
    /// layer fills them in when the cell is encrypted.  The unused tail of
    /// the body is filled with random bytes so that padding is not
    /// distinguishable from data.
    pub fn encode<R: Rng + CryptoRng>(self, rng: &mut R) -> Result<BoxedCellBody> {
        use msg::RelayMsg as _;
        let mut body = Box::new([0_u8; CELL_DATA_LEN]);
        let mut w: Vec<u8> = Vec::with_capacity(CELL_DATA_LEN);
        w.write_u8(self.msg.cmd().into());
        w.write_u16(0); // recognized
        w.write_u16(StreamId::get_or_zero(self.streamid));
        w.write_u32(0); // digest
        w.write_u16(0); // length; to be filled in
        self.msg.encode_onto(&mut w)?;
        let datalen = w.len() - fields::HEADER_LEN;
        let datalen = u16::try_from(datalen)
            .map_err(|_| Error::CantEncode("relay message body too long"))?;
        if (datalen as usize) > RELAY_DATA_LEN {
            return Err(Error::CantEncode("relay message body too long"));
        }
        w[9..11].copy_from_slice(&datalen.to_be_bytes());
        body[..w.len()].copy_from_slice(&w[..]);
        rng.fill_bytes(&mut body[w.len()..]);
        Ok(body)
    }

    /// Parse a relay cell body (after decryption) into a message.
    pub fn decode(body: BoxedCellBody) -> Result<Self> {
        /// Wrap a decoding error with context.
        fn wrap_err(e: crate::BytesError) -> Error {
            Error::from_bytes_err(e, "relay cell")
        }
        let mut r = Reader::from_slice(&body[..]);
        let cmd: RelayCmd = r.take_u8().map_err(wrap_err)?.into();
        r.advance(2).map_err(wrap_err)?; // recognized
        let streamid = StreamId::new(r.take_u16().map_err(wrap_err)?);
        r.advance(4).map_err(wrap_err)?; // digest
        let len = r.take_u16().map_err(wrap_err)? as usize;
        if r.remaining() < len {
            return Err(Error::CircProto("Invalid length on relay cell".into()));
        }
        if !cmd.accepts_streamid_val(streamid) {
            return Err(Error::CircProto(format!(
                "Invalid stream ID {} for relay command {}",
                StreamId::get_or_zero(streamid),
                cmd
            )));
        }
        let mut data = Reader::from_slice(r.take(len).map_err(wrap_err)?);
        let msg = msg::AnyRelayMsg::decode_from_reader(cmd, &mut data)?;
        Ok(AnyRelayMsgOuter { streamid, msg })
    }
}
