//! Definitions for the various channel messages, and the `AnyChanMsg`
//! union of all of them.

use super::{BoxedCellBody, ChanCmd, ChanMsg, RawCellBody, CELL_DATA_LEN};
use crate::reader::Reader;
use crate::writer::Writer;
use crate::{BytesResult, Error, Result};

use caret::caret_int;

/// Trait for the body of a channel message: everything except the
/// command (and, for variable-length cells, the length).
trait Body: Sized {
    /// Decode a channel cell body from a provided reader.
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self>;
    /// Write this cell body onto the provided writer.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()>;
}

/// A PADDING message is a fixed-length message, dropped on reception.
///
/// Padding exists to make traffic analysis harder; we don't currently
/// generate it, but we must accept it.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Padding {}
impl Padding {
    /// Create a new fixed-length padding message.
    pub fn new() -> Self {
        Padding {}
    }
}
impl Body for Padding {
    fn take_from(_r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Padding {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> Result<()> {
        Ok(())
    }
}

/// A CREATE_FAST message creates a circuit hop with no public-key
/// operations: the client sends raw key material, and the relay's reply
/// mixes in its own.
///
/// This handshake provides no authentication at all beyond what the
/// underlying connection already gave us, so it is only appropriate for
/// the first hop of a circuit.
#[derive(Clone, Debug)]
pub struct CreateFast {
    /// The key material (X) that we send.
    handshake: Vec<u8>,
}
impl CreateFast {
    /// Create a new CreateFast message with the given key material.
    pub fn new<B: Into<Vec<u8>>>(handshake: B) -> Self {
        CreateFast {
            handshake: handshake.into(),
        }
    }
    /// Return the key material for this message.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake
    }
}
impl Body for CreateFast {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let handshake = r.take(r.remaining())?.into();
        Ok(CreateFast { handshake })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A CREATED_FAST message completes a CREATE_FAST handshake.
#[derive(Clone, Debug)]
pub struct CreatedFast {
    /// The relay's key material (Y) and derived-key check.
    handshake: Vec<u8>,
}
impl CreatedFast {
    /// Create a new CreatedFast message with the given body.
    pub fn new<B: Into<Vec<u8>>>(handshake: B) -> Self {
        CreatedFast {
            handshake: handshake.into(),
        }
    }
    /// Consume this message and return the relay's handshake material.
    pub fn into_body(self) -> Vec<u8> {
        self.handshake
    }
}
impl Body for CreatedFast {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let handshake = r.take(r.remaining())?.into();
        Ok(CreatedFast { handshake })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A CREATE2 message creates a circuit hop using a typed, public-key
/// handshake.
#[derive(Clone, Debug)]
pub struct Create2 {
    /// Identifier for what kind of handshake this is.
    handshake_type: u16,
    /// Body of the handshake.
    handshake: Vec<u8>,
}
impl Create2 {
    /// Wrap a typed handshake as a Create2 message.
    pub fn new<B: Into<Vec<u8>>>(handshake_type: u16, handshake: B) -> Self {
        Create2 {
            handshake_type,
            handshake: handshake.into(),
        }
    }
    /// Return the type of this handshake.
    pub fn handshake_type(&self) -> u16 {
        self.handshake_type
    }
    /// Return the body of this handshake.
    pub fn body(&self) -> &[u8] {
        &self.handshake
    }
}
impl Body for Create2 {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let handshake_type = r.take_u16()?;
        let hlen = r.take_u16()?;
        let handshake = r.take(hlen as usize)?.into();
        Ok(Create2 {
            handshake_type,
            handshake,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_u16(self.handshake_type);
        let handshake_len = u16::try_from(self.handshake.len())
            .map_err(|_| Error::CantEncode("oversized handshake"))?;
        w.write_u16(handshake_len);
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A CREATED2 message completes a circuit-creation handshake.
#[derive(Clone, Debug)]
pub struct Created2 {
    /// Body of the handshake reply.
    handshake: Vec<u8>,
}
impl Created2 {
    /// Create a new Created2 message to hold a given handshake reply.
    pub fn new<B: Into<Vec<u8>>>(handshake: B) -> Self {
        Created2 {
            handshake: handshake.into(),
        }
    }
    /// Consume this message and return its body.
    pub fn into_body(self) -> Vec<u8> {
        self.handshake
    }
}
impl Body for Created2 {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let hlen = r.take_u16()?;
        let handshake = r.take(hlen as usize)?.into();
        Ok(Created2 { handshake })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        let handshake_len = u16::try_from(self.handshake.len())
            .map_err(|_| Error::CantEncode("oversized handshake"))?;
        w.write_u16(handshake_len);
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A RELAY message, transmitted over a circuit.
///
/// The contents are onion-encrypted for one hop of the circuit; a
/// different protocol, defined in [`crate::relaycell`], is carried
/// inside.
#[derive(Clone)]
pub struct Relay {
    /// The contents of the relay cell as encoded for transfer.
    body: BoxedCellBody,
}
impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't dump 509 (encrypted) bytes into the log.
        f.debug_struct("Relay").finish_non_exhaustive()
    }
}
impl Relay {
    /// Construct a Relay message from a slice containing its contents.
    ///
    /// # Panics
    ///
    /// Panics if `body` is longer than a cell body; that is a programming
    /// error in the caller.
    pub fn new<P: AsRef<[u8]>>(body: P) -> Self {
        let body = body.as_ref();
        let mut r = [0_u8; CELL_DATA_LEN];
        r[..body.len()].copy_from_slice(body);
        Relay { body: Box::new(r) }
    }
    /// Construct a Relay message from its body.
    pub fn from_raw(body: RawCellBody) -> Self {
        Relay {
            body: Box::new(body),
        }
    }
    /// Consume this Relay message and return a BoxedCellBody for
    /// encryption or decryption.
    pub fn into_relay_body(self) -> BoxedCellBody {
        self.body
    }
}
impl Body for Relay {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let mut body = Box::new([0_u8; CELL_DATA_LEN]);
        body.copy_from_slice(r.take(CELL_DATA_LEN)?);
        Ok(Relay { body })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_all(&self.body[..]);
        Ok(())
    }
}

caret_int! {
    /// Declared reason for ending a circuit.
    pub struct DestroyReason(u8) {
        /// No reason given.
        ///
        /// This is the only reason that clients send.
        NONE = 0,
        /// Protocol violation.
        PROTOCOL = 1,
        /// Internal error.
        INTERNAL = 2,
        /// Client sent a TRUNCATE command.
        REQUESTED = 3,
        /// Relay is hibernating and not accepting requests.
        HIBERNATING = 4,
        /// Ran out of memory, sockets, or circuit IDs.
        RESOURCELIMIT = 5,
        /// Couldn't connect to relay.
        CONNECTFAILED = 6,
        /// Connected to a relay, but its OR identity wasn't as requested.
        OR_IDENTITY = 7,
        /// The connection carrying this circuit died.
        CHANNEL_CLOSED = 8,
        /// Circuit expired for being too dirty or old.
        FINISHED = 9,
        /// Circuit construction took too long.
        TIMEOUT = 10,
        /// Circuit was destroyed without client truncate.
        DESTROYED = 11,
        /// Request for unknown onion service.
        NOSUCHSERVICE = 12,
    }
}

impl DestroyReason {
    /// Return a human-readable string for this reason.
    pub fn human_str(&self) -> &'static str {
        match *self {
            DestroyReason::NONE => "No reason",
            DestroyReason::PROTOCOL => "Protocol violation",
            DestroyReason::INTERNAL => "Internal error",
            DestroyReason::REQUESTED => "Client sent a TRUNCATE command",
            DestroyReason::HIBERNATING => "Relay is hibernating and not accepting requests",
            DestroyReason::RESOURCELIMIT => "Relay ran out of resources",
            DestroyReason::CONNECTFAILED => "Couldn't connect to relay",
            DestroyReason::OR_IDENTITY => "Connected to relay with different OR identity",
            DestroyReason::CHANNEL_CLOSED => "The connection carrying this circuit died",
            DestroyReason::FINISHED => "Circuit expired for being too dirty or old",
            DestroyReason::TIMEOUT => "Circuit construction took too long",
            DestroyReason::DESTROYED => "Circuit was destroyed without client truncate",
            DestroyReason::NOSUCHSERVICE => "No such onion service",
            _ => "Unrecognized reason",
        }
    }
}

/// A DESTROY message tears down a circuit.
///
/// On receiving a DESTROY, an implementation should tear down the
/// associated circuit, implicitly closing all streams on it.
#[derive(Clone, Debug)]
pub struct Destroy {
    /// Reason code given for tearing down this circuit.
    reason: DestroyReason,
}
impl Destroy {
    /// Create a new destroy message.
    pub fn new(reason: DestroyReason) -> Self {
        Destroy { reason }
    }
    /// Return the provided reason for destroying the circuit.
    pub fn reason(&self) -> DestroyReason {
        self.reason
    }
}
impl Body for Destroy {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let reason = r.take_u8()?.into();
        Ok(Destroy { reason })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_u8(self.reason.into());
        Ok(())
    }
}

/// A channel message of a type we do not handle.
///
/// We need to be able to carry these around (for instance, to skip over
/// padding variants we don't implement), but we never look inside them.
#[derive(Clone, Debug)]
pub struct Unrecognized {
    /// The channel command that we don't understand.
    cmd: ChanCmd,
    /// The contents of the message.
    content: Vec<u8>,
}
impl Unrecognized {
    /// Construct an unrecognized message, copying the remainder of the
    /// reader as its body.
    fn decode(cmd: ChanCmd, r: &mut Reader<'_>) -> BytesResult<Self> {
        let content = r.take(r.remaining())?.into();
        Ok(Unrecognized { cmd, content })
    }
    /// Return the command for this message.
    pub fn cmd(&self) -> ChanCmd {
        self.cmd
    }
}
impl Body for Unrecognized {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        // The command is filled in by the caller.
        Self::decode(0.into(), r)
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_all(&self.content);
        Ok(())
    }
}

/// Helper: declare the `AnyChanMsg` enum and its `ChanMsg` dispatch.
macro_rules! chanmsg_enum {
    (
        $( $(#[$meta:meta])* $name:ident => $cmd:ident ),* $(,)?
    ) => {
        /// A decoded channel message of any type we recognize.
        #[derive(Clone, Debug)]
        #[non_exhaustive]
        pub enum AnyChanMsg {
            $(
                $(#[$meta])*
                $name($name),
            )*
            /// A message of a type we don't recognize.
            Unrecognized(Unrecognized),
        }

        impl ChanMsg for AnyChanMsg {
            fn cmd(&self) -> ChanCmd {
                match self {
                    $( AnyChanMsg::$name(_) => ChanCmd::$cmd, )*
                    AnyChanMsg::Unrecognized(m) => m.cmd(),
                }
            }
            fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
                match self {
                    $( AnyChanMsg::$name(m) => m.encode_onto(w), )*
                    AnyChanMsg::Unrecognized(m) => m.encode_onto(w),
                }
            }
            fn decode_from_reader(cmd: ChanCmd, r: &mut Reader<'_>) -> Result<Self> {
                /// Wrap a decoding error with the command being parsed.
                fn wrap(e: crate::BytesError) -> Error {
                    Error::from_bytes_err(e, "channel message")
                }
                Ok(match cmd {
                    $( ChanCmd::$cmd => AnyChanMsg::$name($name::take_from(r).map_err(wrap)?), )*
                    _ => AnyChanMsg::Unrecognized(
                        Unrecognized::decode(cmd, r).map_err(wrap)?,
                    ),
                })
            }
        }

        $(
            impl From<$name> for AnyChanMsg {
                fn from(m: $name) -> AnyChanMsg {
                    AnyChanMsg::$name(m)
                }
            }
        )*
    };
}

chanmsg_enum! {
    /// A fixed-length padding message.
    Padding => PADDING,
    /// Create a circuit with no public-key operations.
    CreateFast => CREATE_FAST,
    /// Response to a CreateFast message.
    CreatedFast => CREATED_FAST,
    /// Create a circuit with a typed handshake.
    Create2 => CREATE2,
    /// Response to a Create2 message.
    Created2 => CREATED2,
    /// A message sent along a circuit, likely to a more-distant relay.
    Relay => RELAY,
    /// Tear down a circuit.
    Destroy => DESTROY,
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// Encode `msg` and decode it again under `cmd`, returning the bytes.
    fn roundtrip(msg: AnyChanMsg) -> AnyChanMsg {
        let cmd = msg.cmd();
        let mut encoded = Vec::new();
        msg.encode_onto(&mut encoded).unwrap();
        let mut r = Reader::from_slice(&encoded[..]);
        AnyChanMsg::decode_from_reader(cmd, &mut r).unwrap()
    }

    #[test]
    fn create_fast() {
        let m = roundtrip(CreateFast::new(&b"a grade of timber"[..]).into());
        match m {
            AnyChanMsg::CreateFast(cf) => assert_eq!(cf.handshake(), b"a grade of timber"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn created_fast() {
        let m = roundtrip(CreatedFast::new(&b"guaranteed"[..]).into());
        match m {
            AnyChanMsg::CreatedFast(cf) => assert_eq!(cf.into_body(), b"guaranteed".to_vec()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn create2() {
        let m = Create2::new(2, &b"hello"[..]);
        assert_eq!(m.handshake_type(), 2);
        assert_eq!(m.body(), b"hello");
        let mut encoded = Vec::new();
        AnyChanMsg::from(m).encode_onto(&mut encoded).unwrap();
        assert_eq!(&encoded[..], &b"\x00\x02\x00\x05hello"[..]);
    }

    #[test]
    fn destroy() {
        let m = Destroy::new(DestroyReason::FINISHED);
        assert_eq!(m.reason(), DestroyReason::FINISHED);
        assert_eq!(m.reason().human_str(), "Circuit expired for being too dirty or old");
        let mut encoded = Vec::new();
        AnyChanMsg::from(m).encode_onto(&mut encoded).unwrap();
        assert_eq!(&encoded[..], &[9_u8][..]);
    }

    #[test]
    fn relay_padded_to_cell_len() {
        let m = Relay::new(&b"stub"[..]);
        let mut encoded = Vec::new();
        AnyChanMsg::from(m).encode_onto(&mut encoded).unwrap();
        assert_eq!(encoded.len(), CELL_DATA_LEN);
        assert_eq!(&encoded[..4], b"stub");
    }

    #[test]
    fn unrecognized() {
        let mut r = Reader::from_slice(&b"wombat"[..]);
        let m = AnyChanMsg::decode_from_reader(77.into(), &mut r).unwrap();
        assert_eq!(m.cmd(), ChanCmd::from(77));
        let mut encoded = Vec::new();
        m.encode_onto(&mut encoded).unwrap();
        assert_eq!(&encoded[..], b"wombat");
    }
}
