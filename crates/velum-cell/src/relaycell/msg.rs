//! Encoding and decoding for relay messages.
//!
//! Relay messages are sent along circuits, inside RELAY cells.

use super::{RelayCmd, RELAY_DATA_LEN};
use crate::chancell::msg::DestroyReason;
use crate::reader::Reader;
use crate::writer::Writer;
use crate::{BytesError, BytesResult, Error, Result};

use caret::caret_int;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Trait implemented by anything that can serve as a relay message.
pub trait RelayMsg {
    /// Return the stream command associated with this message.
    fn cmd(&self) -> RelayCmd;
    /// Encode the body of this message, not including command or length.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()>;
    /// Extract the body of a message with command `cmd` from reader `r`.
    fn decode_from_reader(cmd: RelayCmd, r: &mut Reader<'_>) -> Result<Self>
    where
        Self: Sized;
}

/// Internal: traits to implement a single relay message type.
trait Body: Sized {
    /// Decode a relay cell body from a provided reader.
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self>;
    /// Encode the body of this cell into the end of a writer.
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()>;
}

/// A Begin message creates a new data stream.
///
/// Upon receiving a Begin message, relays should try to open a new stream
/// for the client, if their exit policy permits, and associate it with a
/// new TCP connection to the target address.
#[derive(Debug, Clone)]
pub struct Begin {
    /// Ascii string describing target address.
    addr: Vec<u8>,
    /// Target port.
    port: u16,
    /// Flags that describe how to resolve the address.
    flags: u32,
}

impl Begin {
    /// Construct a new Begin cell.
    pub fn new(addr: &str, port: u16, flags: u32) -> Result<Self> {
        if !addr.is_ascii() {
            return Err(Error::BadStreamAddress);
        }
        let mut addr = addr.to_string();
        addr.make_ascii_lowercase();
        Ok(Begin {
            addr: addr.into_bytes(),
            port,
            flags,
        })
    }

    /// Return the address requested in this message.
    pub fn addr(&self) -> &[u8] {
        &self.addr
    }

    /// Return the port requested by this message.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the set of flags provided in this message.
    pub fn flags(&self) -> u32 {
        self.flags
    }
}

impl Body for Begin {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let addr_and_port = r.take_until(0)?;
        let colon_pos = addr_and_port
            .iter()
            .rposition(|&b| b == b':')
            .ok_or(BytesError::BadMessage("missing port in begin cell"))?;
        let (addr, port_str) = addr_and_port.split_at(colon_pos);
        let port_str = &port_str[1..];
        let port = std::str::from_utf8(port_str)
            .map_err(|_| BytesError::BadMessage("port in begin cell not utf8"))?;
        let port = port
            .parse()
            .map_err(|_| BytesError::BadMessage("port in begin cell not a valid port"))?;
        let flags = if r.remaining() >= 4 { r.take_u32()? } else { 0 };
        Ok(Begin {
            addr: addr.into(),
            port,
            flags,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_all(&self.addr);
        w.write_u8(b':');
        w.write_all(self.port.to_string().as_bytes());
        w.write_u8(0);
        if self.flags != 0 {
            w.write_u32(self.flags);
        }
        Ok(())
    }
}

/// A BeginDir message creates a new directory stream to the relay that
/// receives it.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct BeginDir {}

impl BeginDir {
    /// Construct a new BeginDir message.
    pub fn new() -> Self {
        BeginDir {}
    }
}

impl Body for BeginDir {
    fn take_from(_r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(BeginDir {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> Result<()> {
        Ok(())
    }
}

/// A Data message represents data sent along a stream.
///
/// Upon receiving a Data message for a live stream, the client or exit
/// sends that data onto the associated TCP connection.
#[derive(Debug, Clone)]
pub struct Data {
    /// Contents of the cell, to be sent on a specific stream.
    body: Vec<u8>,
}

impl Data {
    /// The longest allowable body length for a single data cell.
    pub const MAXLEN: usize = RELAY_DATA_LEN;

    /// Construct a new data cell.
    ///
    /// Returns an error if `inp` is longer than [`Data::MAXLEN`] bytes.
    pub fn new(inp: &[u8]) -> Result<Self> {
        if inp.len() > Data::MAXLEN {
            return Err(Error::CantEncode("Data message too long"));
        }
        Ok(Self::new_unchecked(inp.into()))
    }

    /// Construct a new data cell from the front of `inp`, taking as many
    /// bytes as fit; return the cell and the remainder.
    pub fn try_split_from(inp: &[u8]) -> (Self, &[u8]) {
        let len = std::cmp::min(inp.len(), Data::MAXLEN);
        let (data, remainder) = inp.split_at(len);
        (Self::new_unchecked(data.into()), remainder)
    }

    /// Construct a new data cell from a provided vector of bytes, without
    /// checking the length.
    fn new_unchecked(body: Vec<u8>) -> Self {
        Data { body }
    }
}
impl From<Data> for Vec<u8> {
    fn from(data: Data) -> Vec<u8> {
        data.body
    }
}
impl AsRef<[u8]> for Data {
    fn as_ref(&self) -> &[u8] {
        &self.body
    }
}

impl Body for Data {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Data {
            body: r.take(r.remaining())?.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_all(&self.body);
        Ok(())
    }
}

caret_int! {
    /// A declared reason for closing a stream.
    pub struct EndReason(u8) {
        /// Closing a stream because of an unspecified reason.
        ///
        /// This is the only reason that clients send.
        MISC = 1,
        /// Couldn't look up hostname.
        RESOLVEFAILED = 2,
        /// Remote host refused connection.
        CONNECTREFUSED = 3,
        /// Connection prohibited by exit policy.
        EXITPOLICY = 4,
        /// Circuit destroyed.
        DESTROY = 5,
        /// Anonymized TCP connection was closed.
        DONE = 6,
        /// Connection timed out, or relay gave up on the connection.
        TIMEOUT = 7,
        /// No route to target destination.
        NOROUTE = 8,
        /// Relay is entering hibernation.
        HIBERNATING = 9,
        /// Internal error at the relay.
        INTERNAL = 10,
        /// Ran out of resources to fulfill the request.
        RESOURCELIMIT = 11,
        /// Connection unexpectedly reset.
        CONNRESET = 12,
        /// Tor protocol violation.
        TORPROTOCOL = 13,
        /// BEGIN_DIR cell at a relay that isn't a directory cache.
        NOTDIRECTORY = 14,
    }
}

impl EndReason {
    /// Return a human-readable string for this reason.
    pub fn human_str(&self) -> &'static str {
        match *self {
            EndReason::MISC => "Stream closed for unspecified reason",
            EndReason::RESOLVEFAILED => "Could not resolve hostname",
            EndReason::CONNECTREFUSED => "Remote host refused connection",
            EndReason::EXITPOLICY => "Connection prohibited by exit policy",
            EndReason::DESTROY => "Circuit destroyed",
            EndReason::DONE => "Closed normally",
            EndReason::TIMEOUT => "Connection timed out, or relay gave up on the connection",
            EndReason::NOROUTE => "No route to target destination",
            EndReason::HIBERNATING => "Relay is entering hibernation",
            EndReason::INTERNAL => "Internal error at the relay",
            EndReason::RESOURCELIMIT => "Relay ran out of resources to fulfill the request",
            EndReason::CONNRESET => "Connection unexpectedly reset",
            EndReason::TORPROTOCOL => "Tor protocol violation",
            EndReason::NOTDIRECTORY => "Not a directory cache",
            _ => "Unrecognized reason for ending stream",
        }
    }
}

/// An End message tells the other end of the circuit to close a stream.
#[derive(Debug, Clone)]
pub struct End {
    /// Reason for closing the stream.
    reason: EndReason,
    /// If the reason is EXITPOLICY, this holds the resolved address and
    /// TTL (time-to-live) in seconds for the address.
    addr: Option<(IpAddr, u32)>,
}

impl End {
    /// Make a new End message with no reason.
    pub fn new_misc() -> Self {
        End {
            reason: EndReason::MISC,
            addr: None,
        }
    }
    /// Make a new End message with the provided reason.
    pub fn new_with_reason(reason: EndReason) -> Self {
        End { reason, addr: None }
    }
    /// Make a new End message with an EXITPOLICY reason and address.
    pub fn new_exitpolicy(addr: IpAddr, ttl: u32) -> Self {
        End {
            reason: EndReason::EXITPOLICY,
            addr: Some((addr, ttl)),
        }
    }
    /// Return the provided EndReason for this message.
    pub fn reason(&self) -> EndReason {
        self.reason
    }
}

impl Body for End {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        if r.remaining() == 0 {
            // Historical quirk: an empty End message means MISC.
            return Ok(End {
                reason: EndReason::MISC,
                addr: None,
            });
        }
        let reason: EndReason = r.take_u8()?.into();
        if reason == EndReason::EXITPOLICY {
            let addr = match r.remaining() {
                8 => IpAddr::V4(Ipv4Addr::from(r.take_u32()?)),
                20 => {
                    let mut bytes = [0_u8; 16];
                    bytes.copy_from_slice(r.take(16)?);
                    IpAddr::V6(Ipv6Addr::from(bytes))
                }
                _ => {
                    // Ignore the rest of the message.
                    return Ok(End { reason, addr: None });
                }
            };
            let ttl = r.take_u32()?;
            Ok(End {
                reason,
                addr: Some((addr, ttl)),
            })
        } else {
            Ok(End { reason, addr: None })
        }
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_u8(self.reason.into());
        if let (EndReason::EXITPOLICY, Some((addr, ttl))) = (self.reason, self.addr) {
            match addr {
                IpAddr::V4(v4) => w.write_u32(v4.into()),
                IpAddr::V6(v6) => w.write_all(&v6.octets()),
            }
            w.write_u32(ttl);
        }
        Ok(())
    }
}

/// A Connected message is a successful response to a Begin message.
#[derive(Debug, Clone)]
pub struct Connected {
    /// Resolved address and TTL (time-to-live) in seconds.
    addr: Option<(IpAddr, u32)>,
}

impl Connected {
    /// Construct a new empty connected cell.
    pub fn new_empty() -> Self {
        Connected { addr: None }
    }
    /// Construct a connected cell with an address and a time-to-live value.
    pub fn new_with_addr(addr: IpAddr, ttl: u32) -> Self {
        Connected {
            addr: Some((addr, ttl)),
        }
    }
}

impl Body for Connected {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        if r.remaining() == 0 {
            return Ok(Connected { addr: None });
        }
        let ipv4 = r.take_u32()?;
        let addr = if ipv4 == 0 {
            let addrtype = r.take_u8()?;
            if addrtype != 6 {
                return Err(BytesError::BadMessage(
                    "Invalid address type in CONNECTED cell",
                ));
            }
            let mut bytes = [0_u8; 16];
            bytes.copy_from_slice(r.take(16)?);
            IpAddr::V6(Ipv6Addr::from(bytes))
        } else {
            IpAddr::V4(Ipv4Addr::from(ipv4))
        };
        let ttl = r.take_u32()?;
        Ok(Connected {
            addr: Some((addr, ttl)),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        if let Some((addr, ttl)) = self.addr {
            match addr {
                IpAddr::V4(v4) => w.write_u32(v4.into()),
                IpAddr::V6(v6) => {
                    w.write_u32(0);
                    w.write_u8(6);
                    w.write_all(&v6.octets());
                }
            }
            w.write_u32(ttl);
        }
        Ok(())
    }
}

/// A Sendme message is used to increment the flow-control windows on a
/// stream or a circuit.
///
/// A circuit-level Sendme may carry the digest of the cell it
/// acknowledges, so the other side can authenticate it.
#[derive(Debug, Clone, Default)]
pub struct Sendme {
    /// An optional digest of the cell that we are acknowledging.
    digest: Option<Vec<u8>>,
}

impl Sendme {
    /// Return a new empty (unauthenticated) Sendme message.
    pub fn new_empty() -> Self {
        Sendme { digest: None }
    }
    /// Return a new Sendme message containing an authentication tag.
    pub fn new_tag(x: [u8; 20]) -> Self {
        Sendme {
            digest: Some(x.into()),
        }
    }
    /// Consume this message and return its authentication tag, if any.
    pub fn into_tag(self) -> Option<Vec<u8>> {
        self.digest
    }
}

impl Body for Sendme {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        if r.remaining() == 0 {
            return Ok(Sendme { digest: None });
        }
        let ver = r.take_u8()?;
        match ver {
            0 => Ok(Sendme { digest: None }),
            1 => {
                let dlen = r.take_u16()?;
                Ok(Sendme {
                    digest: Some(r.take(dlen as usize)?.into()),
                })
            }
            _ => Err(BytesError::BadMessage("Unrecognized SENDME version")),
        }
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        if let Some(x) = self.digest {
            w.write_u8(1);
            let dlen =
                u16::try_from(x.len()).map_err(|_| Error::CantEncode("Sendme tag too long"))?;
            w.write_u16(dlen);
            w.write_all(&x);
        }
        Ok(())
    }
}

/// A Truncated message is sent to the client when a circuit has been
/// partially closed from farther along.
#[derive(Debug, Clone)]
pub struct Truncated {
    /// Reason for which the remainder of the circuit was closed.
    reason: DestroyReason,
}

impl Truncated {
    /// Construct a new truncated message.
    pub fn new(reason: DestroyReason) -> Self {
        Truncated { reason }
    }
    /// Get the provided reason to truncate the circuit.
    pub fn reason(&self) -> DestroyReason {
        self.reason
    }
}

impl Body for Truncated {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Truncated {
            reason: r.take_u8()?.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_u8(self.reason.into());
        Ok(())
    }
}

/// A single encoded link specifier in an Extend2 message, identifying the
/// relay that the circuit should be extended to.
///
/// We treat the body as opaque: the directory layer produces these and
/// the receiving relay consumes them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EncodedLinkSpec {
    /// The link specifier type.
    lstype: u8,
    /// The body of the link specifier.
    body: Vec<u8>,
}

impl EncodedLinkSpec {
    /// Construct a new link specifier with a given type and body.
    pub fn new(lstype: u8, body: impl Into<Vec<u8>>) -> Self {
        EncodedLinkSpec {
            lstype,
            body: body.into(),
        }
    }
    /// Return the type of this link specifier.
    pub fn lstype(&self) -> u8 {
        self.lstype
    }
    /// Return the body of this link specifier.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl EncodedLinkSpec {
    /// Decode a single link specifier.
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let lstype = r.take_u8()?;
        let lslen = r.take_u8()?;
        let body = r.take(lslen as usize)?.into();
        Ok(EncodedLinkSpec { lstype, body })
    }
    /// Encode a single link specifier.
    fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.lstype);
        let lslen =
            u8::try_from(self.body.len()).map_err(|_| Error::CantEncode("link spec too long"))?;
        w.write_u8(lslen);
        w.write_all(&self.body);
        Ok(())
    }
}

/// An Extend2 message tells the last relay in a circuit to extend to a
/// new hop, using a typed handshake.
#[derive(Debug, Clone)]
pub struct Extend2 {
    /// A vector of link specifiers, each identifying the target relay.
    linkspec: Vec<EncodedLinkSpec>,
    /// Type of handshake to be sent in a CREATE2 cell.
    handshake_type: u16,
    /// Body of the handshake to be sent in a CREATE2 cell.
    handshake: Vec<u8>,
}

impl Extend2 {
    /// Create a new Extend2 message.
    pub fn new(linkspec: Vec<EncodedLinkSpec>, handshake_type: u16, handshake: Vec<u8>) -> Self {
        Extend2 {
            linkspec,
            handshake_type,
            handshake,
        }
    }

    /// Return the link specifiers in this message.
    pub fn linkspec(&self) -> &[EncodedLinkSpec] {
        &self.linkspec
    }

    /// Return the type of this handshake.
    pub fn handshake_type(&self) -> u16 {
        self.handshake_type
    }

    /// Return the inner handshake of this message.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake
    }
}

impl Body for Extend2 {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let n = r.take_u8()?;
        let mut linkspec = Vec::with_capacity(n as usize);
        for _ in 0..n {
            linkspec.push(EncodedLinkSpec::take_from(r)?);
        }
        let handshake_type = r.take_u16()?;
        let hlen = r.take_u16()?;
        let handshake = r.take(hlen as usize)?.into();
        Ok(Extend2 {
            linkspec,
            handshake_type,
            handshake,
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        let n = u8::try_from(self.linkspec.len())
            .map_err(|_| Error::CantEncode("too many link specifiers"))?;
        w.write_u8(n);
        for ls in &self.linkspec {
            ls.encode_onto(w)?;
        }
        w.write_u16(self.handshake_type);
        let hlen = u16::try_from(self.handshake.len())
            .map_err(|_| Error::CantEncode("oversized handshake"))?;
        w.write_u16(hlen);
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// An Extended2 message is a successful response to an Extend2 message.
#[derive(Debug, Clone)]
pub struct Extended2 {
    /// The body of the handshake reply.
    handshake: Vec<u8>,
}

impl Extended2 {
    /// Construct a new Extended2 message with the provided handshake.
    pub fn new(handshake: Vec<u8>) -> Self {
        Extended2 { handshake }
    }
    /// Consume this extended2 message and return its body.
    pub fn into_body(self) -> Vec<u8> {
        self.handshake
    }
}

impl Body for Extended2 {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        let hlen = r.take_u16()?;
        let handshake = r.take(hlen as usize)?;
        Ok(Extended2 {
            handshake: handshake.into(),
        })
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        let hlen = u16::try_from(self.handshake.len())
            .map_err(|_| Error::CantEncode("oversized handshake"))?;
        w.write_u16(hlen);
        w.write_all(&self.handshake);
        Ok(())
    }
}

/// A Drop message is a long-range padding message, dropped at its
/// destination hop.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Drop {}

impl Drop {
    /// Construct a new drop message.
    pub fn new() -> Self {
        Drop {}
    }
}

impl Body for Drop {
    fn take_from(_r: &mut Reader<'_>) -> BytesResult<Self> {
        Ok(Drop {})
    }
    fn encode_onto<W: Writer + ?Sized>(self, _w: &mut W) -> Result<()> {
        Ok(())
    }
}

/// A relay message of a type we do not handle.
#[derive(Debug, Clone)]
pub struct Unrecognized {
    /// The relay command we don't understand.
    cmd: RelayCmd,
    /// The contents of the message.
    body: Vec<u8>,
}

impl Unrecognized {
    /// Construct an unrecognized message, copying the remainder of the
    /// reader as its body.
    fn decode(cmd: RelayCmd, r: &mut Reader<'_>) -> BytesResult<Self> {
        let body = r.take(r.remaining())?.into();
        Ok(Unrecognized { cmd, body })
    }
    /// Return the command for this message.
    pub fn cmd(&self) -> RelayCmd {
        self.cmd
    }
}

impl Body for Unrecognized {
    fn take_from(r: &mut Reader<'_>) -> BytesResult<Self> {
        Self::decode(0.into(), r)
    }
    fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
        w.write_all(&self.body);
        Ok(())
    }
}

/// Helper: declare the `AnyRelayMsg` enum and its `RelayMsg` dispatch.
macro_rules! relaymsg_enum {
    (
        $( $(#[$meta:meta])* $name:ident => $cmd:ident ),* $(,)?
    ) => {
        /// A single decoded relay message, of any type we recognize.
        #[derive(Debug, Clone)]
        #[non_exhaustive]
        pub enum AnyRelayMsg {
            $(
                $(#[$meta])*
                $name($name),
            )*
            /// An unrecognized relay message.
            Unrecognized(Unrecognized),
        }

        impl RelayMsg for AnyRelayMsg {
            fn cmd(&self) -> RelayCmd {
                match self {
                    $( AnyRelayMsg::$name(_) => RelayCmd::$cmd, )*
                    AnyRelayMsg::Unrecognized(m) => m.cmd(),
                }
            }
            fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> Result<()> {
                match self {
                    $( AnyRelayMsg::$name(m) => m.encode_onto(w), )*
                    AnyRelayMsg::Unrecognized(m) => m.encode_onto(w),
                }
            }
            fn decode_from_reader(cmd: RelayCmd, r: &mut Reader<'_>) -> Result<Self> {
                /// Wrap a decoding error with the command being parsed.
                fn wrap(e: BytesError) -> Error {
                    Error::from_bytes_err(e, "relay message")
                }
                Ok(match cmd {
                    $( RelayCmd::$cmd => AnyRelayMsg::$name($name::take_from(r).map_err(wrap)?), )*
                    _ => AnyRelayMsg::Unrecognized(
                        Unrecognized::decode(cmd, r).map_err(wrap)?,
                    ),
                })
            }
        }

        $(
            impl From<$name> for AnyRelayMsg {
                fn from(m: $name) -> AnyRelayMsg {
                    AnyRelayMsg::$name(m)
                }
            }
        )*
    };
}

relaymsg_enum! {
    /// Create a stream.
    Begin => BEGIN,
    /// Send data on a stream.
    Data => DATA,
    /// Close a stream.
    End => END,
    /// Successful response to a Begin message.
    Connected => CONNECTED,
    /// For flow control.
    Sendme => SENDME,
    /// Partially close a circuit.
    Truncated => TRUNCATED,
    /// Tell the last relay to extend the circuit.
    Extend2 => EXTEND2,
    /// Successful response to an Extend2 message.
    Extended2 => EXTENDED2,
    /// Create a stream with the last relay's directory cache.
    BeginDir => BEGIN_DIR,
    /// Long-range padding, dropped at its destination.
    Drop => DROP,
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// Encode `msg` and decode it again under its own command.
    fn roundtrip(msg: AnyRelayMsg) -> AnyRelayMsg {
        let cmd = msg.cmd();
        let mut encoded = Vec::new();
        msg.encode_onto(&mut encoded).unwrap();
        let mut r = Reader::from_slice(&encoded[..]);
        AnyRelayMsg::decode_from_reader(cmd, &mut r).unwrap()
    }

    #[test]
    fn begin_format() {
        let begin = Begin::new("www.Torproject.Org", 443, 0).unwrap();
        assert_eq!(begin.addr(), b"www.torproject.org");
        assert_eq!(begin.port(), 443);
        let mut encoded = Vec::new();
        AnyRelayMsg::from(begin).encode_onto(&mut encoded).unwrap();
        assert_eq!(&encoded[..], &b"www.torproject.org:443\0"[..]);

        let begin = Begin::new("192.0.2.7", 80, 5).unwrap();
        let mut encoded = Vec::new();
        AnyRelayMsg::from(begin).encode_onto(&mut encoded).unwrap();
        assert_eq!(&encoded[..], &b"192.0.2.7:80\0\x00\x00\x00\x05"[..]);

        assert!(Begin::new("católica.example", 80, 0).is_err());
    }

    #[test]
    fn begin_decode() {
        match roundtrip(Begin::new("example.com", 9001, 3).unwrap().into()) {
            AnyRelayMsg::Begin(b) => {
                assert_eq!(b.addr(), b"example.com");
                assert_eq!(b.port(), 9001);
                assert_eq!(b.flags(), 3);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn data_limits() {
        assert!(Data::new(&[0_u8; Data::MAXLEN]).is_ok());
        assert!(Data::new(&[0_u8; Data::MAXLEN + 1]).is_err());
        let big = [7_u8; Data::MAXLEN + 12];
        let (cell, rest) = Data::try_split_from(&big[..]);
        assert_eq!(cell.as_ref().len(), Data::MAXLEN);
        assert_eq!(rest.len(), 12);
    }

    #[test]
    fn end_roundtrips() {
        match roundtrip(End::new_with_reason(EndReason::TIMEOUT).into()) {
            AnyRelayMsg::End(e) => assert_eq!(e.reason(), EndReason::TIMEOUT),
            _ => panic!("wrong variant"),
        }
        // empty END means MISC
        let mut r = Reader::from_slice(&[]);
        match AnyRelayMsg::decode_from_reader(RelayCmd::END, &mut r).unwrap() {
            AnyRelayMsg::End(e) => assert_eq!(e.reason(), EndReason::MISC),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn connected_with_addr() {
        let msg = Connected::new_with_addr("198.51.100.6".parse().unwrap(), 3600);
        let mut encoded = Vec::new();
        AnyRelayMsg::from(msg).encode_onto(&mut encoded).unwrap();
        assert_eq!(&encoded[..], &[198, 51, 100, 6, 0, 0, 14, 16]);
    }

    #[test]
    fn sendme_versions() {
        match roundtrip(Sendme::new_empty().into()) {
            AnyRelayMsg::Sendme(s) => assert!(s.into_tag().is_none()),
            _ => panic!("wrong variant"),
        }
        match roundtrip(Sendme::new_tag([3; 20]).into()) {
            AnyRelayMsg::Sendme(s) => assert_eq!(s.into_tag(), Some(vec![3; 20])),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn extend2_roundtrip() {
        let ls = vec![
            EncodedLinkSpec::new(0, &[203, 0, 113, 6, 0x23, 0x28][..]),
            EncodedLinkSpec::new(2, &[7_u8; 20][..]),
        ];
        let ex = Extend2::new(ls.clone(), 0x0002, b"onionskin".to_vec());
        match roundtrip(ex.into()) {
            AnyRelayMsg::Extend2(e) => {
                assert_eq!(e.linkspec(), &ls[..]);
                assert_eq!(e.handshake_type(), 2);
                assert_eq!(e.handshake(), b"onionskin");
            }
            _ => panic!("wrong variant"),
        }
    }
}
