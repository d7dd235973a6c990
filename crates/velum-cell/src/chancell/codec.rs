//! Implementation for encoding and decoding of ChanCells.

use super::{ChanCell, ChanCmd, ChanMsg, CircId, CELL_DATA_LEN};
use crate::reader::Reader;
use crate::writer::Writer;
use crate::{Error, Result};

use bytes::{Buf, BytesMut};

/// This object can be used to encode and decode channel cells.
///
/// The width of the circuit-ID field is a property of the connection: two
/// bytes below link protocol 4, four bytes from link protocol 4 onward.
///
/// The implemented format is one of the following:
///
/// Variable-length cells:
/// ```ignore
///     u16 | u32 circid;
///     u8 command;
///     u16 len;
///     u8 body[len];
/// ```
///
/// Fixed-width cells:
/// ```ignore
///     u16 | u32 circid;
///     u8 command;
///     u8 body[509];
/// ```
pub struct ChannelCodec {
    /// The link protocol version in use on this channel.
    ///
    /// For protocol versions below 4, circuit IDs are two bytes long.
    link_version: u16,
}

impl ChannelCodec {
    /// Create a new ChannelCodec with a given link protocol version.
    pub fn new(link_version: u16) -> Self {
        ChannelCodec { link_version }
    }

    /// Return the length in bytes of a circuit ID under this codec.
    fn circid_len(&self) -> usize {
        if self.link_version >= 4 {
            4
        } else {
            2
        }
    }

    /// Write the given cell into the provided BytesMut object.
    pub fn write_cell<M: ChanMsg>(&mut self, item: ChanCell<M>, dst: &mut BytesMut) -> Result<()> {
        let (circid, msg) = item.into_circid_and_msg();
        let cmd = msg.cmd();
        let id = CircId::get_or_zero(circid);
        if self.circid_len() == 2 {
            let id = u16::try_from(id)
                .map_err(|_| Error::ChanProto("Circuit ID too wide for link protocol".into()))?;
            dst.write_u16(id);
        } else {
            dst.write_u32(id);
        }
        dst.write_u8(cmd.into());

        let pos = dst.len();

        // now write the cell body and handle the length.
        if cmd.is_var_cell() {
            dst.write_u16(0);
            msg.encode_onto(dst)?;
            let len = dst.len() - pos - 2;
            let len =
                u16::try_from(len).map_err(|_| Error::CantEncode("ran out of space for varcell"))?;
            // go back and set the length.
            dst[pos..pos + 2].copy_from_slice(&len.to_be_bytes());
        } else {
            msg.encode_onto(dst)?;
            let len = dst.len() - pos;
            if len > CELL_DATA_LEN {
                return Err(Error::CantEncode("ran out of space for cell"));
            }
            // pad to end of fixed-length cell
            dst.write_zeros(CELL_DATA_LEN - len);
        }
        Ok(())
    }

    /// Try to decode a cell from the provided BytesMut object.
    ///
    /// On a definite decoding error, return Err(_).  On a cell that might
    /// just be truncated, return Ok(None).
    pub fn decode_cell<M: ChanMsg>(&mut self, src: &mut BytesMut) -> Result<Option<ChanCell<M>>> {
        /// Wrap `e` as an appropriate error type.
        fn wrap_err(e: crate::BytesError) -> Error {
            Error::from_bytes_err(e, "channel cell")
        }

        let id_len = self.circid_len();
        // Smallest possible cell: varcell with len 0.
        if src.len() < id_len + 3 {
            return Ok(None);
        }
        let cmd: ChanCmd = src[id_len].into();
        let varcell = cmd.is_var_cell();
        let cell_len: usize = if varcell {
            let msg_len = u16::from_be_bytes(
                src[id_len + 1..id_len + 3]
                    .try_into()
                    .expect("two-byte slice was not two bytes!?"),
            );
            msg_len as usize + id_len + 3
        } else {
            id_len + 1 + CELL_DATA_LEN
        };
        if src.len() < cell_len {
            return Ok(None);
        }

        let cell = src.copy_to_bytes(cell_len);
        let mut r = Reader::from_slice(&cell[..]);
        let circid: Option<CircId> = if id_len == 2 {
            CircId::new(u32::from(r.take_u16().map_err(wrap_err)?))
        } else {
            CircId::new(r.take_u32().map_err(wrap_err)?)
        };
        r.advance(if varcell { 3 } else { 1 }).map_err(wrap_err)?;
        let msg = M::decode_from_reader(cmd, &mut r)?;

        if !cmd.accepts_circid_val(circid) {
            return Err(Error::ChanProto(format!(
                "Invalid circuit ID {} for cell command {}",
                CircId::get_or_zero(circid),
                cmd
            )));
        }
        Ok(Some(ChanCell::new(circid, msg)))
    }
}
