//! Declare DataStream, a type that wraps a stream so as to be useful
//! for byte-oriented communication.

use crate::circuit::StreamTarget;
use crate::stream::StreamReader;
use crate::{Error, Result};

use velum_cell::relaycell::msg::{AnyRelayMsg, Data, End, EndReason, RelayMsg as _};

/// A byte-oriented stream over a circuit.
///
/// Reading and writing are independent halves multiplexed over the same
/// stream ID; writes are chunked into DATA messages, and reads drain
/// DATA messages as they arrive.  Dropping the `DataStream` closes the
/// stream: the reactor notices that its handles are gone and sends an
/// END for it.
#[derive(Debug)]
pub struct DataStream {
    /// The reading half, fed by the circuit reactor.
    reader: StreamReader,
    /// The writing half, leading to the circuit reactor.
    target: StreamTarget,
    /// Bytes received in a DATA message but not yet returned.
    pending: Vec<u8>,
    /// Index into `pending` of the next byte to return.
    offset: usize,
    /// True once we have seen a CONNECTED message on this stream.
    connected: bool,
    /// Set once the remote side has ended the stream.
    read_ended: bool,
}

impl DataStream {
    /// Wrap a reader and target as a DataStream.
    pub(crate) fn new(reader: StreamReader, target: StreamTarget) -> Self {
        DataStream {
            reader,
            target,
            pending: Vec::new(),
            offset: 0,
            connected: false,
            read_ended: false,
        }
    }

    /// Wait until a CONNECTED message arrives on this stream, telling
    /// us that the remote side has opened its half.
    ///
    /// An END message instead means the remote refused the stream.
    pub async fn wait_for_connection(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        match self.reader.recv_msg().await? {
            AnyRelayMsg::Connected(_) => {
                self.connected = true;
                Ok(())
            }
            AnyRelayMsg::End(e) => Err(Error::EndReceived { reason: e.reason() }),
            m => Err(Error::StreamProto(format!(
                "Unexpected {} while waiting for CONNECTED",
                m.cmd()
            ))),
        }
    }

    /// Read up to `buf.len()` bytes from this stream.
    ///
    /// Returns the number of bytes read; 0 means the remote side closed
    /// the stream in an orderly way.  A close with any reason other
    /// than DONE is reported as an error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.offset < self.pending.len() {
                let n = std::cmp::min(buf.len(), self.pending.len() - self.offset);
                buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            if self.read_ended {
                return Ok(0);
            }
            match self.reader.recv_msg().await? {
                AnyRelayMsg::Connected(_) if !self.connected => {
                    self.connected = true;
                }
                AnyRelayMsg::Data(d) => {
                    self.pending = d.into();
                    self.offset = 0;
                }
                AnyRelayMsg::End(e) => {
                    self.read_ended = true;
                    if e.reason() == EndReason::DONE {
                        return Ok(0);
                    }
                    return Err(Error::EndReceived { reason: e.reason() });
                }
                m => {
                    return Err(Error::StreamProto(format!(
                        "Unexpected {} on a data stream",
                        m.cmd()
                    )));
                }
            }
        }
    }

    /// Read bytes until the stream is closed or `max` bytes have
    /// arrived.
    pub async fn read_to_end(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0_u8; 1024];
        while out.len() < max {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Write all of `buf` onto this stream, chunking it into DATA
    /// messages.
    ///
    /// This function suspends whenever the stream's (or its circuit's)
    /// flow-control window is exhausted, until the matching SENDME
    /// arrives.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            let (data, rest) = Data::try_split_from(remaining);
            remaining = rest;
            self.target.send(data.into()).await?;
        }
        Ok(())
    }

    /// Close this stream in an orderly way, telling the remote side we
    /// are done with it.
    pub fn close(self) {
        self.target
            .close(End::new_with_reason(EndReason::DONE));
    }

    /// Return the process-unique identifier of the circuit this stream
    /// runs on.
    pub fn circuit_unique_id(&self) -> crate::circuit::UniqId {
        self.target.circuit_unique_id()
    }
}
