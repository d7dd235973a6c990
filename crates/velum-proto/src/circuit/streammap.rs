//! Types and code for mapping stream IDs to streams on a circuit.

use crate::circuit::halfstream::HalfStream;
use crate::circuit::sendme::{StreamRecvWindow, StreamSendWindow};
use crate::stream::cmdcheck::DataCmdChecker;
use crate::{Error, Result};
use velum_cell::relaycell::msg::AnyRelayMsg;
use velum_cell::relaycell::StreamId;

use futures::channel::mpsc;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::num::NonZeroU16;

use rand::Rng;

/// The entry for an open stream: one where we have not sent or received
/// any message indicating that the stream is ended.
#[derive(Debug)]
pub(crate) struct OpenStreamEnt {
    /// Sink to send relay cells tagged for this stream into.
    pub(crate) sink: mpsc::Sender<AnyRelayMsg>,
    /// Stream for cells that should be sent down this stream.
    pub(crate) rx: mpsc::Receiver<AnyRelayMsg>,
    /// Send window for this stream, decremented when we send.
    pub(crate) send_window: StreamSendWindow,
    /// Receive window for this stream, decremented when we receive.
    pub(crate) recv_window: StreamRecvWindow,
    /// Number of cells dropped due to the stream disappearing before we
    /// could transform this into an `EndSent`.
    pub(crate) dropped: u16,
    /// A checker used to tell whether cells on this stream are valid.
    pub(crate) cmd_checker: DataCmdChecker,
}

/// The entry for a stream.
#[derive(Debug)]
pub(crate) enum StreamEnt {
    /// An open stream.
    Open(OpenStreamEnt),
    /// A stream for which we have received an END cell, but not yet
    /// had the stream object get dropped.
    EndReceived,
    /// A stream for which we have sent an END cell but not yet received
    /// an END cell.
    ///
    /// The `HalfStream` polices the cells that may still arrive.
    EndSent(HalfStream),
}

/// Return value to indicate whether or not we send an END cell upon
/// terminating a given stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ShouldSendEnd {
    /// An END cell should be sent.
    Send,
    /// An END cell should not be sent.
    DontSend,
}

/// A map from stream IDs to stream entries.  Each circuit has one for
/// each hop that can have streams (in practice, the final hop).
pub(crate) struct StreamMap {
    /// Map from stream IDs to stream entries.
    m: HashMap<StreamId, StreamEnt>,
    /// The next stream ID that we should try for a newly allocated
    /// stream.
    next_stream_id: StreamId,
}

impl StreamMap {
    /// Make a new empty StreamMap, with a random starting point for its
    /// stream IDs.
    pub(crate) fn new() -> Self {
        let mut rng = rand::thread_rng();
        let next_stream_id: NonZeroU16 = rng.gen();
        StreamMap {
            m: HashMap::new(),
            next_stream_id: next_stream_id.into(),
        }
    }

    /// Return the number of open streams in this map.
    pub(crate) fn n_open_streams(&self) -> usize {
        self.m
            .values()
            .filter(|ent| matches!(ent, StreamEnt::Open(_)))
            .count()
    }

    /// Add an entry to this map; return the newly allocated StreamId.
    pub(crate) fn add_ent(
        &mut self,
        sink: mpsc::Sender<AnyRelayMsg>,
        rx: mpsc::Receiver<AnyRelayMsg>,
    ) -> Result<StreamId> {
        let mut ent = Some(StreamEnt::Open(OpenStreamEnt {
            sink,
            rx,
            send_window: StreamSendWindow::new(500),
            recv_window: StreamRecvWindow::new_at_start(),
            dropped: 0,
            cmd_checker: DataCmdChecker::new_any(),
        }));
        // Going around in a loop here is sadly needed in order to look
        // like other client implementations.
        for _ in 1..=65536 {
            let id: StreamId = self.next_stream_id;
            self.next_stream_id = wrapping_next_stream_id(self.next_stream_id);
            if let Entry::Vacant(v) = self.m.entry(id) {
                v.insert(ent.take().expect("stream entry inserted twice?"));
                return Ok(id);
            }
        }
        Err(Error::IdRangeFull)
    }

    /// Return the entry for `id` in this map, if any.
    pub(crate) fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEnt> {
        self.m.get_mut(&id)
    }

    /// Iterate over mutable references to all the open entries, with
    /// their IDs.
    pub(crate) fn open_ents_mut(
        &mut self,
    ) -> impl Iterator<Item = (StreamId, &mut OpenStreamEnt)> {
        self.m.iter_mut().filter_map(|(id, ent)| match ent {
            StreamEnt::Open(open) => Some((*id, open)),
            _ => None,
        })
    }

    /// Note that we received an END message on the stream with `id`.
    ///
    /// Returns an error if there was no such stream.
    pub(crate) fn ending_msg_received(&mut self, id: StreamId) -> Result<()> {
        let Some(ent) = self.m.get_mut(&id) else {
            return Err(Error::CircProto(
                "Received END cell on nonexistent stream".into(),
            ));
        };
        match ent {
            StreamEnt::Open(_) => {
                *ent = StreamEnt::EndReceived;
                Ok(())
            }
            StreamEnt::EndReceived => Err(Error::CircProto(
                "Received two END cells on same stream".into(),
            )),
            StreamEnt::EndSent(_) => {
                // We got an END, and we already sent an END.  We can
                // forget about this stream.
                self.m.remove(&id);
                Ok(())
            }
        }
    }

    /// Handle a termination of the stream with `id` from this side of
    /// the circuit.  Return true if the stream was open and an END ought
    /// to be sent.
    pub(crate) fn terminate(&mut self, id: StreamId) -> Result<ShouldSendEnd> {
        let Some(ent) = self.m.get_mut(&id) else {
            return Err(crate::internal!(
                "Somehow we terminated a nonexistent stream?"
            ));
        };
        match ent {
            StreamEnt::Open(open) => {
                let mut recv_window = StreamRecvWindow::new_at_start();
                recv_window.decrement_n(open.dropped)?;
                let half = HalfStream::new(
                    open.send_window.clone(),
                    recv_window,
                    std::mem::take(&mut open.cmd_checker),
                );
                *ent = StreamEnt::EndSent(half);
                Ok(ShouldSendEnd::Send)
            }
            StreamEnt::EndReceived => {
                self.m.remove(&id);
                Ok(ShouldSendEnd::DontSend)
            }
            StreamEnt::EndSent(_) => Err(crate::internal!(
                "Tried to terminate a stream that was already terminated."
            )),
        }
    }
}

/// Convenience function for doing a wrapping increment of a `StreamId`.
fn wrapping_next_stream_id(id: StreamId) -> StreamId {
    let next_val = NonZeroU16::from(id)
        .checked_add(1)
        .unwrap_or_else(|| NonZeroU16::MIN);
    next_val.into()
}
