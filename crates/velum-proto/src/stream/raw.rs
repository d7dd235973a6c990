//! Declare the lowest level of stream: a stream that operates on raw
//! relay messages.

use crate::{Error, Result};
use futures::channel::mpsc;
use futures::stream::StreamExt;
use velum_cell::relaycell::msg::AnyRelayMsg;

/// The read part of a stream on a particular circuit.
///
/// The reactor delivers every message addressed to this stream here;
/// flow-control bookkeeping has already happened by the time a message
/// arrives.
#[derive(Debug)]
pub struct StreamReader {
    /// Channel of incoming messages from the circuit reactor.
    receiver: mpsc::Receiver<AnyRelayMsg>,
    /// True iff the reactor has gone away (dropping our sender).
    ended: bool,
}

impl StreamReader {
    /// Construct a reader over a channel from the circuit reactor.
    pub(crate) fn new(receiver: mpsc::Receiver<AnyRelayMsg>) -> Self {
        StreamReader {
            receiver,
            ended: false,
        }
    }

    /// Receive the next message that arrives on this stream.
    ///
    /// An error here means the circuit itself is gone; an orderly close
    /// arrives as an END message instead.
    pub(crate) async fn recv_msg(&mut self) -> Result<AnyRelayMsg> {
        if self.ended {
            return Err(Error::CircuitClosed);
        }
        match self.receiver.next().await {
            Some(msg) => Ok(msg),
            None => {
                self.ended = true;
                Err(Error::CircuitClosed)
            }
        }
    }
}
