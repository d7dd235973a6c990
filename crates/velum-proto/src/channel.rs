//! Code for talking directly (over a framed connection) to a relay.
//!
//! Channels form the basis of the rest of the protocol: they are the
//! only way for two endpoints to talk.
//!
//! Channels are not useful directly for application requests: after
//! making a channel, it needs to get used to build circuits, and the
//! circuits are used to anonymize streams.
//!
//! This crate does not perform the TLS-like connection handshake; the
//! connection cache above us hands over a framed transport (anything
//! that is a `Sink` and `Stream` of cells), and we speak cells over it.
//! Use [`codec::new_frame`] to wrap a raw byte stream as such a
//! transport.
//!
//! # Design
//!
//! This code splits the channel into two pieces: a [`Channel`] object
//! that can be used by circuits to write cells onto the channel, and a
//! [`reactor::Reactor`] object that runs as a task in the background, to
//! read channel cells and pass them to circuits as appropriate.

mod circmap;
pub mod codec;
pub mod reactor;
mod unique_id;

use crate::circuit;
use crate::circuit::celltypes::CreateResponse;
use crate::{Error, Result};

use crate::channel::reactor::{BoxedChannelSink, BoxedChannelStream, CtrlMsg, Reactor};
pub use crate::channel::unique_id::UniqId;
use velum_cell::chancell::{msg::AnyChanMsg, AnyChanCell, ChanMsg, CircId};

use futures::channel::{mpsc, oneshot};
use futures::io::{AsyncRead, AsyncWrite};
use futures::sink::SinkExt;
use futures::stream::StreamExt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

/// The size of the channel buffer for communication between `Channel`
/// and its reactor.
pub const CHANNEL_BUFFER_SIZE: usize = 128;

/// An open client channel, ready to send and receive cells.
///
/// This struct is a frontend that can be used to send cells and
/// otherwise control the channel; the main state is in the Reactor
/// object.  `Channel` is cheap to clone.
#[derive(Clone, Debug)]
pub struct Channel {
    /// A channel used to send control messages to the Reactor.
    control: mpsc::UnboundedSender<CtrlMsg>,
    /// A channel used to send cells to the Reactor.
    cell_tx: mpsc::Sender<AnyChanCell>,
    /// Information shared with the reactor.
    details: Arc<ChannelDetails>,
}

/// Information shared between the reactor and the frontend.
///
/// This exists to make `Channel` cheap to clone.
#[derive(Debug)]
pub(crate) struct ChannelDetails {
    /// A unique identifier for this channel.
    unique_id: UniqId,
    /// A description of the peer that this channel is connected to, for
    /// logging.
    peer: String,
    /// If true, this channel is closing.
    closed: AtomicBool,
}

impl Channel {
    /// Construct a channel and its reactor over a framed cell transport.
    ///
    /// The caller is responsible for spawning a task that runs the
    /// returned reactor; until that task is running, nothing will
    /// actually be sent or received.
    pub fn new(
        link_protocol: u16,
        sink: BoxedChannelSink,
        stream: BoxedChannelStream,
        peer: String,
    ) -> (Self, Reactor) {
        use circmap::{CircIdRange, CircMap};
        let circmap = CircMap::new(CircIdRange::High);

        let (control_tx, control_rx) = mpsc::unbounded();
        let (cell_tx, cell_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let unique_id = UniqId::new();

        let details = Arc::new(ChannelDetails {
            unique_id,
            peer,
            closed: AtomicBool::new(false),
        });

        let channel = Channel {
            control: control_tx,
            cell_tx,
            details: Arc::clone(&details),
        };

        let reactor = Reactor::new(
            control_rx,
            cell_rx,
            stream,
            sink,
            circmap,
            details,
            link_protocol,
        );

        (channel, reactor)
    }

    /// Construct a channel and reactor over a byte-oriented connection,
    /// speaking the given link protocol version.
    pub fn from_transport<T>(io: T, link_protocol: u16, peer: String) -> (Self, Reactor)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = codec::new_frame(io, link_protocol).split();
        Channel::new(link_protocol, Box::new(sink), Box::new(stream), peer)
    }

    /// Return a process-unique identifier for this channel.
    pub fn unique_id(&self) -> UniqId {
        self.details.unique_id
    }

    /// Return a description of the peer that this channel connects to.
    pub fn peer(&self) -> &str {
        &self.details.peer
    }

    /// Return true if this channel is closed and therefore unusable.
    pub fn is_closing(&self) -> bool {
        self.details.closed.load(Ordering::SeqCst)
    }

    /// Check whether a cell type is permissible to be sent on an open
    /// client channel.
    fn check_cell(&self, cell: &AnyChanCell) -> Result<()> {
        use AnyChanMsg::*;
        let msg = cell.msg();
        match msg {
            Created2(_) | CreatedFast(_) => Err(Error::ChanProto(format!(
                "Can't send {} cell on client channel",
                msg.cmd()
            ))),
            _ => Ok(()),
        }
    }

    /// Transmit a single cell on this channel.
    pub async fn send_cell(&self, cell: AnyChanCell) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ChannelClosed);
        }
        self.check_cell(&cell)?;
        match cell.msg() {
            AnyChanMsg::Relay(_) => {} // too frequent to log.
            m => trace!(
                "{}: Sending {} for {}",
                self.details.unique_id,
                m.cmd(),
                CircId::get_or_zero(cell.circid())
            ),
        }
        self.cell_tx
            .clone()
            .send(cell)
            .await
            .map_err(|_| Error::ChannelClosed)?;
        Ok(())
    }

    /// Return a newly allocated pending circuit object with a
    /// corresponding circuit reactor.  A circuit ID is allocated, but no
    /// messages are sent, and no cryptography is done.
    ///
    /// To use the results of this method, call `Reactor::run()` in a new
    /// task, then use the methods of
    /// [`PendingClientCirc`](crate::circuit::PendingClientCirc) to build
    /// the circuit.
    pub async fn new_circ(&self) -> Result<(circuit::PendingClientCirc, circuit::reactor::Reactor)> {
        if self.is_closing() {
            return Err(Error::ChannelClosed);
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (createdsender, createdreceiver) = oneshot::channel::<CreateResponse>();
        let (tx, rx) = oneshot::channel();

        self.control
            .unbounded_send(CtrlMsg::AllocateCircuit {
                created_sender: createdsender,
                sender,
                tx,
            })
            .map_err(|_| Error::ChannelClosed)?;
        let (id, circ_unique_id) = rx.await.map_err(|_| Error::ChannelClosed)??;

        trace!("{}: Allocated CircId {}", circ_unique_id, id);

        Ok(circuit::PendingClientCirc::new(
            id,
            self.clone(),
            createdreceiver,
            receiver,
            circ_unique_id,
        ))
    }

    /// Shut down this channel immediately, along with all circuits that
    /// are using it.
    ///
    /// Note that other references to this channel may exist.  If they
    /// do, they will stop working after you call this function.
    pub fn terminate(&self) {
        let _ = self.control.unbounded_send(CtrlMsg::Shutdown);
    }

    /// Tell the reactor that the circuit with the given ID has gone away.
    pub fn close_circuit(&self, circid: CircId) -> Result<()> {
        self.control
            .unbounded_send(CtrlMsg::CloseCircuit(circid))
            .map_err(|_| Error::ChannelClosed)?;
        Ok(())
    }
}
