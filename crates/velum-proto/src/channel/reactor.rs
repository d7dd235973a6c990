//! Code to handle incoming cells on a channel.
//!
//! The role of this code is to run in a separate asynchronous task, and
//! route cells to the right circuits.

use super::circmap::{CircEnt, CircMap};
use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::halfcirc::HalfCirc;
use crate::util::err::ReactorError;
use crate::{Error, Result};
use velum_cell::chancell::msg::{AnyChanMsg, Destroy, DestroyReason};
use velum_cell::chancell::{AnyChanCell, ChanCell, ChanCmd, ChanMsg, CircId};

use futures::channel::{mpsc, oneshot};
use futures::select_biased;
use futures::sink::{Sink, SinkExt};
use futures::stream::{Stream, StreamExt};

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::channel::codec::CodecError;
use crate::channel::{unique_id, ChannelDetails};
use tracing::{debug, trace};

/// A boxed trait object that can provide `ChanCell`s.
pub type BoxedChannelStream =
    Box<dyn Stream<Item = std::result::Result<AnyChanCell, CodecError>> + Send + Unpin + 'static>;
/// A boxed trait object that can sink `ChanCell`s.
pub type BoxedChannelSink =
    Box<dyn Sink<AnyChanCell, Error = CodecError> + Send + Unpin + 'static>;
/// The type of a oneshot channel used to inform reactor users of the
/// result of an operation.
pub(super) type ReactorResultChannel<T> = oneshot::Sender<Result<T>>;

/// How many additional relay cells do we accept on a circuit after
/// sending a DESTROY for it?  (The other side may have a full window of
/// cells in flight.)
const HALF_CIRC_CELL_LIMIT: u16 = 1000;

/// Convert `err` to an Error, under the assumption that it's happening
/// on an open channel.
fn codec_err_to_chan(err: CodecError) -> Error {
    match err {
        CodecError::Io(e) => Error::ChanIoErr(Arc::new(e)),
        CodecError::Cell(e) => Error::from_cell_enc(e),
    }
}

/// A message telling the channel reactor to do something.
#[derive(Debug)]
pub(super) enum CtrlMsg {
    /// Shut down the reactor.
    Shutdown,
    /// Tell the reactor that a given circuit has gone away.
    CloseCircuit(CircId),
    /// Allocate a new circuit in this channel's circuit map, generating
    /// an ID for it and registering senders for messages received for
    /// the circuit.
    AllocateCircuit {
        /// Channel to send the circuit's `CreateResponse` down.
        created_sender: oneshot::Sender<CreateResponse>,
        /// Channel to send other messages from this circuit down.
        sender: mpsc::Sender<ClientCircChanMsg>,
        /// Oneshot channel to send the new circuit's identifiers down.
        tx: ReactorResultChannel<(CircId, crate::circuit::UniqId)>,
    },
}

/// Object to handle incoming cells and background tasks on a channel.
///
/// This type is returned when you finish a channel; you need to spawn a
/// new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the channel won't work."]
pub struct Reactor {
    /// A receiver for control messages from `Channel` objects.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// A receiver for cells to be sent on this reactor's sink.
    ///
    /// `Channel` objects have a sender that can send cells here.
    cells: mpsc::Receiver<AnyChanCell>,
    /// A Stream from which we can read `ChanCell`s.
    ///
    /// This should be backed by a TLS connection if you want it to be
    /// secure.
    input: futures::stream::Fuse<BoxedChannelStream>,
    /// A Sink to which we can write `ChanCell`s.
    output: BoxedChannelSink,
    /// A map from circuit ID to Sinks on which we can deliver cells.
    circs: CircMap,
    /// Information shared with the frontend.
    details: Arc<ChannelDetails>,
    /// Context for allocating unique circuit log identifiers.
    circ_unique_id_ctx: unique_id::CircUniqIdContext,
    /// What link protocol is the channel using?
    #[allow(dead_code)] // the width is baked into the codec by the builder.
    link_protocol: u16,
}

/// Allows us to just say `debug!("{}: did a thing", &self)`.
impl fmt::Display for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.details.unique_id, f)
    }
}

impl Reactor {
    /// Construct a new Reactor from its parts; used from `Channel::new`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        control: mpsc::UnboundedReceiver<CtrlMsg>,
        cells: mpsc::Receiver<AnyChanCell>,
        input: BoxedChannelStream,
        output: BoxedChannelSink,
        circs: CircMap,
        details: Arc<ChannelDetails>,
        link_protocol: u16,
    ) -> Self {
        Reactor {
            control,
            cells,
            input: input.fuse(),
            output,
            circs,
            details,
            circ_unique_id_ctx: unique_id::CircUniqIdContext::new(),
            link_protocol,
        }
    }

    /// Launch the reactor, and run until the channel closes or we
    /// encounter an error.
    ///
    /// Once this function returns, the channel is dead, and can't be
    /// used again.
    pub async fn run(mut self) -> Result<()> {
        if self.details.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        trace!("{}: Running reactor", &self);
        let result: Result<()> = loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorError::Shutdown) => break Ok(()),
                Err(ReactorError::Err(e)) => break Err(e),
            }
        };
        debug!("{}: Reactor stopped: {:?}", &self, result);
        self.details.closed.store(true, Ordering::SeqCst);
        result
    }

    /// Helper for run(): handles only one action, and doesn't mark the
    /// channel closed on finish.
    async fn run_once(&mut self) -> std::result::Result<(), ReactorError> {
        select_biased! {
            ret = self.control.next() => {
                let ctrl = match ret {
                    None | Some(CtrlMsg::Shutdown) => return Err(ReactorError::Shutdown),
                    Some(x) => x,
                };
                self.handle_control(ctrl).await?;
            }

            ret = self.input.next() => {
                let item = ret
                    .ok_or(ReactorError::Shutdown)?
                    .map_err(codec_err_to_chan)?;
                self.handle_cell(item).await?;
            }

            ret = self.cells.next() => {
                let cell = ret.ok_or(ReactorError::Shutdown)?;
                self.output.send(cell).await.map_err(codec_err_to_chan)?;
            }
        }
        Ok(()) // Run again.
    }

    /// Handle a CtrlMsg other than Shutdown.
    async fn handle_control(&mut self, msg: CtrlMsg) -> Result<()> {
        trace!("{}: reactor received {:?}", &self, msg);
        match msg {
            CtrlMsg::Shutdown => {
                // was handled in run_once.
            }
            CtrlMsg::CloseCircuit(id) => {
                // Only relevant if the circuit is still in our map; if
                // the peer destroyed it first, the entry is gone and
                // there is nothing to tear down.
                let still_open = matches!(
                    self.circs.get_mut(id),
                    Some(CircEnt::Open(_)) | Some(CircEnt::Opening(_, _))
                );
                if still_open {
                    self.outbound_destroy_circ(id).await?;
                }
            }
            CtrlMsg::AllocateCircuit {
                created_sender,
                sender,
                tx,
            } => {
                let mut rng = rand::thread_rng();
                let my_unique_id = self.details.unique_id;
                let circ_unique_id = self.circ_unique_id_ctx.next(my_unique_id);
                let ret: Result<_> = self
                    .circs
                    .add_ent(&mut rng, created_sender, sender)
                    .map(|id| (id, circ_unique_id));
                let _ = tx.send(ret); // don't care about other side going away
            }
        }
        Ok(())
    }

    /// Helper: process a cell on a channel.  Most cell types get ignored
    /// or rejected; a few get delivered to circuits.
    async fn handle_cell(&mut self, cell: AnyChanCell) -> Result<()> {
        let (circid, msg) = cell.into_circid_and_msg();
        use AnyChanMsg::*;

        match &msg {
            Relay(_) => {} // too frequent to log.
            m => trace!(
                "{}: received {} for {}",
                &self,
                m.cmd(),
                CircId::get_or_zero(circid)
            ),
        }

        match msg {
            // These are allowed, and need to be handled.
            Relay(_) => self.deliver_relay(circid, msg).await,

            Destroy(_) => self.deliver_destroy(circid, msg).await,

            CreatedFast(_) | Created2(_) => self.deliver_created(circid, msg),

            // Padding is always ignored.
            Padding(_) => Ok(()),
            Unrecognized(m) if m.cmd() == ChanCmd::VPADDING => Ok(()),

            // Anything else is a channel protocol violation.
            m => Err(Error::ChanProto(format!(
                "{} cell received on open channel",
                m.cmd()
            ))),
        }
    }

    /// Give the RELAY cell `msg` to the appropriate circuit.
    async fn deliver_relay(&mut self, circid: Option<CircId>, msg: AnyChanMsg) -> Result<()> {
        let Some(circid) = circid else {
            return Err(Error::ChanProto("Relay cell without circuit ID".into()));
        };

        let ent = self
            .circs
            .get_mut(circid)
            .ok_or_else(|| Error::ChanProto("Relay cell on nonexistent circuit".into()))?;

        let receiver_gone = match ent {
            CircEnt::Open(s) => {
                // There's an open circuit; we can give it the RELAY cell.
                s.send(msg.try_into()?).await.is_err()
            }
            CircEnt::Opening(_, _) => {
                return Err(Error::ChanProto(
                    "Relay cell on pending circuit before CREATED* received".into(),
                ))
            }
            CircEnt::DestroySent(hs) => {
                hs.receive_cell()?;
                false
            }
        };
        if receiver_gone {
            // The circuit's receiver went away, so we should destroy the
            // circuit.
            self.outbound_destroy_circ(circid).await?;
        }
        Ok(())
    }

    /// Handle a CREATED{_FAST,2} cell by passing it on to the
    /// appropriate circuit, if that circuit is waiting for one.
    fn deliver_created(&mut self, circid: Option<CircId>, msg: AnyChanMsg) -> Result<()> {
        let Some(circid) = circid else {
            return Err(Error::ChanProto("'Created' cell without circuit ID".into()));
        };

        let target = self.circs.advance_from_opening(circid)?;
        let created = msg.try_into()?;
        target.send(created).map_err(|_| {
            crate::internal!("Circuit queue rejected created message. Is it closing?")
        })
    }

    /// Handle a DESTROY cell by removing the corresponding circuit from
    /// the map, and passing the destroy cell onward to the circuit.
    async fn deliver_destroy(&mut self, circid: Option<CircId>, msg: AnyChanMsg) -> Result<()> {
        let Some(circid) = circid else {
            return Err(Error::ChanProto("'Destroy' cell without circuit ID".into()));
        };

        // Remove the circuit from the map: nothing more can be done with
        // it.
        let entry = self.circs.remove(circid);
        match entry {
            // If the circuit is waiting for CREATED, tell it that it
            // won't get one.
            Some(CircEnt::Opening(oneshot, _)) => {
                trace!("{}: Passing destroy to pending circuit {}", &self, circid);
                oneshot
                    .send(msg.try_into()?)
                    .map_err(|_| {
                        crate::internal!("pending circuit wasn't interested in destroy cell?")
                    })
            }
            // It's an open circuit: tell it that it got a DESTROY cell.
            Some(CircEnt::Open(mut sink)) => {
                trace!("{}: Passing destroy to open circuit {}", &self, circid);
                sink.send(msg.try_into()?)
                    .await
                    .map_err(|_| {
                        crate::internal!("open circuit wasn't interested in destroy cell?")
                    })
            }
            // We've sent a destroy; we can leave this circuit removed.
            Some(CircEnt::DestroySent(_)) => Ok(()),
            // Got a DESTROY cell for a circuit we don't have.
            None => {
                trace!("{}: Destroy for nonexistent circuit {}", &self, circid);
                Err(Error::ChanProto("Destroy for nonexistent circuit".into()))
            }
        }
    }

    /// Helper: send a cell on the outbound sink.
    async fn send_cell(&mut self, cell: AnyChanCell) -> Result<()> {
        self.output.send(cell).await.map_err(codec_err_to_chan)?;
        Ok(())
    }

    /// Called when a circuit goes away: sends a DESTROY cell and removes
    /// the circuit.
    async fn outbound_destroy_circ(&mut self, id: CircId) -> Result<()> {
        trace!("{}: Circuit {} is gone; sending DESTROY", &self, id);
        // Remove the circuit's entry from the map: nothing more can be
        // done with it.  We keep a "half-closed" entry in its place so
        // that we can count the cells that may still be in flight.
        self.circs
            .destroy_sent(id, HalfCirc::new(HALF_CIRC_CELL_LIMIT));
        let destroy = Destroy::new(DestroyReason::NONE).into();
        let cell = ChanCell::new(Some(id), destroy);
        self.send_cell(cell).await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use futures::task::SpawnExt;
    use velum_cell::chancell::msg;

    type CodecResult = std::result::Result<AnyChanCell, CodecError>;

    /// Make a new reactor whose input and output are connected to local
    /// mpsc queues, so that tests can play the part of the network.
    pub(crate) fn new_reactor() -> (
        crate::channel::Channel,
        Reactor,
        mpsc::Receiver<AnyChanCell>,
        mpsc::Sender<CodecResult>,
    ) {
        let (send1, recv1) = mpsc::channel(32);
        let (send2, recv2) = mpsc::channel(32);
        let sink: BoxedChannelSink =
            Box::new(send1.sink_map_err(|_| CodecError::Cell(velum_cell::Error::ChanProto(
                "sink closed".into(),
            ))));
        let stream: BoxedChannelStream = Box::new(recv2);
        let (chan, reactor) = crate::channel::Channel::new(4, sink, stream, "test peer".into());
        (chan, reactor, recv1, send2)
    }

    #[test]
    fn shutdown() {
        futures::executor::block_on(async {
            let (chan, reactor, _output, _input) = new_reactor();
            chan.terminate();
            let r = reactor.run().await;
            assert!(r.is_ok());
            assert!(chan.is_closing());
        });
    }

    #[test]
    fn new_circ_allocates_id() {
        let mut pool = futures::executor::LocalPool::new();
        let spawner = pool.spawner();
        pool.run_until(async move {
            let (chan, reactor, _output, _input) = new_reactor();
            let handle = spawner
                .spawn_with_handle(reactor.run())
                .expect("spawn failed");
            let (pending, _circ_reactor) = chan.new_circ().await.unwrap();
            assert!(u32::from(pending.peek_circid()) >= 0x8000_0000);
            chan.terminate();
            let _ = handle.await;
        });
    }

    #[test]
    fn bad_cells_are_errors() {
        futures::executor::block_on(async {
            let (_chan, mut reactor, _output, mut input) = new_reactor();
            // A CREATE_FAST cell from the network is nonsense: we're the
            // client.
            input
                .send(Ok(ChanCell::new(
                    CircId::new(10),
                    msg::CreateFast::new(&b"x"[..]).into(),
                )))
                .await
                .unwrap();
            let e = reactor.run_once().await;
            assert!(matches!(e, Err(ReactorError::Err(Error::ChanProto(_)))));
        });
    }

    #[test]
    fn destroy_for_unknown_circuit() {
        futures::executor::block_on(async {
            let (_chan, mut reactor, _output, mut input) = new_reactor();
            input
                .send(Ok(ChanCell::new(
                    CircId::new(77),
                    msg::Destroy::new(DestroyReason::NONE).into(),
                )))
                .await
                .unwrap();
            let e = reactor.run_once().await;
            assert!(matches!(e, Err(ReactorError::Err(Error::ChanProto(_)))));
        });
    }
}
