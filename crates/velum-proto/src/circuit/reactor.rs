//! Code to handle the client side of a single circuit: the reactor that
//! owns the circuit's cryptographic state, stream table, and
//! flow-control windows.
//!
//! All changes to that state happen on this task; handles
//! ([`ClientCirc`](super::ClientCirc), stream objects) talk to the
//! reactor over message channels.  One consequence is that a stalled
//! flow-control window suspends only the reactor's interest in the
//! stalled stream: nothing holds a lock across a network write.

use crate::channel::Channel;
use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::path::Path;
use crate::circuit::sendme::{
    cmd_counts_towards_windows, CircRecvWindow, CircSendWindow, RecvWindow, SendWindow,
};
use crate::circuit::streammap::{ShouldSendEnd, StreamEnt, StreamMap};
use crate::circuit::UniqId;
use crate::crypto::cell::{
    CryptStatePair, InboundClientCrypt, OutboundClientCrypt, RelayCellBody, SENDME_TAG_LEN,
};
use crate::crypto::handshake::fast::CreateFastClient;
use crate::stream::cmdcheck::StreamStatus;
use crate::util::err::ReactorError;
use crate::{Error, Result};

use velum_cell::chancell::msg as chanmsg;
use velum_cell::chancell::{BoxedCellBody, ChanCell, CircId};
use velum_cell::relaycell::msg::{
    AnyRelayMsg, End, EncodedLinkSpec, Extend2, Extended2, RelayMsg, Sendme,
};
use velum_cell::relaycell::{AnyRelayMsgOuter, RelayCmd, StreamId};

use futures::channel::{mpsc, oneshot};
use futures::stream::StreamExt;
use futures::task::Poll;

use std::sync::Arc;
use tracing::{debug, trace};

/// The handshake type value we use in EXTEND2 messages.
///
/// (Carrying the fast handshake in an EXTEND2 is particular to this
/// implementation; the message format treats the body as opaque.)
pub const HANDSHAKE_TYPE_FAST: u16 = 0x0001;

/// The type of a oneshot channel used to inform reactor users of the
/// result of an operation.
pub(super) type ReactorResultChannel<T> = oneshot::Sender<Result<T>>;

/// A message telling the circuit reactor to do something.
#[derive(Debug)]
pub(super) enum CtrlMsg {
    /// Finish the handshake for the first hop, using the CREATE_FAST
    /// handshake.
    Create {
        /// A oneshot that the channel reactor will resolve with our
        /// CREATED* or DESTROY cell.
        recv_created: oneshot::Receiver<CreateResponse>,
        /// Oneshot channel to notify on completion.
        done: ReactorResultChannel<()>,
    },
    /// Extend the circuit by one hop, using the fast handshake carried
    /// in an EXTEND2 message.
    Extend {
        /// A short label for the target relay, for the path display.
        label: String,
        /// Link specifiers describing the target relay.
        linkspecs: Vec<EncodedLinkSpec>,
        /// Oneshot channel to notify on completion.
        done: ReactorResultChannel<()>,
    },
    /// Begin a stream with the provided begin message.
    BeginStream {
        /// The hop on the circuit that the stream is with.
        hop_num: u8,
        /// The message to send.
        message: AnyRelayMsg,
        /// A channel to send messages on this stream down.
        sender: mpsc::Sender<AnyRelayMsg>,
        /// A channel on which the stream will send messages to be
        /// relayed.
        rx: mpsc::Receiver<AnyRelayMsg>,
        /// Oneshot channel to notify on completion, with the allocated
        /// stream ID.
        done: ReactorResultChannel<StreamId>,
    },
    /// Close the specified pending or open stream, sending the provided
    /// END message if the other side hasn't ended the stream already.
    CloseStream {
        /// The hop on the circuit that the stream is with.
        hop_num: u8,
        /// The stream ID to close.
        stream_id: StreamId,
        /// The END message to send, if any is needed.
        message: End,
    },
    /// Shut down the reactor.
    Shutdown,
}

/// Represents the reactor's view of a single hop.
pub(super) struct CircHop {
    /// Map from stream IDs to streams.
    map: StreamMap,
    /// Window used to say how many cells we can send.
    sendwindow: CircSendWindow,
    /// Window used to say how many cells we can receive.
    recvwindow: CircRecvWindow,
}

impl CircHop {
    /// Create a new hop.
    fn new() -> Self {
        CircHop {
            map: StreamMap::new(),
            sendwindow: SendWindow::new(1000),
            recvwindow: RecvWindow::new_at_start(),
        }
    }
}

/// What to do next, as determined by one poll of the reactor's inputs.
enum Action {
    /// A control message (or the end of the control channel) arrived.
    Ctrl(Option<CtrlMsg>),
    /// A cell (or the end of the input) arrived from the channel.
    Input(Option<ClientCircChanMsg>),
    /// A stream has a message to send, or its sender was dropped.
    StreamMsg(u8, StreamId, Option<AnyRelayMsg>),
}

/// Object to handle incoming cells and outgoing messages on a circuit.
///
/// This type is returned when you call `Channel::new_circ`; you need to
/// spawn a new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the circuit won't work."]
pub struct Reactor {
    /// Receiver for control messages from the circuit's handles.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// Input stream, on which we receive messages from the channel's
    /// reactor.
    input: mpsc::Receiver<ClientCircChanMsg>,
    /// The channel this circuit is attached to.
    channel: Channel,
    /// The cryptographic state for this circuit for outbound cells.
    crypto_out: OutboundClientCrypt,
    /// The cryptographic state for this circuit for inbound cells.
    crypto_in: InboundClientCrypt,
    /// List of hops state objects used by the reactor.
    hops: Vec<CircHop>,
    /// An identifier for this circuit on its channel.
    circ_id: CircId,
    /// A process-unique identifier for this circuit, for logging.
    unique_id: UniqId,
    /// A description of the circuit's path, shared with its handles.
    path: Arc<Path>,
}

impl Reactor {
    /// Construct a new reactor, along with the control-message sender
    /// and shared path record its handles will use.
    pub(super) fn new(
        channel: Channel,
        circ_id: CircId,
        unique_id: UniqId,
        input: mpsc::Receiver<ClientCircChanMsg>,
    ) -> (Self, mpsc::UnboundedSender<CtrlMsg>, Arc<Path>) {
        let (control_tx, control_rx) = mpsc::unbounded();
        let path = Arc::new(Path::default());
        let reactor = Reactor {
            control: control_rx,
            input,
            channel,
            crypto_out: OutboundClientCrypt::new(),
            crypto_in: InboundClientCrypt::new(),
            hops: Vec::new(),
            circ_id,
            unique_id,
            path: Arc::clone(&path),
        };
        (reactor, control_tx, path)
    }

    /// Launch the reactor, and run until the circuit closes or we
    /// encounter an error.
    ///
    /// Once this function returns, the circuit is dead, and can't be
    /// used again.
    pub async fn run(mut self) -> Result<()> {
        trace!("{}: Running circuit reactor", self.unique_id);
        let result: Result<()> = loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorError::Shutdown) => break Ok(()),
                Err(ReactorError::Err(e)) => break Err(e),
            }
        };
        debug!("{}: Circuit reactor stopped: {:?}", self.unique_id, result);
        // Tell the channel that this circuit is gone.  (If the channel
        // already removed us -- say, because the peer sent a DESTROY --
        // this is a no-op.)
        let _ = self.channel.close_circuit(self.circ_id);
        result
    }

    /// Helper for run(): handles only one action.
    async fn run_once(&mut self) -> std::result::Result<(), ReactorError> {
        let action = futures::future::poll_fn(|cx| {
            // Control messages first: shutdowns and closes should not
            // be starved by traffic.
            if let Poll::Ready(v) = self.control.poll_next_unpin(cx) {
                return Poll::Ready(Action::Ctrl(v));
            }
            if let Poll::Ready(v) = self.input.poll_next_unpin(cx) {
                return Poll::Ready(Action::Input(v));
            }
            // Streams with something to send, gated on the windows.  A
            // stream whose window (or whose circuit's window) is empty
            // is simply not polled; the SENDME that reopens the window
            // arrives via `input` and wakes us.
            for (h, hop) in self.hops.iter_mut().enumerate() {
                if !hop.sendwindow.can_send() {
                    continue;
                }
                for (sid, ent) in hop.map.open_ents_mut() {
                    if !ent.send_window.can_send() {
                        continue;
                    }
                    if let Poll::Ready(v) = ent.rx.poll_next_unpin(cx) {
                        #[allow(clippy::cast_possible_truncation)]
                        return Poll::Ready(Action::StreamMsg(h as u8, sid, v));
                    }
                }
            }
            Poll::Pending
        })
        .await;

        match action {
            Action::Ctrl(None) | Action::Ctrl(Some(CtrlMsg::Shutdown)) => {
                Err(ReactorError::Shutdown)
            }
            Action::Ctrl(Some(msg)) => {
                self.handle_control(msg).await?;
                Ok(())
            }
            Action::Input(None) => Err(ReactorError::Shutdown),
            Action::Input(Some(cell)) => {
                self.handle_cell(cell).await?;
                Ok(())
            }
            Action::StreamMsg(hop_num, stream_id, Some(msg)) => {
                let cell = AnyRelayMsgOuter::new(Some(stream_id), msg);
                self.send_relay_cell(hop_num, cell).await?;
                Ok(())
            }
            Action::StreamMsg(hop_num, stream_id, None) => {
                // The stream's sender went away: every handle is gone,
                // so close the stream.
                self.close_stream(hop_num, stream_id, End::new_misc())
                    .await?;
                Ok(())
            }
        }
    }

    /// Handle a CtrlMsg other than Shutdown.
    async fn handle_control(&mut self, msg: CtrlMsg) -> Result<()> {
        match msg {
            CtrlMsg::Shutdown => {
                // was handled in run_once.
            }
            CtrlMsg::Create { recv_created, done } => {
                let ret = self.create_firsthop(recv_created).await;
                let _ = done.send(ret);
            }
            CtrlMsg::Extend {
                label,
                linkspecs,
                done,
            } => {
                let ret = self.extend(label, linkspecs).await;
                let _ = done.send(ret);
            }
            CtrlMsg::BeginStream {
                hop_num,
                message,
                sender,
                rx,
                done,
            } => {
                let ret = self.begin_stream(hop_num, message, sender, rx).await;
                let _ = done.send(ret);
            }
            CtrlMsg::CloseStream {
                hop_num,
                stream_id,
                message,
            } => {
                self.close_stream(hop_num, stream_id, message).await?;
            }
        }
        Ok(())
    }

    /// Return a mutable reference to the state for a given hop.
    fn hop_mut(&mut self, hop_num: u8) -> Result<&mut CircHop> {
        self.hops
            .get_mut(usize::from(hop_num))
            .ok_or(Error::NoSuchHop)
    }

    /// Install the cryptographic layers for a newly completed hop.
    fn add_hop(&mut self, label: String, pair: CryptStatePair) {
        let (fwd, back) = pair.split();
        self.crypto_out.add_layer(fwd);
        self.crypto_in.add_layer(back);
        self.hops.push(CircHop::new());
        self.path.push_hop(label);
    }

    /// Run the CREATE_FAST handshake with the first hop.
    async fn create_firsthop(
        &mut self,
        recv_created: oneshot::Receiver<CreateResponse>,
    ) -> Result<()> {
        if !self.hops.is_empty() {
            return Err(crate::internal!(
                "Tried to create the first hop twice on the same circuit"
            ));
        }
        let fast = CreateFastClient::new(&mut rand::thread_rng());
        let create = chanmsg::CreateFast::new(fast.handshake());
        let cell = ChanCell::new(Some(self.circ_id), create.into());
        self.channel.send_cell(cell).await?;

        let reply = recv_created.await.map_err(|_| Error::ChannelClosed)?;
        let created = match reply {
            CreateResponse::CreatedFast(cf) => cf,
            CreateResponse::Destroy(d) => {
                return Err(Error::CircDestroy { reason: d.reason() });
            }
            CreateResponse::Created2(_) => {
                return Err(Error::ChanProto(
                    "Got CREATED2 in response to a CREATE_FAST".into(),
                ));
            }
        };
        let keygen = fast.finish(&created.into_body())?;
        let pair = CryptStatePair::construct(keygen)?;
        let label = self.channel.peer().to_string();
        self.add_hop(label, pair);
        trace!("{}: first hop created", self.unique_id);
        Ok(())
    }

    /// Run the extend handshake with a new target hop, via an EXTEND2
    /// message to the current last hop.
    async fn extend(&mut self, label: String, linkspecs: Vec<EncodedLinkSpec>) -> Result<()> {
        let last_hop = self.last_hop_num()?;
        let fast = CreateFastClient::new(&mut rand::thread_rng());
        let extend = Extend2::new(linkspecs, HANDSHAKE_TYPE_FAST, fast.handshake());
        let cell = AnyRelayMsgOuter::new(None, extend.into());
        self.send_relay_cell(last_hop, cell).await?;

        let extended = self.wait_for_extended().await?;
        let keygen = fast.finish(&extended.into_body())?;
        let pair = CryptStatePair::construct(keygen)?;
        self.add_hop(label, pair);
        trace!("{}: extended to {} hops", self.unique_id, self.hops.len());
        Ok(())
    }

    /// Wait for the EXTENDED2 answer to an extend request, processing
    /// other inbound cells normally while we wait.
    ///
    /// There is at most one handshake outstanding on a circuit at a
    /// time, so any other meta cell that arrives here is a protocol
    /// violation.
    async fn wait_for_extended(&mut self) -> Result<Extended2> {
        loop {
            let item = self.input.next().await.ok_or(Error::ChannelClosed)?;
            match item {
                ClientCircChanMsg::Destroy(d) => {
                    return Err(Error::CircDestroy { reason: d.reason() });
                }
                ClientCircChanMsg::Relay(r) => {
                    if let Some(meta) = self.handle_relay_cell(r, true).await? {
                        match meta {
                            AnyRelayMsg::Extended2(e) => return Ok(e),
                            m => {
                                return Err(Error::CircProto(format!(
                                    "Unexpected {} cell while extending",
                                    m.cmd()
                                )));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Return the index of the last hop, or an error if the circuit has
    /// no hops yet.
    fn last_hop_num(&self) -> Result<u8> {
        let n = self.hops.len();
        if n == 0 {
            return Err(crate::internal!("Can't act on a circuit with no hops"));
        }
        u8::try_from(n - 1).map_err(|_| crate::internal!("Couldn't convert hop count to u8"))
    }

    /// Allocate a stream ID and send the BEGIN-type message for a new
    /// stream.
    async fn begin_stream(
        &mut self,
        hop_num: u8,
        message: AnyRelayMsg,
        sender: mpsc::Sender<AnyRelayMsg>,
        rx: mpsc::Receiver<AnyRelayMsg>,
    ) -> Result<StreamId> {
        let id = self.hop_mut(hop_num)?.map.add_ent(sender, rx)?;
        let cell = AnyRelayMsgOuter::new(Some(id), message);
        self.send_relay_cell(hop_num, cell).await?;
        Ok(id)
    }

    /// Close the stream with the given ID, sending `message` if the
    /// other side hasn't closed it first.
    async fn close_stream(&mut self, hop_num: u8, stream_id: StreamId, message: End) -> Result<()> {
        let should_send_end = self.hop_mut(hop_num)?.map.terminate(stream_id)?;
        if should_send_end == ShouldSendEnd::Send {
            let cell = AnyRelayMsgOuter::new(Some(stream_id), message.into());
            self.send_relay_cell(hop_num, cell).await?;
        }
        Ok(())
    }

    /// Encrypt `cell` for the given hop, take the windows it consumes,
    /// and hand it to the channel.
    async fn send_relay_cell(&mut self, hop_num: u8, cell: AnyRelayMsgOuter) -> Result<()> {
        let c_t_w = cmd_counts_towards_windows(cell.cmd());
        let stream_id = cell.stream_id();
        let mut body: RelayCellBody = cell
            .encode(&mut rand::thread_rng())
            .map_err(Error::from_cell_enc)?
            .into();
        let tag = self.crypto_out.encrypt(&mut body, hop_num)?;
        if c_t_w {
            let hop = self.hop_mut(hop_num)?;
            hop.sendwindow.take(&tag)?;
            if let Some(sid) = stream_id {
                if let Some(StreamEnt::Open(ent)) = hop.map.get_mut(sid) {
                    ent.send_window.take(&())?;
                }
            }
        }
        let msg = chanmsg::Relay::from_raw(*BoxedCellBody::from(body));
        let cell = ChanCell::new(Some(self.circ_id), msg.into());
        self.channel.send_cell(cell).await
    }

    /// Handle a cell that arrived from the channel.
    async fn handle_cell(&mut self, cell: ClientCircChanMsg) -> Result<()> {
        match cell {
            ClientCircChanMsg::Destroy(d) => {
                debug!(
                    "{}: circuit destroyed by peer: {}",
                    self.unique_id,
                    d.reason().human_str()
                );
                Err(Error::CircDestroy { reason: d.reason() })
            }
            ClientCircChanMsg::Relay(r) => {
                if let Some(m) = self.handle_relay_cell(r, false).await? {
                    return Err(Error::CircProto(format!(
                        "Unexpected {} cell on client circuit",
                        m.cmd()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Decrypt and dispatch one inbound RELAY cell.
    ///
    /// If the cell is a meta cell (one with no stream ID, other than
    /// SENDME or TRUNCATED) and `allow_meta` is true, return it for the
    /// caller to consume; if `allow_meta` is false, a meta cell is an
    /// error.
    async fn handle_relay_cell(
        &mut self,
        cell: chanmsg::Relay,
        allow_meta: bool,
    ) -> Result<Option<AnyRelayMsg>> {
        let mut body: RelayCellBody = cell.into_relay_body().into();
        let (hop_num, tag) = self.crypto_in.decrypt(&mut body)?;
        let msg = AnyRelayMsgOuter::decode(body.into()).map_err(Error::from_cell_dec)?;
        let c_t_w = cmd_counts_towards_windows(msg.cmd());

        if c_t_w {
            let send_circ_sendme = self.hop_mut(hop_num)?.recvwindow.take()?;
            if send_circ_sendme {
                // Acknowledge with the digest of the cell that exhausted
                // this window increment, so the other side can
                // authenticate our SENDME.
                let sendme = Sendme::new_tag(tag);
                let cell = AnyRelayMsgOuter::new(None, sendme.into());
                self.send_relay_cell(hop_num, cell).await?;
                self.hop_mut(hop_num)?.recvwindow.put();
            }
        }

        let (stream_id, msg) = msg.into_streamid_and_msg();
        let Some(stream_id) = stream_id else {
            return self.handle_meta_cell(hop_num, msg, allow_meta);
        };
        self.handle_stream_cell(hop_num, stream_id, msg).await?;
        Ok(None)
    }

    /// Handle a relay message addressed to the circuit itself rather
    /// than to a stream.
    fn handle_meta_cell(
        &mut self,
        hop_num: u8,
        msg: AnyRelayMsg,
        allow_meta: bool,
    ) -> Result<Option<AnyRelayMsg>> {
        match msg {
            AnyRelayMsg::Sendme(s) => {
                // A circuit-level SENDME: replenish this hop's send
                // window, checking the authentication tag if one was
                // provided.
                let tag = match s.into_tag() {
                    Some(v) => Some(<[u8; SENDME_TAG_LEN]>::try_from(&v[..]).map_err(|_| {
                        Error::CircProto("Bad tag length on circuit SENDME".into())
                    })?),
                    None => None,
                };
                self.hop_mut(hop_num)?.sendwindow.put(tag.as_ref())?;
                Ok(None)
            }
            AnyRelayMsg::Truncated(t) => Err(Error::CircProto(format!(
                "Circuit truncated: {}",
                t.reason().human_str()
            ))),
            AnyRelayMsg::Drop(_) => Ok(None),
            m if allow_meta => Ok(Some(m)),
            m => Err(Error::CircProto(format!(
                "Unexpected {} cell on client circuit",
                m.cmd()
            ))),
        }
    }

    /// Handle a relay message addressed to a particular stream.
    async fn handle_stream_cell(
        &mut self,
        hop_num: u8,
        stream_id: StreamId,
        msg: AnyRelayMsg,
    ) -> Result<()> {
        let cmd = msg.cmd();
        let c_t_w = cmd_counts_towards_windows(cmd);

        let mut send_stream_sendme = false;
        let mut remove_after_end = false;
        let mut close_receiverless = false;
        {
            let hop = self.hop_mut(hop_num)?;
            let Some(ent) = hop.map.get_mut(stream_id) else {
                return Err(Error::CircProto(
                    "Cell received on nonexistent stream!?".into(),
                ));
            };
            match ent {
                StreamEnt::Open(open) => {
                    if cmd == RelayCmd::SENDME {
                        open.send_window.put(None)?;
                        return Ok(());
                    }
                    if c_t_w {
                        send_stream_sendme = open.recv_window.take()?;
                    }
                    let status = open.cmd_checker.check_msg(cmd)?;
                    remove_after_end = status == StreamStatus::Closed;
                    // Deliver the message to the stream's reader.  If
                    // the reader is gone and the stream isn't over
                    // anyway, we have to close it ourselves.
                    use futures::SinkExt;
                    if open.sink.send(msg).await.is_err() && !remove_after_end {
                        close_receiverless = true;
                    }
                }
                StreamEnt::EndSent(half) => {
                    let status = half.handle_msg(cmd)?;
                    remove_after_end = status == StreamStatus::Closed;
                }
                StreamEnt::EndReceived => {
                    return Err(Error::CircProto(
                        "Cell received on already-ended stream!?".into(),
                    ));
                }
            }
        }

        if remove_after_end {
            self.hop_mut(hop_num)?.map.ending_msg_received(stream_id)?;
        } else if close_receiverless {
            self.close_stream(hop_num, stream_id, End::new_misc()).await?;
        }
        if send_stream_sendme {
            let sendme = Sendme::new_empty();
            let cell = AnyRelayMsgOuter::new(Some(stream_id), sendme.into());
            self.send_relay_cell(hop_num, cell).await?;
            if let Some(StreamEnt::Open(open)) = self.hop_mut(hop_num)?.map.get_mut(stream_id) {
                open.recv_window.put();
            }
        }
        Ok(())
    }
}
