//! Multi-hop paths over the network.
//!
//! A client circuit is constructed by this instance, and used on its own
//! behalf to send data over the network.  Each circuit has multiple hops
//! over the network: each hop knows only the hop before and the hop
//! after.  The client shares a separate set of keys with each hop.
//!
//! To build a circuit, first create a [`crate::channel::Channel`], then
//! call its [`crate::channel::Channel::new_circ`] method.  This yields a
//! [`PendingClientCirc`] object that won't become live until you call
//! [`PendingClientCirc::create_firsthop_fast`].  After that, you can
//! call [`ClientCirc::extend`] to build the circuit into a multi-hop
//! circuit, and [`ClientCirc::begin_stream`] to get a stream for
//! anonymized data.
//!
//! # Implementation
//!
//! Each open circuit has a corresponding [`reactor::Reactor`] object
//! that runs in an asynchronous task, and manages incoming cells from
//! the circuit's upstream channel.  These cells are either RELAY cells
//! or DESTROY cells.  DESTROY cells are handled immediately.  RELAY
//! cells are either for a particular stream, in which case they get
//! forwarded to a [`crate::stream::StreamReader`] object, or for no
//! particular stream, in which case they are considered "meta" cells
//! (like EXTENDED2) that should only get accepted if something is
//! waiting for them.

pub(crate) mod celltypes;
pub(crate) mod halfcirc;
mod halfstream;
mod path;
pub mod reactor;
pub(crate) mod sendme;
mod streammap;
mod unique_id;

use crate::channel::Channel;
use crate::circuit::celltypes::{ClientCircChanMsg, CreateResponse};
use crate::circuit::reactor::{CtrlMsg, Reactor};
use crate::stream::{DataStream, StreamReader};
use crate::{Error, Result};

pub use crate::circuit::path::Path;
pub use crate::circuit::unique_id::UniqId;

use velum_cell::chancell::CircId;
use velum_cell::relaycell::msg::{AnyRelayMsg, Begin, BeginDir, End, EncodedLinkSpec};
use velum_cell::relaycell::StreamId;

use futures::channel::{mpsc, oneshot};
use std::sync::Arc;

/// The size of the buffer for communication between `ClientCirc` and its
/// reactor.
pub const CIRCUIT_BUFFER_SIZE: usize = 128;

/// A circuit that we have constructed over the network.
///
/// This struct is the interface used by the rest of the code.  It is
/// fairly cheaply cloneable; none of the public methods need mutable
/// access, since they all actually communicate with the Reactor, which
/// contains the primary mutable state and does the actual work.
#[derive(Clone, Debug)]
pub struct ClientCirc {
    /// Information about this circuit's path.
    path: Arc<Path>,
    /// A unique identifier for this circuit.
    unique_id: UniqId,
    /// Channel to send control messages to the reactor.
    control: mpsc::UnboundedSender<CtrlMsg>,
    /// The channel that this ClientCirc is connected to and using to
    /// speak with its first hop.
    ///
    /// # Warning
    ///
    /// Don't use this field to send or receive any data!  All network
    /// operations should be done by the circuit reactor.
    channel: Channel,
    /// For testing purposes: the CircId, for use in peek_circid().
    #[cfg(test)]
    circid: CircId,
}

/// A ClientCirc that needs to send a create cell and receive a CREATED*
/// cell.
///
/// To use one of these, call [`PendingClientCirc::create_firsthop_fast`]
/// to negotiate the cryptographic handshake with the first hop.
pub struct PendingClientCirc {
    /// A oneshot receiver on which we'll receive a CREATED* cell, or a
    /// DESTROY cell.
    recvcreated: oneshot::Receiver<CreateResponse>,
    /// The ClientCirc object that we can expose on success.
    circ: ClientCirc,
}

/// A handle to a stream on a particular circuit, used by the stream
/// types to send data and closes.
#[derive(Clone, Debug)]
pub(crate) struct StreamTarget {
    /// Which hop of the circuit this stream is with.
    hop_num: u8,
    /// Reactor ID for this stream.
    stream_id: StreamId,
    /// Channel to send cells down.
    tx: mpsc::Sender<AnyRelayMsg>,
    /// Reference to the circuit that this stream is on.
    circ: ClientCirc,
}

impl StreamTarget {
    /// Deliver a relay message for this stream's reactor to send.
    pub(crate) async fn send(&mut self, msg: AnyRelayMsg) -> Result<()> {
        use futures::SinkExt;
        self.tx.send(msg).await.map_err(|_| Error::CircuitClosed)?;
        Ok(())
    }

    /// Ask the reactor to close this stream, sending the given END
    /// message if the stream is still open.
    pub(crate) fn close(&self, message: End) {
        let _ = self.circ.control.unbounded_send(CtrlMsg::CloseStream {
            hop_num: self.hop_num,
            stream_id: self.stream_id,
            message,
        });
    }

    /// Return the process-unique identifier of this stream's circuit.
    pub(crate) fn circuit_unique_id(&self) -> UniqId {
        self.circ.unique_id
    }
}

impl ClientCirc {
    /// Return a description of all the hops in this circuit.
    pub fn path(&self) -> Vec<String> {
        self.path.all_hops()
    }

    /// Return the number of hops in this circuit.
    ///
    /// NOTE: This function will currently return only the number of
    /// hops _currently_ in the circuit.  If there is an extend operation
    /// in progress, the currently pending hop may or may not be counted,
    /// depending on whether the extend operation finishes before this
    /// call is done.
    pub fn n_hops(&self) -> usize {
        self.path.n_hops()
    }

    /// Return a reference to the channel that this circuit is connected
    /// to.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Extend the circuit, via the fast handshake carried in an EXTEND2
    /// message, to a new target last hop.
    ///
    /// `label` is a short description of the target relay for logging;
    /// `linkspecs` tell the current last relay how to reach it.
    pub async fn extend(&self, label: &str, linkspecs: Vec<EncodedLinkSpec>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.control
            .unbounded_send(CtrlMsg::Extend {
                label: label.to_string(),
                linkspecs,
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;
        rx.await.map_err(|_| Error::CircuitClosed)??;
        Ok(())
    }

    /// Helper, used to begin a stream.
    ///
    /// This function allocates a stream ID and sends the message (like
    /// a BEGIN or BEGIN_DIR), but doesn't wait for a response.
    async fn begin_stream_impl(&self, begin_msg: AnyRelayMsg) -> Result<(StreamReader, StreamTarget)> {
        let num_hops = self.path.n_hops();
        if num_hops == 0 {
            return Err(crate::internal!("Can't begin a stream at the 0th hop"));
        }
        let hop_num = u8::try_from(num_hops - 1)
            .map_err(|_| crate::internal!("Couldn't convert path length to u8"))?;
        let (sender, receiver) = mpsc::channel(CIRCUIT_BUFFER_SIZE);
        let (msg_tx, msg_rx) = mpsc::channel(CIRCUIT_BUFFER_SIZE);
        let (tx, rx) = oneshot::channel();

        self.control
            .unbounded_send(CtrlMsg::BeginStream {
                hop_num,
                message: begin_msg,
                sender,
                rx: msg_rx,
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;

        let stream_id = rx.await.map_err(|_| Error::CircuitClosed)??;

        let target = StreamTarget {
            circ: self.clone(),
            tx: msg_tx,
            hop_num,
            stream_id,
        };

        let reader = StreamReader::new(receiver);

        Ok((reader, target))
    }

    /// Start a stream to the given address and port, using a BEGIN
    /// message.
    ///
    /// The use of a string for the address is intentional: you should
    /// let the exit relay do the hostname lookup for you.
    ///
    /// This function waits until the stream is connected (or refused);
    /// the caller is responsible for enforcing a timeout.
    pub async fn begin_stream(&self, target: &str, port: u16) -> Result<DataStream> {
        let beginmsg = Begin::new(target, port, 0).map_err(Error::from_cell_enc)?;
        let (reader, target) = self.begin_stream_impl(beginmsg.into()).await?;
        let mut stream = DataStream::new(reader, target);
        stream.wait_for_connection().await?;
        Ok(stream)
    }

    /// Start a new stream to the last relay in the circuit, using a
    /// BEGIN_DIR message.
    ///
    /// Directory streams are opened optimistically: we have already
    /// authenticated the relay and built a circuit to it, so no
    /// additional checks should be needed before the request succeeds.
    pub async fn begin_dir_stream(&self) -> Result<DataStream> {
        let (reader, target) = self
            .begin_stream_impl(BeginDir::default().into())
            .await?;
        Ok(DataStream::new(reader, target))
    }

    /// Shut down this circuit, along with all streams that are using it.
    /// Happens asynchronously (i.e. the circuit won't necessarily be
    /// done shutting down immediately after this function returns).
    ///
    /// Note that other references to this circuit may exist.  If they
    /// do, they will stop working after you call this function.
    pub fn terminate(&self) {
        let _ = self.control.unbounded_send(CtrlMsg::Shutdown);
    }

    /// Called when a circuit-level protocol error has occurred and the
    /// circuit needs to shut down.
    pub fn protocol_error(&self) {
        self.terminate();
    }

    /// Return true if this circuit is closed and therefore unusable.
    pub fn is_closing(&self) -> bool {
        self.control.is_closed()
    }

    /// Return a process-unique identifier for this circuit.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }
}

impl PendingClientCirc {
    /// Instantiate a new circuit object: used from
    /// `Channel::new_circ()`.
    ///
    /// Does not send a CREATE* cell on its own.
    pub(crate) fn new(
        id: CircId,
        channel: Channel,
        createdreceiver: oneshot::Receiver<CreateResponse>,
        input: mpsc::Receiver<ClientCircChanMsg>,
        unique_id: UniqId,
    ) -> (PendingClientCirc, Reactor) {
        let (reactor, control_tx, path) = Reactor::new(channel.clone(), id, unique_id, input);

        let circuit = ClientCirc {
            path,
            unique_id,
            control: control_tx,
            channel,
            #[cfg(test)]
            circid: id,
        };

        let pending = PendingClientCirc {
            recvcreated: createdreceiver,
            circ: circuit,
        };
        (pending, reactor)
    }

    /// Testing only: extract the circuit ID for this pending circuit.
    #[cfg(test)]
    pub(crate) fn peek_circid(&self) -> CircId {
        self.circ.circid
    }

    /// Use the (questionable!) fast handshake to connect to the first
    /// hop of this circuit.
    ///
    /// There's no authentication in the fast handshake, so we don't need
    /// to know whom we're connecting to: we're just connecting to
    /// whichever relay the channel is for.
    pub async fn create_firsthop_fast(self) -> Result<ClientCirc> {
        let (tx, rx) = oneshot::channel();
        self.circ
            .control
            .unbounded_send(CtrlMsg::Create {
                recv_created: self.recvcreated,
                done: tx,
            })
            .map_err(|_| Error::CircuitClosed)?;

        rx.await.map_err(|_| Error::CircuitClosed)??;

        Ok(self.circ)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::channel::reactor::test::new_reactor;
    use crate::crypto::cell::{CryptStatePair, RelayCellBody, RelayCrypt, SEED_LEN};
    use crate::crypto::handshake::fast::CreateFastServer;
    use crate::crypto::handshake::KeyGenerator;

    use futures::SinkExt;
    use velum_cell::chancell::msg::{self as chanmsg, AnyChanMsg};
    use velum_cell::chancell::{AnyChanCell, BoxedCellBody, ChanCell};
    use velum_cell::relaycell::msg::{self as relaymsg, AnyRelayMsg, RelayMsg as _};
    use velum_cell::relaycell::AnyRelayMsgOuter;

    /// The state a scripted relay keeps for one circuit.
    struct FakeRelay {
        /// Our shared cryptographic state with the client.
        crypt: CryptStatePair,
    }

    impl FakeRelay {
        /// Answer a CREATE_FAST (or extend-carried) handshake body.
        fn handshake(body: &[u8]) -> (Vec<u8>, FakeRelay) {
            let mut rng = rand::thread_rng();
            let (reply, keygen) = CreateFastServer::server(&mut rng, body).unwrap();
            let seed = keygen.expand(SEED_LEN).unwrap();
            let crypt = CryptStatePair::initialize(&seed).unwrap();
            (reply, FakeRelay { crypt })
        }
    }

    /// Decrypt an outbound relay cell through `relays` in order; it must
    /// be recognized exactly at the last one.
    fn decrypt_outbound(relays: &mut [FakeRelay], body: BoxedCellBody) -> AnyRelayMsgOuter {
        let mut rcb: RelayCellBody = body.into();
        let (last, earlier) = relays.split_last_mut().unwrap();
        for relay in earlier {
            assert!(!relay.crypt.decrypt_outbound(&mut rcb));
        }
        assert!(last.crypt.decrypt_outbound(&mut rcb));
        AnyRelayMsgOuter::decode(rcb.into()).unwrap()
    }

    /// Encrypt `msg` as though it came from the last relay in `relays`,
    /// and return the channel cell carrying it.
    fn inbound_from_last(
        relays: &mut [FakeRelay],
        circid: velum_cell::chancell::CircId,
        streamid: Option<StreamId>,
        msg: AnyRelayMsg,
    ) -> AnyChanCell {
        let mut rng = rand::thread_rng();
        let mut rcb: RelayCellBody = AnyRelayMsgOuter::new(streamid, msg)
            .encode(&mut rng)
            .unwrap()
            .into();
        let (last, earlier) = relays.split_last_mut().unwrap();
        last.crypt.originate(&mut rcb);
        last.crypt.encrypt_inbound(&mut rcb);
        for relay in earlier.iter_mut().rev() {
            relay.crypt.encrypt_inbound(&mut rcb);
        }
        let relay = chanmsg::Relay::from_raw(*BoxedCellBody::from(rcb));
        ChanCell::new(Some(circid), relay.into())
    }

    /// Take the next outbound channel cell and return its relay body.
    async fn next_relay_body(
        outbound: &mut futures::channel::mpsc::Receiver<AnyChanCell>,
    ) -> BoxedCellBody {
        use futures::StreamExt;
        let cell = outbound.next().await.unwrap();
        let (_, msg) = cell.into_circid_and_msg();
        match msg {
            AnyChanMsg::Relay(r) => r.into_relay_body(),
            m => panic!("expected RELAY cell, got {:?}", m),
        }
    }

    #[tokio::test]
    async fn build_circuit_and_run_stream() {
        use futures::StreamExt;
        let (chan, chan_reactor, mut outbound, mut inbound) = new_reactor();
        tokio::spawn(chan_reactor.run());

        let (pending, circ_reactor) = chan.new_circ().await.unwrap();
        let circid = pending.peek_circid();
        tokio::spawn(circ_reactor.run());

        // --- first hop: CREATE_FAST / CREATED_FAST ---
        let create_task = tokio::spawn(pending.create_firsthop_fast());
        let cell = outbound.next().await.unwrap();
        let (id, msg) = cell.into_circid_and_msg();
        assert_eq!(id, Some(circid));
        let hs_body = match msg {
            AnyChanMsg::CreateFast(cf) => cf.handshake().to_vec(),
            m => panic!("expected CREATE_FAST, got {:?}", m),
        };
        let (reply, relay1) = FakeRelay::handshake(&hs_body);
        inbound
            .send(Ok(ChanCell::new(
                Some(circid),
                chanmsg::CreatedFast::new(reply).into(),
            )))
            .await
            .unwrap();
        let circ = create_task.await.unwrap().unwrap();
        assert_eq!(circ.n_hops(), 1);
        let mut relays = vec![relay1];

        // --- second hop: EXTEND2 / EXTENDED2 ---
        let circ2 = circ.clone();
        let extend_task =
            tokio::spawn(async move { circ2.extend("middle", vec![]).await });
        let body = next_relay_body(&mut outbound).await;
        let outer = decrypt_outbound(&mut relays, body);
        assert!(outer.stream_id().is_none());
        let ex = match outer.into_msg() {
            AnyRelayMsg::Extend2(e) => e,
            m => panic!("expected EXTEND2, got {}", m.cmd()),
        };
        assert_eq!(ex.handshake_type(), reactor::HANDSHAKE_TYPE_FAST);
        let (reply, relay2) = FakeRelay::handshake(ex.handshake());
        let extended = relaymsg::Extended2::new(reply);
        let cell = inbound_from_last(&mut relays, circid, None, extended.into());
        inbound.send(Ok(cell)).await.unwrap();
        extend_task.await.unwrap().unwrap();
        assert_eq!(circ.n_hops(), 2);
        relays.push(relay2);

        // --- a directory stream over the two-hop circuit ---
        let mut stream = circ.begin_dir_stream().await.unwrap();
        let body = next_relay_body(&mut outbound).await;
        let outer = decrypt_outbound(&mut relays, body);
        let sid = outer.stream_id().unwrap();
        assert!(matches!(outer.msg(), AnyRelayMsg::BeginDir(_)));

        let cell = inbound_from_last(
            &mut relays,
            circid,
            Some(sid),
            relaymsg::Connected::new_empty().into(),
        );
        inbound.send(Ok(cell)).await.unwrap();
        stream.wait_for_connection().await.unwrap();

        stream.write_all(b"GET /consensus\r\n").await.unwrap();
        let body = next_relay_body(&mut outbound).await;
        let outer = decrypt_outbound(&mut relays, body);
        assert_eq!(outer.stream_id(), Some(sid));
        match outer.into_msg() {
            AnyRelayMsg::Data(d) => assert_eq!(d.as_ref(), b"GET /consensus\r\n"),
            m => panic!("expected DATA, got {}", m.cmd()),
        }

        let cell = inbound_from_last(
            &mut relays,
            circid,
            Some(sid),
            relaymsg::Data::new(b"HTTP/1.0 200 OK\r\n").unwrap().into(),
        );
        inbound.send(Ok(cell)).await.unwrap();
        let mut buf = [0_u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.0 200 OK\r\n");

        let cell = inbound_from_last(
            &mut relays,
            circid,
            Some(sid),
            relaymsg::End::new_with_reason(relaymsg::EndReason::DONE).into(),
        );
        inbound.send(Ok(cell)).await.unwrap();
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn destroy_aborts_streams() {
        use futures::StreamExt;
        let (chan, chan_reactor, mut outbound, mut inbound) = new_reactor();
        tokio::spawn(chan_reactor.run());

        let (pending, circ_reactor) = chan.new_circ().await.unwrap();
        let circid = pending.peek_circid();
        tokio::spawn(circ_reactor.run());

        let create_task = tokio::spawn(pending.create_firsthop_fast());
        let cell = outbound.next().await.unwrap();
        let (_, msg) = cell.into_circid_and_msg();
        let hs_body = match msg {
            AnyChanMsg::CreateFast(cf) => cf.handshake().to_vec(),
            m => panic!("expected CREATE_FAST, got {:?}", m),
        };
        let (reply, _relay1) = FakeRelay::handshake(&hs_body);
        inbound
            .send(Ok(ChanCell::new(
                Some(circid),
                chanmsg::CreatedFast::new(reply).into(),
            )))
            .await
            .unwrap();
        let circ = create_task.await.unwrap().unwrap();

        // Open a stream, but destroy the circuit before CONNECTED.
        let mut stream = circ.begin_dir_stream().await.unwrap();
        let _ = next_relay_body(&mut outbound).await;
        inbound
            .send(Ok(ChanCell::new(
                Some(circid),
                chanmsg::Destroy::new(chanmsg::DestroyReason::FINISHED).into(),
            )))
            .await
            .unwrap();

        // Every waiter on the circuit gets an aborted result.
        let err = stream.wait_for_connection().await.unwrap_err();
        assert!(matches!(err, Error::CircuitClosed));
        let mut buf = [0_u8; 8];
        assert!(stream.read(&mut buf).await.is_err());
    }
}
