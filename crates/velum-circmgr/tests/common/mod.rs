//! A scripted in-process relay network for exercising the circuit
//! manager end to end.
//!
//! The network hands out real `velum-proto` channels whose far ends are
//! driven by a simulator task: it answers handshakes with the real
//! server-side crypto, tracks every hop's keys, and consults a
//! per-relay script to decide how to respond to stream requests.

#![allow(dead_code)] // not every test file uses every helper.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};

use velum_cell::chancell::msg::{self as chanmsg, AnyChanMsg};
use velum_cell::chancell::{AnyChanCell, BoxedCellBody, ChanCell, CircId};
use velum_cell::relaycell::msg::{self as relaymsg, AnyRelayMsg, EndReason};
use velum_cell::relaycell::{AnyRelayMsgOuter, StreamId};

use velum_circmgr::channels::ChannelProvider;
use velum_circmgr::directory::{Directory, Relay};
use velum_circmgr::{Error, ExitPolicy, Result};

use velum_proto::channel::codec::CodecError;
use velum_proto::channel::Channel;
use velum_proto::crypto::cell::{CryptStatePair, RelayCellBody, RelayCrypt, SEED_LEN};
use velum_proto::crypto::handshake::fast::CreateFastServer;
use velum_proto::crypto::handshake::KeyGenerator;

/// What a scripted exit should do with the next stream request that
/// reaches it.
#[derive(Clone, Debug)]
pub enum ExitOp {
    /// Accept the stream with a CONNECTED.
    Connect,
    /// Refuse the stream with an END carrying this reason.
    Refuse(EndReason),
    /// Ignore the request entirely (the client will time out).
    Ignore,
    /// Accept the stream, then destroy the whole circuit when the first
    /// DATA cell arrives on it.
    ConnectThenDestroyOnData,
}

/// Shared state for the whole simulated network.
pub struct SimState {
    /// Map from relay identity to nickname.
    names: HashMap<[u8; 20], String>,
    /// Scripted behaviors per relay nickname.  When a relay's queue is
    /// empty, it accepts.
    scripts: Mutex<HashMap<String, VecDeque<ExitOp>>>,
}

impl SimState {
    /// Pop the next scripted operation for `nickname`.
    fn next_op(&self, nickname: &str) -> ExitOp {
        let mut scripts = self.scripts.lock().expect("poisoned lock");
        scripts
            .get_mut(nickname)
            .and_then(|q| q.pop_front())
            .unwrap_or(ExitOp::Connect)
    }
}

/// A simulated relay network usable as a [`ChannelProvider`].
pub struct FakeNetwork {
    /// Shared state between all the channel simulators.
    state: Arc<SimState>,
}

impl FakeNetwork {
    /// Create a network that knows about the given relays.
    pub fn new(relays: &[Relay]) -> Arc<Self> {
        let names = relays
            .iter()
            .map(|r| (*r.identity(), r.nickname().to_string()))
            .collect();
        Arc::new(FakeNetwork {
            state: Arc::new(SimState {
                names,
                scripts: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Script the next responses of the relay with `nickname`.
    pub fn set_exit_script<I: IntoIterator<Item = ExitOp>>(&self, nickname: &str, ops: I) {
        let mut scripts = self.state.scripts.lock().expect("poisoned lock");
        scripts
            .entry(nickname.to_string())
            .or_default()
            .extend(ops);
    }
}

#[async_trait]
impl ChannelProvider for FakeNetwork {
    async fn get_or_launch(&self, relay: &Relay) -> Result<Channel> {
        let nickname = self
            .state
            .names
            .get(relay.identity())
            .cloned()
            .ok_or_else(|| Error::NoPath(format!("unknown relay {}", relay.nickname())))?;

        let (client_tx, sim_rx) = mpsc::channel::<AnyChanCell>(64);
        let (sim_tx, client_rx) = mpsc::channel::<std::result::Result<AnyChanCell, CodecError>>(64);

        let sink = Box::new(client_tx.sink_map_err(|_| {
            CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated peer went away",
            ))
        }));
        let stream = Box::new(client_rx);
        let (channel, reactor) = Channel::new(4, sink, stream, nickname.clone());
        tokio::spawn(reactor.run());
        tokio::spawn(run_relay_sim(
            Arc::clone(&self.state),
            nickname,
            sim_rx,
            sim_tx,
        ));
        Ok(channel)
    }
}

/// The per-circuit state a channel simulator keeps.
struct SimCircuit {
    /// The shared crypto state with the client, one entry per hop.
    hops: Vec<CryptStatePair>,
    /// The nickname of the relay at each hop.
    hop_names: Vec<String>,
    /// Stream IDs that should trigger a DESTROY when DATA arrives.
    destroy_on_data: Vec<StreamId>,
}

/// Run the far side of one channel: answer handshakes and scripted
/// stream requests for every circuit the client multiplexes onto it.
async fn run_relay_sim(
    state: Arc<SimState>,
    first_hop: String,
    mut from_client: mpsc::Receiver<AnyChanCell>,
    mut to_client: mpsc::Sender<std::result::Result<AnyChanCell, CodecError>>,
) {
    let mut circuits: HashMap<CircId, SimCircuit> = HashMap::new();

    while let Some(cell) = from_client.next().await {
        let (circid, msg) = cell.into_circid_and_msg();
        let Some(circid) = circid else { continue };
        match msg {
            AnyChanMsg::CreateFast(cf) => {
                let (reply, pair) = answer_handshake(cf.handshake());
                circuits.insert(
                    circid,
                    SimCircuit {
                        hops: vec![pair],
                        hop_names: vec![first_hop.clone()],
                        destroy_on_data: Vec::new(),
                    },
                );
                let created = chanmsg::CreatedFast::new(reply);
                if to_client
                    .send(Ok(ChanCell::new(Some(circid), created.into())))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            AnyChanMsg::Relay(r) => {
                let Some(circ) = circuits.get_mut(&circid) else {
                    continue;
                };
                let replies = handle_relay_cell(&state, circ, r);
                for (hop, sid, msg) in replies {
                    let cell = if matches!(msg, SimReply::Destroy) {
                        circuits.remove(&circid);
                        ChanCell::new(
                            Some(circid),
                            chanmsg::Destroy::new(chanmsg::DestroyReason::NONE).into(),
                        )
                    } else {
                        let SimReply::Relay(m) = msg else { unreachable!() };
                        let Some(circ) = circuits.get_mut(&circid) else {
                            break;
                        };
                        encrypt_from_hop(circ, hop, circid, sid, m)
                    };
                    if to_client.send(Ok(cell)).await.is_err() {
                        return;
                    }
                }
            }
            AnyChanMsg::Destroy(_) => {
                circuits.remove(&circid);
            }
            _ => {}
        }
    }
}

/// A reply queued by the simulator: either a relay message from a hop,
/// or a circuit-level DESTROY.
enum SimReply {
    /// A relay message to be onion-encrypted from the given hop.
    Relay(AnyRelayMsg),
    /// Tear the circuit down.
    Destroy,
}

/// Answer a fast-handshake body, returning the reply body and the
/// shared relay-side crypto state.
fn answer_handshake(body: &[u8]) -> (Vec<u8>, CryptStatePair) {
    let mut rng = rand::thread_rng();
    let (reply, keygen) = CreateFastServer::server(&mut rng, body).expect("bad handshake");
    let seed = keygen.expand(SEED_LEN).expect("keygen failed");
    let pair = CryptStatePair::initialize(&seed).expect("bad seed");
    (reply, pair)
}

/// Process one outbound relay cell: decrypt to the hop it addresses,
/// then decide what that hop sends back.
fn handle_relay_cell(
    state: &SimState,
    circ: &mut SimCircuit,
    cell: chanmsg::Relay,
) -> Vec<(usize, Option<StreamId>, SimReply)> {
    let mut rcb: RelayCellBody = cell.into_relay_body().into();
    let mut recognized_at = None;
    for (i, hop) in circ.hops.iter_mut().enumerate() {
        if hop.decrypt_outbound(&mut rcb) {
            recognized_at = Some(i);
            break;
        }
    }
    let Some(hop) = recognized_at else {
        // Unrecognized cell: a real relay would destroy the circuit,
        // but in tests this is always a harness bug.
        panic!("relay sim: cell not recognized at any hop");
    };
    let outer = AnyRelayMsgOuter::decode(rcb.into()).expect("undecodable relay cell");
    let (sid, msg) = outer.into_streamid_and_msg();
    let hop_name = circ.hop_names[hop].clone();

    match msg {
        AnyRelayMsg::Extend2(ex) => {
            // Pretend to connect onward: just add the new hop's keys.
            let id: [u8; 20] = ex.linkspec()[0]
                .body()
                .try_into()
                .expect("linkspec body was not an identity");
            let next_name = state.names.get(&id).cloned().unwrap_or_default();
            let (reply, pair) = answer_handshake(ex.handshake());
            circ.hops.push(pair);
            circ.hop_names.push(next_name);
            vec![(
                hop,
                None,
                SimReply::Relay(relaymsg::Extended2::new(reply).into()),
            )]
        }
        AnyRelayMsg::BeginDir(_) => {
            vec![(
                hop,
                sid,
                SimReply::Relay(relaymsg::Connected::new_empty().into()),
            )]
        }
        AnyRelayMsg::Begin(_) => match state.next_op(&hop_name) {
            ExitOp::Connect => vec![(
                hop,
                sid,
                SimReply::Relay(relaymsg::Connected::new_empty().into()),
            )],
            ExitOp::Refuse(reason) => vec![(
                hop,
                sid,
                SimReply::Relay(relaymsg::End::new_with_reason(reason).into()),
            )],
            ExitOp::Ignore => Vec::new(),
            ExitOp::ConnectThenDestroyOnData => {
                if let Some(sid) = sid {
                    circ.destroy_on_data.push(sid);
                }
                vec![(
                    hop,
                    sid,
                    SimReply::Relay(relaymsg::Connected::new_empty().into()),
                )]
            }
        },
        AnyRelayMsg::Data(_) => {
            if sid.map_or(false, |s| circ.destroy_on_data.contains(&s)) {
                vec![(hop, None, SimReply::Destroy)]
            } else {
                Vec::new()
            }
        }
        // Closes, acknowledgements, and padding need no answer.
        AnyRelayMsg::End(_) | AnyRelayMsg::Sendme(_) | AnyRelayMsg::Drop(_) => Vec::new(),
        other => {
            panic!("relay sim: unexpected {:?}", other);
        }
    }
}

/// Onion-encrypt `msg` as though hop `hop` of `circ` sent it.
fn encrypt_from_hop(
    circ: &mut SimCircuit,
    hop: usize,
    circid: CircId,
    sid: Option<StreamId>,
    msg: AnyRelayMsg,
) -> AnyChanCell {
    let mut rng = rand::thread_rng();
    let mut rcb: RelayCellBody = AnyRelayMsgOuter::new(sid, msg)
        .encode(&mut rng)
        .expect("encode failed")
        .into();
    circ.hops[hop].originate(&mut rcb);
    for h in circ.hops[..=hop].iter_mut().rev() {
        h.encrypt_inbound(&mut rcb);
    }
    let relay = chanmsg::Relay::from_raw(*BoxedCellBody::from(rcb));
    ChanCell::new(Some(circid), relay.into())
}

/// A fixed in-memory directory.
pub struct FakeDirectory {
    /// The relays this directory serves.
    relays: Vec<Relay>,
}

impl FakeDirectory {
    /// Create a directory over the given relays.
    pub fn new(relays: Vec<Relay>) -> Arc<Self> {
        Arc::new(FakeDirectory { relays })
    }
}

impl Directory for FakeDirectory {
    fn usable_relays(&self) -> Vec<Relay> {
        self.relays.clone()
    }
}

/// Construct a relay for tests, with an identity derived from `id_byte`.
pub fn test_relay(nickname: &str, id_byte: u8, policy: ExitPolicy) -> Relay {
    Relay::new(
        nickname,
        [id_byte; 20],
        &format!("192.0.2.{}:9001", id_byte),
        0,
        policy,
    )
}

/// Construct a directory-cache relay for tests.
pub fn test_dir_relay(nickname: &str, id_byte: u8) -> Relay {
    Relay::new(
        nickname,
        [id_byte; 20],
        &format!("192.0.2.{}:9001", id_byte),
        80,
        ExitPolicy::reject_all(),
    )
}
