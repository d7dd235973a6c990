//! End-to-end tests for the circuit manager, against a scripted
//! in-process relay network.

mod common;

use common::{test_dir_relay, test_relay, ExitOp, FakeDirectory, FakeNetwork};

use std::time::Duration;

use velum_cell::relaycell::msg::EndReason;
use velum_circmgr::events::InitEvent;
use velum_circmgr::{
    CircMgr, CircMgrConfig, CircuitPoolingBuilder, CircuitTimingBuilder, DirectoryStreamRequest,
    Error, ExitPolicy, ExitTarget, OpenStreamStatus,
};

use futures::StreamExt;

/// Build a config with the given clean floor and stream-open timeout.
fn test_config(clean_floor: usize, stream_timeout: Duration) -> CircMgrConfig {
    CircMgrConfig::builder()
        .circuit_timing(
            CircuitTimingBuilder::default()
                .stream_timeout(stream_timeout)
                .build()
                .expect("bad timing config"),
        )
        .pooling(
            CircuitPoolingBuilder::default()
                .clean_floor(clean_floor)
                .build()
                .expect("bad pooling config"),
        )
        .build()
        .expect("bad config")
}

/// A three-relay network where only R3 is an exit, admitting port 80.
fn small_relay_set() -> Vec<velum_circmgr::directory::Relay> {
    vec![
        test_relay("R1", 1, ExitPolicy::reject_all()),
        test_relay("R2", 2, ExitPolicy::reject_all()),
        test_relay("R3", 3, ExitPolicy::accept_ports(&[80])),
    ]
}

#[tokio::test(start_paused = true)]
async fn build_and_open() {
    let relays = small_relay_set();
    let dir = FakeDirectory::new(relays.clone());
    let net = FakeNetwork::new(&relays);
    let mgr = CircMgr::new(CircMgrConfig::default(), dir, net);
    mgr.start_building_circuits();

    let response = mgr.open_exit_stream_to("example.com", 80).await.expect("request failed");
    assert_eq!(response.status(), OpenStreamStatus::StreamOpened);
    assert_eq!(mgr.n_pending_requests(), 0);

    // The circuit that carried the stream is active but no longer
    // clean.
    let (clean, _pending, active) = mgr.counts();
    assert!(active >= 1);
    assert!(clean < active);
}

#[tokio::test(start_paused = true)]
async fn exit_failure_fallback() {
    let mut relays = small_relay_set();
    relays.push(test_relay("R4", 4, ExitPolicy::accept_ports(&[80])));
    let dir = FakeDirectory::new(relays.clone());
    let net = FakeNetwork::new(&relays);
    // R3 refuses everything for a while.
    net.set_exit_script("R3", vec![ExitOp::Refuse(EndReason::EXITPOLICY); 16]);

    let mgr = CircMgr::new(
        test_config(0, Duration::from_secs(20)),
        dir,
        net,
    );

    // One circuit exists when the request arrives, and it exits at R3.
    let circ3 = mgr.create_new_circuit(false);
    circ3
        .open_circuit(vec![relays[0].clone(), relays[1].clone(), relays[2].clone()], None)
        .await
        .expect("build failed");
    assert!(circ3.is_clean());

    mgr.start_building_circuits();
    let mgr2 = mgr.clone();
    let request = tokio::spawn(async move { mgr2.open_exit_stream_to("example.com", 80).await });

    let response = request.await.expect("task died").expect("request failed");
    assert_eq!(response.status(), OpenStreamStatus::StreamOpened);

    // The refusal was remembered: the R3 circuit won't be retried for
    // this target, so some other circuit carried the stream.
    let target = ExitTarget::from_hostname("example.com", 80);
    assert!(!circ3.can_handle_exit_to(&target));
    assert!(circ3.is_connected());
}

#[tokio::test(start_paused = true)]
async fn stream_timeout_accounting() {
    let relays = small_relay_set();
    let dir = FakeDirectory::new(relays.clone());
    let net = FakeNetwork::new(&relays);
    // R3 never answers stream requests.
    net.set_exit_script("R3", vec![ExitOp::Ignore; 3]);

    let mgr = CircMgr::new(
        test_config(0, Duration::from_millis(100)),
        dir,
        net,
    );
    let circuit = mgr.create_new_circuit(false);
    circuit
        .open_circuit(
            vec![relays[0].clone(), relays[1].clone(), relays[2].clone()],
            None,
        )
        .await
        .expect("build failed");

    for i in 0..3 {
        let target = ExitTarget::from_hostname(&format!("host{}.example", i), 80);
        let response = circuit.open_exit_stream(&target).await.expect("open failed");
        assert_eq!(response.status(), OpenStreamStatus::StreamTimeout);
    }

    // Three consecutive timeouts exhaust the circuit's allowance.
    assert!(!circuit.is_connected());
    assert_eq!(mgr.counts(), (0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn cancellation() {
    // No relays: a request can never be satisfied.
    let dir = FakeDirectory::new(Vec::new());
    let net = FakeNetwork::new(&[]);
    let mgr = CircMgr::new(test_config(0, Duration::from_secs(20)), dir, net);

    {
        let mgr2 = mgr.clone();
        let fut = mgr2.open_exit_stream_to("example.com", 80);
        tokio::pin!(fut);
        // Poll once so the request enters the queue, then drop the
        // future, as an interrupted caller would.
        let _ = futures::poll!(fut.as_mut());
        assert_eq!(mgr.n_pending_requests(), 1);
    }
    assert_eq!(mgr.n_pending_requests(), 0);

    // A waiter that is interrupted by shutdown sees the interruption.
    let mgr3 = mgr.clone();
    let waiter = tokio::spawn(async move { mgr3.open_exit_stream_to("example.com", 80).await });
    while mgr.n_pending_requests() == 0 {
        tokio::task::yield_now().await;
    }
    mgr.retire_all_circuits();
    let result = waiter.await.expect("task died");
    assert!(matches!(result, Err(Error::Interrupted)));
    assert_eq!(mgr.n_pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn directory_stream() {
    let relay = test_dir_relay("D", 9);
    let dir = FakeDirectory::new(vec![relay.clone()]);
    let net = FakeNetwork::new(&[relay.clone()]);
    let mgr = CircMgr::new(test_config(0, Duration::from_secs(20)), dir, net);

    let mut events = mgr.subscribe_init_events();
    let request = DirectoryStreamRequest::new(relay)
        .with_events(InitEvent::DirCircuitBuilt, InitEvent::DirStreamOpened);
    let response = mgr.open_directory_stream(request).await.expect("request failed");
    assert_eq!(response.status(), OpenStreamStatus::StreamOpened);

    // Exactly one one-hop circuit was built, and it is carrying a
    // stream now.
    assert_eq!(mgr.counts(), (0, 0, 1));

    // The initialization events fired in order.
    assert_eq!(events.next().await, Some(InitEvent::DirCircuitBuilt));
    assert_eq!(events.next().await, Some(InitEvent::DirStreamOpened));
}

#[tokio::test(start_paused = true)]
async fn destroy_propagation() {
    let relays = small_relay_set();
    let dir = FakeDirectory::new(relays.clone());
    let net = FakeNetwork::new(&relays);
    // R3 accepts the stream, then destroys the circuit on first data.
    net.set_exit_script("R3", vec![ExitOp::ConnectThenDestroyOnData]);

    let mgr = CircMgr::new(test_config(0, Duration::from_secs(20)), dir, net);
    let circuit = mgr.create_new_circuit(false);
    circuit
        .open_circuit(
            vec![relays[0].clone(), relays[1].clone(), relays[2].clone()],
            None,
        )
        .await
        .expect("build failed");

    let target = ExitTarget::from_hostname("example.com", 80);
    let response = circuit.open_exit_stream(&target).await.expect("open failed");
    let mut stream = response.into_stream().expect("no stream");

    stream.write_all(b"ping").await.expect("write failed");

    // The destroy arrives mid-stream: every stream on the circuit
    // returns an aborted result.
    let mut buf = [0_u8; 16];
    assert!(stream.read(&mut buf).await.is_err());

    // And the circuit leaves all three registries.
    while circuit.is_connected() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(mgr.counts(), (0, 0, 0));
}
