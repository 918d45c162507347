#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Data-plane tests: real sockets, a shell script standing in for the transcoder

mod common;

use radio_relay::bus::{RelayEvent, SharedBus};
use radio_relay::pipeline::Transcoder;
use radio_relay::relay::Relay;
use radio_relay::store::SharedStore;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    _dir: tempfile::TempDir,
    addr: SocketAddr,
    store: SharedStore,
    events: broadcast::Receiver<RelayEvent>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

async fn start(stations: usize, transcoder: impl FnOnce(&Path) -> Transcoder, backoff: Duration) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let (store, bus): (SharedStore, SharedBus) = common::store(dir.path(), stations, None, "http://metadata.test");
    let events = bus.subscribe();
    let relay = Relay::new(store.clone(), transcoder(dir.path()), bus).with_failure_backoff(backoff);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(relay.serve(listener, shutdown.clone()));

    Running {
        _dir: dir,
        addr,
        store,
        events,
        shutdown,
        task,
    }
}

async fn start_echo(stations: usize) -> Running {
    start(
        stations,
        |dir| Transcoder::new(common::echo_transcoder(dir)).with_reap_timeout(Duration::from_secs(2)),
        Duration::ZERO,
    )
    .await
}

async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(addr).await.unwrap())
}

async fn read_line(client: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    timeout(WAIT, client.read_line(&mut line))
        .await
        .expect("timed out waiting for audio")
        .unwrap();
    line.trim_end().to_string()
}

/// Drain until the relay closes the connection
async fn wait_closed(client: &mut BufReader<TcpStream>) {
    let mut buf = [0u8; 8192];
    timeout(WAIT, async {
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await
    .expect("connection was not closed");
}

async fn next_event(events: &mut broadcast::Receiver<RelayEvent>) -> RelayEvent {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap();
        if !matches!(event, RelayEvent::StationChanged { .. }) {
            return event;
        }
    }
}

fn peer_of(client: &BufReader<TcpStream>) -> String {
    client.get_ref().local_addr().unwrap().to_string()
}

#[tokio::test]
async fn streams_current_station_to_client() {
    let mut relay = start_echo(3).await;
    let mut client = connect(relay.addr).await;

    assert_eq!(read_line(&mut client).await, "stream-0");

    match next_event(&mut relay.events).await {
        RelayEvent::ClientAttached { peer, index, station } => {
            assert_eq!(peer, peer_of(&client));
            assert_eq!(index, 0);
            assert_eq!(station, "station-0");
        }
        other => panic!("expected attach, got {:?}", other),
    }
    let snapshot = relay.store.snapshot().await;
    assert_eq!(snapshot.client.map(|c| c.peer), Some(peer_of(&client)));
}

#[tokio::test]
async fn next_drops_client_and_reconnect_gets_new_station() {
    let relay = start_echo(3).await;
    let mut first = connect(relay.addr).await;
    assert_eq!(read_line(&mut first).await, "stream-0");

    let switch = relay.store.advance_to_next().await;
    assert_eq!(switch.index, 1);
    wait_closed(&mut first).await;

    let mut second = connect(relay.addr).await;
    assert_eq!(read_line(&mut second).await, "stream-1");
}

#[tokio::test]
async fn client_disconnect_is_broken_pipe_and_loop_continues() {
    let mut relay = start_echo(2).await;
    let mut first = connect(relay.addr).await;
    assert_eq!(read_line(&mut first).await, "stream-0");
    let first_peer = peer_of(&first);
    drop(first);

    assert!(matches!(next_event(&mut relay.events).await, RelayEvent::ClientAttached { .. }));
    match next_event(&mut relay.events).await {
        RelayEvent::ClientDetached { peer, bytes_copied, outcome } => {
            assert_eq!(peer, first_peer);
            assert!(bytes_copied > 0);
            assert!(outcome.contains("broken pipe"), "got {}", outcome);
        }
        other => panic!("expected detach, got {:?}", other),
    }
    assert!(relay.store.snapshot().await.client.is_none());

    let mut second = connect(relay.addr).await;
    assert_eq!(read_line(&mut second).await, "stream-0");
}

#[tokio::test]
async fn clients_are_served_one_at_a_time() {
    let mut relay = start_echo(2).await;
    let mut first = connect(relay.addr).await;
    assert_eq!(read_line(&mut first).await, "stream-0");

    // Queued in the backlog, but not accepted while the first run is live
    let mut second = connect(relay.addr).await;
    let mut buf = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(300), second.read(&mut buf)).await.is_err(),
        "second client received data while the first was streaming"
    );

    let first_peer = peer_of(&first);
    drop(first);
    assert_eq!(read_line(&mut second).await, "stream-0");

    let order: Vec<(bool, String)> = {
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(match next_event(&mut relay.events).await {
                RelayEvent::ClientAttached { peer, .. } => (true, peer),
                RelayEvent::ClientDetached { peer, .. } => (false, peer),
                RelayEvent::StationChanged { .. } => unreachable!(),
            });
        }
        order
    };
    assert_eq!(
        order,
        vec![
            (true, first_peer.clone()),
            (false, first_peer),
            (true, peer_of(&second)),
        ]
    );
}

#[tokio::test]
async fn spawn_failure_closes_client_and_keeps_accepting() {
    let mut relay = start(
        2,
        |dir| Transcoder::new(dir.join("missing-ffmpeg")),
        Duration::ZERO,
    )
    .await;

    for _ in 0..2 {
        let mut client = connect(relay.addr).await;
        wait_closed(&mut client).await;

        assert!(matches!(next_event(&mut relay.events).await, RelayEvent::ClientAttached { .. }));
        match next_event(&mut relay.events).await {
            RelayEvent::ClientDetached { bytes_copied, outcome, .. } => {
                assert_eq!(bytes_copied, 0);
                assert!(outcome.contains("spawn failed"), "got {}", outcome);
            }
            other => panic!("expected detach, got {:?}", other),
        }
    }
    assert!(relay.store.snapshot().await.client.is_none());
}

#[tokio::test]
async fn failed_runs_back_off_before_next_accept() {
    let backoff = Duration::from_millis(400);
    let mut relay = start(2, |dir| Transcoder::new(dir.join("missing-ffmpeg")), backoff).await;

    let _first = connect(relay.addr).await;
    let _second = connect(relay.addr).await;

    assert!(matches!(next_event(&mut relay.events).await, RelayEvent::ClientAttached { .. }));
    assert!(matches!(next_event(&mut relay.events).await, RelayEvent::ClientDetached { .. }));
    let detached_at = Instant::now();
    assert!(matches!(next_event(&mut relay.events).await, RelayEvent::ClientAttached { .. }));

    assert!(
        detached_at.elapsed() >= Duration::from_millis(300),
        "next client accepted after {:?}",
        detached_at.elapsed()
    );
}

#[tokio::test]
async fn transcoder_that_exits_ends_the_stream() {
    let mut relay = start(
        1,
        |dir| Transcoder::new(common::script(dir, "short-ffmpeg", "printf 'pcm'\nexit 0")),
        Duration::ZERO,
    )
    .await;

    let mut client = connect(relay.addr).await;
    let mut received = Vec::new();
    timeout(WAIT, client.read_to_end(&mut received)).await.unwrap().unwrap();
    assert_eq!(received, b"pcm");

    next_event(&mut relay.events).await;
    match next_event(&mut relay.events).await {
        RelayEvent::ClientDetached { bytes_copied, outcome, .. } => {
            assert_eq!(bytes_copied, 3);
            assert!(outcome.contains("stream ended"), "got {}", outcome);
        }
        other => panic!("expected detach, got {:?}", other),
    }
}

#[tokio::test]
async fn cancelling_shutdown_stops_idle_relay() {
    let relay = start_echo(2).await;

    relay.shutdown.cancel();

    timeout(Duration::from_secs(2), relay.task)
        .await
        .expect("relay did not stop")
        .unwrap();
    assert!(TcpStream::connect(relay.addr).await.is_err());
}
