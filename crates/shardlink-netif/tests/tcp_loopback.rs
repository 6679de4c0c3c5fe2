//! The interface over real sockets, using the bundled TCP pool.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use common::{init_tracing, next_seen, ping, serve_peer, submit, wait, PeerBehavior};
use shardlink_netif::{
    ConnectError, HostAndPort, NetworkError, NetworkInterface, NetworkInterfaceConfig,
};

/// Runs a scripted peer on an ephemeral loopback port in its own runtime.
fn spawn_server(behavior: PeerBehavior) -> (HostAndPort, mpsc::Receiver<String>) {
    let (seen_tx, seen_rx) = mpsc::channel();
    let (addr_tx, addr_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_peer(stream, behavior, seen_tx.clone()));
            }
        });
    });
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    (HostAndPort::new("127.0.0.1", addr.port()), seen_rx)
}

fn started(config: NetworkInterfaceConfig) -> NetworkInterface {
    init_tracing();
    let net = NetworkInterface::with_tcp_pool(config).unwrap();
    net.startup().unwrap();
    net
}

#[test]
fn test_round_trip_over_tcp() {
    let (target, seen) = spawn_server(PeerBehavior::Reply);
    let net = started(NetworkInterfaceConfig::default());

    let reply = wait(&submit(&net, 1, ping(target.clone()))).unwrap();
    assert_eq!(reply.data.get_str("echo"), Some("ping"));
    assert_eq!(next_seen(&seen), "isMaster");
    assert_eq!(next_seen(&seen), "ping");

    wait(&submit(&net, 2, ping(target))).unwrap();
    assert_eq!(next_seen(&seen), "ping");

    let metrics = net.metrics();
    assert_eq!(metrics.connections_opened, 1);
    assert_eq!(metrics.connections_reused, 1);
    assert!(metrics.bytes_sent > 0);
    assert!(metrics.bytes_received > 0);
    net.shutdown();
}

#[test]
fn test_connection_refused() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let net = started(NetworkInterfaceConfig::default());

    let status = wait(&submit(&net, 1, ping(HostAndPort::new("127.0.0.1", port))));
    assert!(
        matches!(status, Err(NetworkError::Connect(ConnectError::Refused { .. }))),
        "{:?}",
        status
    );
    assert_eq!(net.metrics().commands_failed, 1);
    assert_eq!(net.metrics().connections_opened, 0);
}

#[test]
fn test_timeout_over_tcp_discards_connection() {
    let (target, seen) = spawn_server(PeerBehavior::Silent);
    let net = started(NetworkInterfaceConfig::default());

    let request = ping(target.clone()).with_timeout(Duration::from_millis(100));
    assert_eq!(
        wait(&submit(&net, 1, request)),
        Err(NetworkError::ExceededTimeLimit { timeout_ms: 100 })
    );
    assert_eq!(next_seen(&seen), "isMaster");
    assert_eq!(next_seen(&seen), "ping");

    // The timed out connection is not reused, so the next command reconnects.
    let retry = ping(target).with_timeout(Duration::from_millis(100));
    assert!(wait(&submit(&net, 2, retry)).is_err());
    assert_eq!(next_seen(&seen), "isMaster");
    assert_eq!(net.metrics().connections_opened, 2);
    assert_eq!(net.metrics().connections_dropped, 2);
}
