//! Shared fixtures: a scripted peer and an in-memory connection pool.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use shardlink_netif::wire::{
    encode_reply, MsgHeader, OpCode, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, HTTP_PROBE_LENGTH,
};
use shardlink_netif::{
    CallbackHandle, ConnectError, ConnectionPool, DocumentBuilder, HostAndPort, Lease,
    NetworkInterface, NetworkInterfaceConfig, Protocol, RemoteCommandRequest, ResponseStatus,
    WireCodec,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Installs a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the scripted peer answers commands other than the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    /// `{ ok: 1, echo: <command name> }`.
    Reply,
    /// Reads the command and never answers.
    Silent,
    /// Answers with a header carrying the HTTP probe length.
    BadLength,
}

/// Serves frames on `stream` until it closes, reporting each received
/// command name on `seen`.
pub async fn serve_peer<S>(mut stream: S, behavior: PeerBehavior, seen: mpsc::Sender<String>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = WireCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
    loop {
        let mut hdr = [0u8; HEADER_SIZE];
        if stream.read_exact(&mut hdr).await.is_err() {
            return;
        }
        let Ok(header) = codec.decode_header(&hdr) else {
            return;
        };
        let mut body = vec![0u8; header.body_len()];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let Ok(message) = codec.decode_body(&header, &body) else {
            return;
        };
        let name = message
            .command()
            .and_then(|c| c.first_key())
            .unwrap_or_default()
            .to_string();
        let _ = seen.send(name.clone());

        let protocol = if header.op_code == OpCode::Command as i32 {
            Protocol::OpCommand
        } else {
            Protocol::OpQuery
        };
        let reply = if name == "isMaster" {
            DocumentBuilder::new()
                .append_bool("ismaster", true)
                .append_i32("maxWireVersion", 6)
                .append_i32("ok", 1)
                .build()
        } else {
            match behavior {
                PeerBehavior::Silent => continue,
                PeerBehavior::BadLength => {
                    let bogus = MsgHeader {
                        message_length: HTTP_PROBE_LENGTH,
                        request_id: 1,
                        response_to: header.request_id,
                        op_code: OpCode::Reply as i32,
                    };
                    let _ = stream.write_all(&bogus.to_bytes()).await;
                    continue;
                }
                PeerBehavior::Reply => DocumentBuilder::new()
                    .append_i32("ok", 1)
                    .append_str("echo", &name)
                    .build(),
            }
        };
        let metadata = DocumentBuilder::new().append_i32("$replyMeta", 1).build();
        let frame = encode_reply(protocol, 1, header.request_id, &reply, &metadata);
        if stream.write_all(&frame.to_bytes()).await.is_err() {
            return;
        }
    }
}

/// Pool handing out in-memory duplex connections to a scripted peer.
pub struct FakePool {
    behavior: PeerBehavior,
    seen: Mutex<mpsc::Sender<String>>,
    idle: Mutex<Vec<Lease>>,
    releases: Mutex<Vec<(u64, bool)>>,
    next_id: AtomicU64,
}

impl FakePool {
    /// Creates the pool and the receiver of command names its peers see.
    pub fn new(behavior: PeerBehavior) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let pool = Arc::new(Self {
            behavior,
            seen: Mutex::new(tx),
            idle: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });
        (pool, rx)
    }

    /// `(connection id, dropped)` for every release so far.
    pub fn releases(&self) -> Vec<(u64, bool)> {
        self.releases.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionPool for FakePool {
    async fn acquire(
        &self,
        target: &HostAndPort,
        now: Instant,
        _timeout: Duration,
    ) -> Result<Lease, ConnectError> {
        let idle = self.idle.lock().unwrap().pop();
        if let Some(mut lease) = idle {
            lease.record_reuse();
            return Ok(lease);
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        let seen = self.seen.lock().unwrap().clone();
        tokio::spawn(serve_peer(server, self.behavior, seen));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Lease::new(id, target.clone(), Box::new(client), now))
    }

    fn release(&self, lease: Lease, _now: Instant, drop_connection: bool) {
        self.releases
            .lock()
            .unwrap()
            .push((lease.id(), drop_connection));
        if !drop_connection {
            self.idle.lock().unwrap().push(lease);
        }
    }
}

/// A started interface over a fake pool.
pub fn fake_interface(
    behavior: PeerBehavior,
    config: NetworkInterfaceConfig,
) -> (NetworkInterface, Arc<FakePool>, mpsc::Receiver<String>) {
    init_tracing();
    let (pool, seen) = FakePool::new(behavior);
    let net = NetworkInterface::new(config, pool.clone()).unwrap();
    net.startup().unwrap();
    (net, pool, seen)
}

/// `{ ping: 1 }` against `admin` on a nominal target.
pub fn ping(target: HostAndPort) -> RemoteCommandRequest {
    RemoteCommandRequest::new(
        target,
        "admin",
        DocumentBuilder::new().append_i32("ping", 1).build(),
    )
}

/// Starts `request` and returns a receiver for its completion.
pub fn submit(
    net: &NetworkInterface,
    handle: u64,
    request: RemoteCommandRequest,
) -> mpsc::Receiver<ResponseStatus> {
    let (tx, rx) = mpsc::channel();
    net.start_command(CallbackHandle::new(handle), request, move |status| {
        let _ = tx.send(status);
    });
    rx
}

/// Waits for the next command name the peer reports.
pub fn next_seen(seen: &mpsc::Receiver<String>) -> String {
    seen.recv_timeout(Duration::from_secs(5))
        .expect("peer saw no command")
}

/// Waits for a completion.
pub fn wait(rx: &mpsc::Receiver<ResponseStatus>) -> ResponseStatus {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("command did not complete")
}
