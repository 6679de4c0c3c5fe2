//! Connection leasing.
//!
//! An operation borrows exclusive use of one connection for its lifetime and
//! gives it back exactly once, telling the pool whether the connection is
//! still fit for reuse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::ConnectError;
use crate::request::HostAndPort;
use crate::wire::ProtocolSet;

/// Byte stream a lease can carry.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Exclusive use of one connection.
pub struct Lease {
    id: u64,
    target: HostAndPort,
    stream: Box<dyn AsyncStream>,
    server_protocols: Option<ProtocolSet>,
    authenticated: bool,
    uses: u64,
    last_used: Instant,
    permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    /// Wraps a freshly opened stream.
    pub fn new(id: u64, target: HostAndPort, stream: Box<dyn AsyncStream>, now: Instant) -> Self {
        Self {
            id,
            target,
            stream,
            server_protocols: None,
            authenticated: false,
            uses: 1,
            last_used: now,
            permit: None,
        }
    }

    /// Pool-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Endpoint the connection is open to.
    pub fn target(&self) -> &HostAndPort {
        &self.target
    }

    /// The underlying stream.
    pub fn stream_mut(&mut self) -> &mut (dyn AsyncStream + 'static) {
        self.stream.as_mut()
    }

    /// Protocols the server announced in its handshake, once negotiated.
    pub fn server_protocols(&self) -> Option<ProtocolSet> {
        self.server_protocols
    }

    /// Records the handshake result.
    pub fn set_server_protocols(&mut self, protocols: ProtocolSet) {
        self.server_protocols = Some(protocols);
    }

    /// Whether the connection has already authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Marks the connection authenticated.
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// How many operations have leased this connection, this one included.
    pub fn uses(&self) -> u64 {
        self.uses
    }

    /// Whether the connection served an earlier operation.
    pub fn is_reused(&self) -> bool {
        self.uses > 1
    }

    /// Counts one more checkout. Pools call this when handing out an idle
    /// connection.
    pub fn record_reuse(&mut self) {
        self.uses += 1;
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("server_protocols", &self.server_protocols)
            .field("authenticated", &self.authenticated)
            .field("uses", &self.uses)
            .finish()
    }
}

/// Source of connection leases.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    /// Leases a connection to `target`, waiting at most `timeout` for one to
    /// become available.
    async fn acquire(
        &self,
        target: &HostAndPort,
        now: Instant,
        timeout: Duration,
    ) -> Result<Lease, ConnectError>;

    /// Gives a lease back. With `drop_connection` the connection is closed
    /// instead of kept for reuse.
    fn release(&self, lease: Lease, now: Instant, drop_connection: bool);

    /// Closes idle connections. Called once when the interface shuts down.
    fn shutdown(&self) {}
}

/// Configuration for [`TcpConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of leased connections per host.
    pub max_connections_per_host: usize,
    /// Maximum number of idle connections kept per host.
    pub max_idle_per_host: usize,
    /// Time allowed for one TCP connect.
    pub connect_timeout: Duration,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
    /// Whether to set `TCP_NODELAY` on new connections.
    pub nodelay: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 8,
            max_idle_per_host: 8,
            connect_timeout: Duration::from_millis(5000),
            idle_timeout: Duration::from_secs(300),
            nodelay: true,
        }
    }
}

/// Statistics about the TCP pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Connections established.
    pub opened: u64,
    /// Leases served from idle connections.
    pub reused: u64,
    /// Connections closed on release or idle expiry.
    pub dropped: u64,
    /// Connections returned to the idle set.
    pub returned: u64,
    /// Idle connections across all hosts.
    pub idle: usize,
}

struct HostState {
    idle: Vec<Lease>,
    permits: Arc<Semaphore>,
}

/// TCP connection pool with per-host limits and idle reuse.
pub struct TcpConnectionPool {
    config: PoolConfig,
    hosts: Mutex<HashMap<HostAndPort, HostState>>,
    next_id: AtomicU64,
    opened: AtomicU64,
    reused: AtomicU64,
    dropped: AtomicU64,
    returned: AtomicU64,
}

impl TcpConnectionPool {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            opened: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            opened: self.opened.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            idle: self.hosts.lock().values().map(|h| h.idle.len()).sum(),
        }
    }

    fn permits(&self, target: &HostAndPort) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        hosts
            .entry(target.clone())
            .or_insert_with(|| HostState {
                idle: Vec::new(),
                permits: Arc::new(Semaphore::new(self.config.max_connections_per_host)),
            })
            .permits
            .clone()
    }

    fn take_idle(&self, target: &HostAndPort, now: Instant) -> Option<Lease> {
        let mut hosts = self.hosts.lock();
        let state = hosts.get_mut(target)?;
        while let Some(lease) = state.idle.pop() {
            if now.saturating_duration_since(lease.last_used) <= self.config.idle_timeout {
                return Some(lease);
            }
            debug!(host = %target, conn = lease.id, "closing expired idle connection");
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    async fn connect(&self, target: &HostAndPort, timeout: Duration) -> Result<TcpStream, ConnectError> {
        let addr = target.to_string();
        let timeout_ms = timeout.as_millis() as u64;
        let resolved = tokio::time::timeout(timeout, tokio::net::lookup_host((target.host(), target.port())))
            .await
            .map_err(|_| ConnectError::Timeout {
                addr: addr.clone(),
                timeout_ms,
            })?
            .map_err(|e| ConnectError::Dns {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let mut last_err = None;
        for sock_addr in resolved {
            match tokio::time::timeout(timeout, TcpStream::connect(sock_addr)).await {
                Err(_) => {
                    return Err(ConnectError::Timeout { addr, timeout_ms });
                }
                Ok(Err(e)) => {
                    debug!(host = %target, %sock_addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
                Ok(Ok(stream)) => {
                    if self.config.nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(host = %target, error = %e, "failed to set TCP_NODELAY");
                        }
                    }
                    return Ok(stream);
                }
            }
        }
        Err(match last_err {
            Some(e) => ConnectError::Refused {
                addr,
                reason: e.to_string(),
            },
            None => ConnectError::Dns {
                addr,
                reason: "no addresses resolved".to_string(),
            },
        })
    }
}

#[async_trait]
impl ConnectionPool for TcpConnectionPool {
    async fn acquire(
        &self,
        target: &HostAndPort,
        now: Instant,
        timeout: Duration,
    ) -> Result<Lease, ConnectError> {
        let waited = Instant::now();
        let timed_out = || ConnectError::Timeout {
            addr: target.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let permit = tokio::time::timeout(timeout, self.permits(target).acquire_owned())
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| ConnectError::Refused {
                addr: target.to_string(),
                reason: "pool is shut down".to_string(),
            })?;

        if let Some(mut lease) = self.take_idle(target, now) {
            lease.record_reuse();
            lease.permit = Some(permit);
            self.reused.fetch_add(1, Ordering::Relaxed);
            debug!(host = %target, conn = lease.id, uses = lease.uses, "reusing pooled connection");
            return Ok(lease);
        }

        let remaining = timeout.saturating_sub(waited.elapsed());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        let stream = self
            .connect(target, remaining.min(self.config.connect_timeout))
            .await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(host = %target, conn = id, "opened connection");
        let mut lease = Lease::new(id, target.clone(), Box::new(stream), now);
        lease.permit = Some(permit);
        Ok(lease)
    }

    fn release(&self, mut lease: Lease, now: Instant, drop_connection: bool) {
        let _permit = lease.permit.take();
        if drop_connection {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(host = %lease.target, conn = lease.id, "dropping connection");
            return;
        }
        lease.last_used = now;
        let mut hosts = self.hosts.lock();
        match hosts.get_mut(&lease.target) {
            Some(state) if state.idle.len() < self.config.max_idle_per_host => {
                state.idle.push(lease);
                self.returned.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(host = %lease.target, conn = lease.id, "idle set full, closing connection");
            }
        }
    }

    fn shutdown(&self) {
        let mut hosts = self.hosts.lock();
        for state in hosts.values_mut() {
            state.permits.close();
            self.dropped
                .fetch_add(state.idle.len() as u64, Ordering::Relaxed);
            state.idle.clear();
        }
    }
}
