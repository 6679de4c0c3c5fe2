//! The network interface: lifecycle, command submission and the executor's
//! work signal.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, MetadataHook};
use crate::config::NetworkInterfaceConfig;
use crate::driver::{run_operation, DriverContext};
use crate::error::{ConfigError, NetworkError};
use crate::metrics::{MetricsSnapshot, NetworkMetrics};
use crate::operation::Operation;
use crate::pool::{ConnectionPool, TcpConnectionPool};
use crate::registry::{OperationRegistry, RegistryStats};
use crate::request::{CallbackHandle, CompletionFn, RemoteCommandRequest, ResponseStatus};
use crate::wire::{ProtocolSet, WireCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Lifecycle of a [`NetworkInterface`].
pub enum InterfaceState {
    /// Constructed, reactor not started.
    Ready = 0,
    /// Reactor running, accepting commands.
    Running = 1,
    /// Shut down; new commands are rejected.
    Shutdown = 2,
}

impl From<u8> for InterfaceState {
    fn from(value: u8) -> Self {
        match value {
            0 => InterfaceState::Ready,
            1 => InterfaceState::Running,
            _ => InterfaceState::Shutdown,
        }
    }
}

impl InterfaceState {
    fn as_str(self) -> &'static str {
        match self {
            InterfaceState::Ready => "ready",
            InterfaceState::Running => "running",
            InterfaceState::Shutdown => "shutdown",
        }
    }
}

#[derive(Default)]
struct WorkFlags {
    ready: bool,
    closed: bool,
}

/// Wakes the executor thread blocked in `wait_for_work`.
#[derive(Default)]
struct WorkSignal {
    flags: Mutex<WorkFlags>,
    cond: Condvar,
}

impl WorkSignal {
    fn signal(&self) {
        self.flags.lock().ready = true;
        self.cond.notify_all();
    }

    fn close(&self) {
        self.flags.lock().closed = true;
        self.cond.notify_all();
    }

    fn is_ready(&self) -> bool {
        self.flags.lock().ready
    }

    fn wait(&self) {
        let mut flags = self.flags.lock();
        while !flags.ready && !flags.closed {
            self.cond.wait(&mut flags);
        }
        flags.ready = false;
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut flags = self.flags.lock();
        while !flags.ready && !flags.closed {
            if self.cond.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
        let woke = flags.ready || flags.closed;
        flags.ready = false;
        woke
    }
}

struct Reactor {
    runtime: Runtime,
    ctx: Arc<DriverContext>,
}

/// Asynchronous remote-command interface.
///
/// Construct one per process, [`startup`](Self::startup) it, then submit
/// commands with [`start_command`](Self::start_command). Every command's
/// callback runs exactly once, on a reactor thread or, for commands rejected
/// up front and for commands aborted by shutdown, on the calling thread.
pub struct NetworkInterface {
    config: NetworkInterfaceConfig,
    state: AtomicU8,
    reactor: Mutex<Option<Reactor>>,
    pool: Arc<dyn ConnectionPool>,
    codec: Arc<WireCodec>,
    registry: Arc<OperationRegistry>,
    metrics: Arc<NetworkMetrics>,
    work: Arc<WorkSignal>,
    authenticator: Option<Arc<dyn Authenticator>>,
    metadata_hook: Option<Arc<dyn MetadataHook>>,
}

impl NetworkInterface {
    /// Creates an interface leasing connections from `pool`.
    pub fn new(
        config: NetworkInterfaceConfig,
        pool: Arc<dyn ConnectionPool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            codec: Arc::new(WireCodec::new(config.max_message_size)),
            config,
            state: AtomicU8::new(InterfaceState::Ready as u8),
            reactor: Mutex::new(None),
            pool,
            registry: Arc::new(OperationRegistry::new()),
            metrics: Arc::new(NetworkMetrics::new()),
            work: Arc::new(WorkSignal::default()),
            authenticator: None,
            metadata_hook: None,
        })
    }

    /// Creates an interface backed by a [`TcpConnectionPool`].
    pub fn with_tcp_pool(config: NetworkInterfaceConfig) -> Result<Self, ConfigError> {
        let pool = Arc::new(TcpConnectionPool::new(config.pool_config()));
        Self::new(config, pool)
    }

    /// Installs the hook that authenticates new connections.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Installs the hook that rewrites and inspects command metadata.
    pub fn with_metadata_hook(mut self, hook: Arc<dyn MetadataHook>) -> Self {
        self.metadata_hook = Some(hook);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &NetworkInterfaceConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InterfaceState {
        InterfaceState::from(self.state.load(Ordering::SeqCst))
    }

    /// Starts the reactor.
    ///
    /// # Panics
    ///
    /// If called more than once.
    pub fn startup(&self) -> Result<(), NetworkError> {
        let mut reactor = self.reactor.lock();
        if self.state() != InterfaceState::Ready || reactor.is_some() {
            warn!(state = self.state().as_str(), "startup called twice");
            panic!("network interface startup called twice");
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.reactor_threads)
            .thread_name("netif-reactor")
            .enable_all()
            .build()
            .map_err(|e| NetworkError::InternalError(format!("failed to start reactor: {}", e)))?;
        let ctx = Arc::new(DriverContext {
            pool: self.pool.clone(),
            codec: self.codec.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            authenticator: self.authenticator.clone(),
            metadata_hook: self.metadata_hook.clone(),
            auth_enabled: self.config.auth_enabled,
            lease_timeout: self.config.lease_timeout(),
            client_protocols: ProtocolSet::ALL,
        });
        *reactor = Some(Reactor { runtime, ctx });
        self.state
            .store(InterfaceState::Running as u8, Ordering::SeqCst);
        info!(
            reactor_threads = self.config.reactor_threads,
            auth_enabled = self.config.auth_enabled,
            "network interface started"
        );
        Ok(())
    }

    /// Stops accepting commands, completes every in-flight command with
    /// [`NetworkError::ShutdownInProgress`] and stops the reactor. Later calls
    /// do nothing.
    pub fn shutdown(&self) {
        let prev = InterfaceState::from(
            self.state
                .swap(InterfaceState::Shutdown as u8, Ordering::SeqCst),
        );
        if prev == InterfaceState::Shutdown {
            return;
        }
        info!(in_progress = self.registry.len(), "network interface shutting down");

        for op in self.registry.drain() {
            op.interrupt_for_shutdown();
            op.finish(Err(NetworkError::ShutdownInProgress));
        }
        self.pool.shutdown();

        let reactor = self.reactor.lock().take();
        if let Some(reactor) = reactor {
            drop(reactor.ctx);
            if tokio::runtime::Handle::try_current().is_ok() {
                reactor.runtime.shutdown_background();
            } else {
                reactor.runtime.shutdown_timeout(self.config.shutdown_timeout());
            }
        }
        self.work.close();
        info!("network interface shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn in_shutdown(&self) -> bool {
        self.state() == InterfaceState::Shutdown
    }

    /// Runs `request` on its target and calls `on_finish` with the outcome.
    ///
    /// Never blocks. After shutdown the callback runs immediately with
    /// [`NetworkError::ShutdownInProgress`]; a handle that already has a
    /// command in flight gets [`NetworkError::DuplicateHandle`].
    ///
    /// # Panics
    ///
    /// If called before [`startup`](Self::startup).
    pub fn start_command(
        &self,
        handle: CallbackHandle,
        request: RemoteCommandRequest,
        on_finish: impl FnOnce(ResponseStatus) + Send + 'static,
    ) {
        let metrics = self.metrics.clone();
        let work = self.work.clone();
        let on_finish: CompletionFn = Box::new(move |status: ResponseStatus| {
            metrics.record_completion(&status);
            on_finish(status);
            work.signal();
        });

        match self.state() {
            InterfaceState::Ready => {
                warn!(%handle, "command submitted before startup");
                panic!("network interface used before startup");
            }
            InterfaceState::Shutdown => {
                debug!(%handle, request = %request, "rejecting command during shutdown");
                on_finish(Err(NetworkError::ShutdownInProgress));
                return;
            }
            InterfaceState::Running => {}
        }

        let now = Instant::now();
        let timeout = request
            .timeout
            .or_else(|| self.config.default_command_timeout());
        let op = Arc::new(Operation::new(handle, request.clone(), timeout, on_finish, now));
        op.start_progress(now);

        if let Err(op) = self.registry.insert(op.clone()) {
            warn!(%handle, "callback handle already in use");
            op.finish(Err(NetworkError::DuplicateHandle(handle.id())));
            return;
        }
        self.metrics.inc_commands_started();

        let reactor = self
            .reactor
            .lock()
            .as_ref()
            .map(|r| (r.runtime.handle().clone(), r.ctx.clone()));
        let Some((runtime, ctx)) = reactor.filter(|_| !self.in_shutdown()) else {
            // Shutdown raced with registration.
            if let Some(op) = self.registry.remove(handle) {
                op.finish(Err(NetworkError::ShutdownInProgress));
            }
            return;
        };

        debug!(%handle, request = %request, ?timeout, "starting command");
        runtime.spawn(run_operation(ctx, handle, request, op.token(), timeout));
    }

    /// Cancels the command registered under `handle`. Unknown or already
    /// completed handles are ignored.
    pub fn cancel_command(&self, handle: CallbackHandle) {
        if self.registry.cancel(handle) {
            debug!(%handle, "command canceled");
        } else {
            debug!(%handle, "cancel of unknown or finished command ignored");
        }
    }

    /// Blocks until a command completes or work is signaled.
    pub fn wait_for_work(&self) {
        self.work.wait();
    }

    /// Like [`wait_for_work`](Self::wait_for_work), giving up at `deadline`.
    /// Returns whether work was signaled.
    pub fn wait_for_work_until(&self, deadline: Instant) -> bool {
        self.work.wait_until(deadline)
    }

    /// Wakes a thread blocked in `wait_for_work`.
    pub fn signal_work_available(&self) {
        self.work.signal();
    }

    /// Current time on the interface's clock.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Commands currently in flight.
    pub fn in_progress(&self) -> usize {
        self.registry.len()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Registry counters.
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Human-readable summary followed by one line per in-flight command.
    pub fn diagnostic_string(&self) -> String {
        let mut out = format!(
            "NetworkInterface ({}): {} in progress, executor {}",
            self.state().as_str(),
            self.registry.len(),
            if self.work.is_ready() { "runnable" } else { "waiting" }
        );
        for line in self.registry.describe_all(self.now()) {
            out.push_str("\n\t");
            out.push_str(&line);
        }
        out
    }
}

impl Drop for NetworkInterface {
    fn drop(&mut self) {
        if self.state() == InterfaceState::Running {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for NetworkInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkInterface")
            .field("state", &self.state())
            .field("in_progress", &self.registry.len())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentBuilder;
    use crate::request::HostAndPort;
    use std::sync::mpsc;
    use std::time::Duration;

    fn interface() -> NetworkInterface {
        NetworkInterface::with_tcp_pool(NetworkInterfaceConfig::default()).unwrap()
    }

    fn ping() -> RemoteCommandRequest {
        RemoteCommandRequest::new(
            HostAndPort::new("127.0.0.1", 1),
            "admin",
            DocumentBuilder::new().append_i32("ping", 1).build(),
        )
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(InterfaceState::from(0), InterfaceState::Ready);
        assert_eq!(InterfaceState::from(1), InterfaceState::Running);
        assert_eq!(InterfaceState::from(2), InterfaceState::Shutdown);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NetworkInterfaceConfig {
            reactor_threads: 0,
            ..NetworkInterfaceConfig::default()
        };
        assert!(NetworkInterface::with_tcp_pool(config).is_err());
    }

    #[test]
    fn test_startup_and_shutdown() {
        let net = interface();
        assert_eq!(net.state(), InterfaceState::Ready);
        net.startup().unwrap();
        assert_eq!(net.state(), InterfaceState::Running);
        assert!(!net.in_shutdown());
        net.shutdown();
        assert!(net.in_shutdown());
        net.shutdown();
    }

    #[test]
    #[should_panic(expected = "startup called twice")]
    fn test_double_startup_panics() {
        let net = interface();
        net.startup().unwrap();
        net.startup().unwrap();
    }

    #[test]
    #[should_panic(expected = "before startup")]
    fn test_command_before_startup_panics() {
        let net = interface();
        net.start_command(CallbackHandle::new(1), ping(), |_| {});
    }

    #[test]
    fn test_command_after_shutdown_rejected() {
        let net = interface();
        net.startup().unwrap();
        net.shutdown();
        let (tx, rx) = mpsc::channel();
        net.start_command(CallbackHandle::new(1), ping(), move |status| {
            tx.send(status).unwrap();
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(NetworkError::ShutdownInProgress)
        );
        assert_eq!(net.metrics().commands_shutdown, 1);
    }

    #[test]
    fn test_cancel_unknown_handle_is_noop() {
        let net = interface();
        net.startup().unwrap();
        net.cancel_command(CallbackHandle::new(99));
        assert_eq!(net.in_progress(), 0);
    }

    #[test]
    fn test_wait_for_work_until_times_out() {
        let net = interface();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!net.wait_for_work_until(deadline));
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let net = Arc::new(interface());
        let waiter = {
            let net = net.clone();
            std::thread::spawn(move || net.wait_for_work_until(Instant::now() + Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        net.signal_work_available();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_signal_is_consumed() {
        let net = interface();
        net.signal_work_available();
        net.wait_for_work();
        assert!(!net.wait_for_work_until(Instant::now() + Duration::from_millis(10)));
    }

    #[test]
    fn test_diagnostic_string() {
        let net = interface();
        net.startup().unwrap();
        let diag = net.diagnostic_string();
        assert!(diag.starts_with("NetworkInterface (running): 0 in progress"));
    }
}
