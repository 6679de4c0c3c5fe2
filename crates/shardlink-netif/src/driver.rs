//! I/O driver: moves one operation through connect, handshake,
//! authentication, send and receive.
//!
//! Sequencing lives in [`OpDriver`], a pure state machine that maps the
//! outcome of each step to the next step. [`run_operation`] performs the I/O
//! those steps ask for. Every suspension point races the operation's cancel
//! token, and every step outcome passes a checkpoint that turns a pending
//! cancel, timeout or shutdown into the terminal event.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::auth::{Authenticator, CommandRunner, MetadataHook};
use crate::cancel::{CancelReason, CancelToken};
use crate::document::{Document, DocumentBuilder};
use crate::error::{AuthError, FrameError, NetworkError};
use crate::metrics::NetworkMetrics;
use crate::pool::{ConnectionPool, Lease};
use crate::registry::OperationRegistry;
use crate::request::{
    CallbackHandle, RemoteCommandRequest, RemoteCommandResponse, ResponseStatus,
};
use crate::wire::{
    validate_response_id, Frame, MessageBody, MsgHeader, Protocol, ProtocolSet, ReplyDocuments,
    WireCodec, HEADER_SIZE,
};

/// Largest single write issued while sending a frame.
pub const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Step an operation is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a connection lease.
    Connecting,
    /// Running the protocol handshake on a new connection.
    Negotiating,
    /// Running the authentication hook.
    Authenticating,
    /// Writing the command frame.
    Sending,
    /// Reading the reply header.
    ReceivingHeader,
    /// Reading the reply body.
    ReceivingBody,
    /// Terminal.
    Done,
}

/// Outcome of the step the driver last performed.
#[derive(Debug)]
pub enum Event {
    /// A lease was obtained.
    Connected {
        /// The connection already went through the handshake.
        negotiated: bool,
        /// The connection is already authenticated.
        authenticated: bool,
    },
    /// The handshake completed.
    Negotiated,
    /// Authentication completed.
    Authenticated,
    /// The command frame was written.
    Sent,
    /// A valid reply header arrived.
    HeaderReceived(MsgHeader),
    /// The reply body arrived and was decoded.
    BodyReceived(RemoteCommandResponse),
    /// The step failed.
    Failed(NetworkError),
    /// Cancel, timeout or shutdown was observed at a checkpoint.
    Interrupted(NetworkError),
}

/// Step the driver must perform next.
#[derive(Debug)]
pub enum Action {
    /// Run the handshake.
    Negotiate,
    /// Run the authentication hook.
    Authenticate,
    /// Encode and write the command.
    Send,
    /// Read the reply header.
    ReceiveHeader,
    /// Read the reply body the header announced.
    ReceiveBody(MsgHeader),
    /// Complete the operation.
    Complete(ResponseStatus),
}

/// Sequencing of one operation's protocol steps.
#[derive(Debug)]
pub struct OpDriver {
    phase: Phase,
    auth_required: bool,
}

impl OpDriver {
    /// A machine waiting for its connection.
    pub fn new(auth_required: bool) -> Self {
        Self {
            phase: Phase::Connecting,
            auth_required,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Applies `event` and returns what to do next.
    ///
    /// # Panics
    ///
    /// On an event that cannot happen in the current phase, including any
    /// event after completion.
    pub fn on_event(&mut self, event: Event) -> Action {
        let (next, action) = match (self.phase, event) {
            (Phase::Done, event) => {
                error!(?event, "event delivered to completed operation");
                panic!("driver invariant failure: {:?} after completion", event);
            }
            (_, Event::Failed(e)) | (_, Event::Interrupted(e)) => {
                (Phase::Done, Action::Complete(Err(e)))
            }
            (Phase::Connecting, Event::Connected { negotiated, authenticated }) => {
                if !negotiated {
                    (Phase::Negotiating, Action::Negotiate)
                } else if self.auth_required && !authenticated {
                    (Phase::Authenticating, Action::Authenticate)
                } else {
                    (Phase::Sending, Action::Send)
                }
            }
            (Phase::Negotiating, Event::Negotiated) => {
                if self.auth_required {
                    (Phase::Authenticating, Action::Authenticate)
                } else {
                    (Phase::Sending, Action::Send)
                }
            }
            (Phase::Authenticating, Event::Authenticated) => (Phase::Sending, Action::Send),
            (Phase::Sending, Event::Sent) => (Phase::ReceivingHeader, Action::ReceiveHeader),
            (Phase::ReceivingHeader, Event::HeaderReceived(header)) => {
                (Phase::ReceivingBody, Action::ReceiveBody(header))
            }
            (Phase::ReceivingBody, Event::BodyReceived(response)) => {
                (Phase::Done, Action::Complete(Ok(response)))
            }
            (phase, event) => {
                error!(?phase, ?event, "unexpected driver event");
                panic!("driver invariant failure: {:?} in phase {:?}", event, phase);
            }
        };
        self.phase = next;
        action
    }
}

/// Everything the driver shares across operations.
pub(crate) struct DriverContext {
    pub pool: Arc<dyn ConnectionPool>,
    pub codec: Arc<WireCodec>,
    pub registry: Arc<OperationRegistry>,
    pub metrics: Arc<NetworkMetrics>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub metadata_hook: Option<Arc<dyn MetadataHook>>,
    pub auth_enabled: bool,
    pub lease_timeout: Duration,
    pub client_protocols: ProtocolSet,
}

/// Drives the operation registered under `handle` to completion.
pub(crate) async fn run_operation(
    ctx: Arc<DriverContext>,
    handle: CallbackHandle,
    request: RemoteCommandRequest,
    token: CancelToken,
    timeout: Option<Duration>,
) {
    let started = Instant::now();
    let timer = timeout.map(|limit| {
        let registry = ctx.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(op) = registry.get(handle) {
                if op.time_out() {
                    debug!(%handle, timeout_ms = limit.as_millis() as u64, "operation timed out");
                }
            }
        })
    });

    let timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
    let mut lease = None;
    let status = drive(&ctx, &request, &token, timeout_ms, &mut lease, started).await;

    if let Some(timer) = timer {
        timer.abort();
    }

    if let Some(lease) = lease {
        let drop_connection = match &status {
            Ok(_) => false,
            Err(e) => e.should_drop_connection(),
        };
        ctx.metrics.connection_released(drop_connection);
        ctx.pool.release(lease, Instant::now(), drop_connection);
    }

    if let Err(e) = &status {
        warn!(%handle, request = %request, error = %e, "command failed");
    }

    match ctx.registry.remove(handle) {
        Some(op) => {
            op.finish(status);
        }
        None => debug!(%handle, "operation already completed by shutdown"),
    }
}

async fn drive(
    ctx: &DriverContext,
    request: &RemoteCommandRequest,
    token: &CancelToken,
    timeout_ms: u64,
    slot: &mut Option<Lease>,
    started: Instant,
) -> ResponseStatus {
    let mut machine = OpDriver::new(ctx.auth_enabled);

    let acquired = guarded(
        token,
        timeout_ms,
        ctx.pool.acquire(&request.target, Instant::now(), ctx.lease_timeout),
    )
    .await;
    let first = match acquired {
        Err(interrupted) => Event::Interrupted(interrupted),
        Ok(Err(e)) => Event::Failed(e.into()),
        Ok(Ok(lease)) => {
            ctx.metrics.connection_leased(lease.is_reused());
            debug!(
                target_host = %request.target,
                conn = lease.id(),
                reused = lease.is_reused(),
                "connection leased"
            );
            let event = Event::Connected {
                negotiated: lease.server_protocols().is_some(),
                authenticated: lease.is_authenticated(),
            };
            *slot = Some(lease);
            event
        }
    };
    let mut action = machine.on_event(checkpoint(token, timeout_ms, first));

    let Some(lease) = slot.as_mut() else {
        return match action {
            Action::Complete(status) => status,
            other => {
                error!(?other, "driver advanced without a connection");
                panic!("driver invariant failure: {:?} without a connection", other);
            }
        };
    };

    let mut exchange = Exchange {
        lease,
        codec: ctx.codec.as_ref(),
        token,
        metrics: ctx.metrics.as_ref(),
        client_protocols: ctx.client_protocols,
        timeout_ms,
    };
    let mut sent_id = 0;

    loop {
        let outcome = match action {
            Action::Complete(status) => return status,
            Action::Negotiate => exchange.negotiate().await.map(|()| Event::Negotiated),
            Action::Authenticate => authenticate(ctx, &mut exchange)
                .await
                .map(|()| Event::Authenticated),
            Action::Send => send_command(ctx, &mut exchange, request).await.map(|id| {
                sent_id = id;
                Event::Sent
            }),
            Action::ReceiveHeader => exchange
                .recv_header(sent_id)
                .await
                .map(Event::HeaderReceived),
            Action::ReceiveBody(header) => {
                receive_reply(ctx, &mut exchange, request, &header, started)
                    .await
                    .map(Event::BodyReceived)
            }
        };
        let event = outcome.unwrap_or_else(Event::Failed);
        action = machine.on_event(checkpoint(token, timeout_ms, event));
    }
}

async fn authenticate(ctx: &DriverContext, exchange: &mut Exchange<'_>) -> Result<(), NetworkError> {
    let Some(authenticator) = ctx.authenticator.clone() else {
        return Err(AuthError::MissingParameters.into());
    };
    let target = exchange.lease.target().clone();
    let token = exchange.token;
    let timeout_ms = exchange.timeout_ms;
    guarded(token, timeout_ms, authenticator.authenticate(&target, &mut *exchange)).await??;
    exchange.lease.set_authenticated();
    debug!(target_host = %target, "connection authenticated");
    Ok(())
}

async fn send_command(
    ctx: &DriverContext,
    exchange: &mut Exchange<'_>,
    request: &RemoteCommandRequest,
) -> Result<i32, NetworkError> {
    let metadata = match &ctx.metadata_hook {
        Some(hook) => hook.write_request_metadata(&request.target, &request.metadata)?,
        None => request.metadata.clone(),
    };
    let protocol = exchange.protocol()?;
    let frame = ctx
        .codec
        .encode(protocol, &request.dbname, &request.cmd, &metadata)?;
    exchange.send(&frame).await?;
    debug!(request = %request, request_id = frame.request_id(), ?protocol, "command sent");
    Ok(frame.request_id())
}

async fn receive_reply(
    ctx: &DriverContext,
    exchange: &mut Exchange<'_>,
    request: &RemoteCommandRequest,
    header: &MsgHeader,
    started: Instant,
) -> Result<RemoteCommandResponse, NetworkError> {
    let reply = exchange.recv_body(header).await?.into_reply()?;
    if let Some(hook) = &ctx.metadata_hook {
        hook.read_reply_metadata(&request.target, &reply.metadata)?;
    }
    Ok(RemoteCommandResponse {
        data: reply.data,
        metadata: reply.metadata,
        elapsed: started.elapsed(),
    })
}

/// Error an interrupted operation completes with.
fn interruption(token: &CancelToken, timeout_ms: u64) -> NetworkError {
    match token.cancelled_reason() {
        Some(CancelReason::DeadlineExceeded) => NetworkError::ExceededTimeLimit { timeout_ms },
        Some(CancelReason::Shutdown) => NetworkError::ShutdownInProgress,
        Some(CancelReason::UserRequested) | None => NetworkError::CallbackCanceled,
    }
}

fn checkpoint(token: &CancelToken, timeout_ms: u64, event: Event) -> Event {
    if token.is_cancelled() {
        Event::Interrupted(interruption(token, timeout_ms))
    } else {
        event
    }
}

/// Runs `fut` unless the token fires first.
async fn guarded<F: Future>(
    token: &CancelToken,
    timeout_ms: u64,
    fut: F,
) -> Result<F::Output, NetworkError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(interruption(token, timeout_ms)),
        out = fut => Ok(out),
    }
}

/// Frame exchange over one leased connection.
struct Exchange<'a> {
    lease: &'a mut Lease,
    codec: &'a WireCodec,
    token: &'a CancelToken,
    metrics: &'a NetworkMetrics,
    client_protocols: ProtocolSet,
    timeout_ms: u64,
}

impl Exchange<'_> {
    /// Protocol for commands on this connection. Legacy queries until the
    /// handshake has run.
    fn protocol(&self) -> Result<Protocol, NetworkError> {
        match self.lease.server_protocols() {
            Some(server) => Ok(ProtocolSet::negotiate(self.client_protocols, server)?),
            None => Ok(Protocol::OpQuery),
        }
    }

    async fn negotiate(&mut self) -> Result<(), NetworkError> {
        let hello = DocumentBuilder::new().append_i32("isMaster", 1).build();
        let frame = self
            .codec
            .encode(Protocol::OpQuery, "admin", &hello, &Document::empty())?;
        let reply = self.round_trip(&frame).await?;
        if reply.data.get_i64("ok") != Some(1) {
            return Err(NetworkError::InternalError(format!(
                "handshake rejected by {}: {}",
                self.lease.target(),
                reply.data.get_str("errmsg").unwrap_or("no error message")
            )));
        }
        let server = ProtocolSet::from_handshake_reply(&reply.data);
        self.lease.set_server_protocols(server);
        let protocol = ProtocolSet::negotiate(self.client_protocols, server)?;
        debug!(target_host = %self.lease.target(), ?server, ?protocol, "handshake complete");
        Ok(())
    }

    async fn round_trip(&mut self, frame: &Frame) -> Result<ReplyDocuments, NetworkError> {
        self.send(frame).await?;
        let header = self.recv_header(frame.request_id()).await?;
        Ok(self.recv_body(&header).await?.into_reply()?)
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), NetworkError> {
        let (token, timeout_ms) = (self.token, self.timeout_ms);
        let target = self.lease.target().clone();
        let bytes = frame.to_bytes();
        let stream = self.lease.stream_mut();
        for chunk in bytes.chunks(WRITE_CHUNK_SIZE) {
            guarded(token, timeout_ms, stream.write_all(chunk))
                .await?
                .map_err(|e| NetworkError::from_io(&target, &e))?;
        }
        guarded(token, timeout_ms, stream.flush())
            .await?
            .map_err(|e| NetworkError::from_io(&target, &e))?;
        self.metrics.add_bytes_sent(bytes.len() as u64);
        Ok(())
    }

    async fn recv_header(&mut self, expected_id: i32) -> Result<MsgHeader, NetworkError> {
        let (token, timeout_ms) = (self.token, self.timeout_ms);
        let target = self.lease.target().clone();
        let mut buf = [0u8; HEADER_SIZE];
        guarded(token, timeout_ms, self.lease.stream_mut().read_exact(&mut buf))
            .await?
            .map_err(|e| NetworkError::from_io(&target, &e))?;
        let header = self.codec.decode_header(&buf)?;
        validate_response_id(&header, expected_id)?;
        Ok(header)
    }

    async fn recv_body(&mut self, header: &MsgHeader) -> Result<MessageBody, NetworkError> {
        let (token, timeout_ms) = (self.token, self.timeout_ms);
        let target = self.lease.target().clone();
        let expected = header.body_len();
        let mut body = vec![0u8; expected];
        let mut received = 0;
        let stream = self.lease.stream_mut();
        while received < expected {
            let n = guarded(token, timeout_ms, stream.read(&mut body[received..]))
                .await?
                .map_err(|e| NetworkError::from_io(&target, &e))?;
            if n == 0 {
                return Err(FrameError::Truncated { expected, received }.into());
            }
            received += n;
        }
        self.metrics
            .add_bytes_received((HEADER_SIZE + expected) as u64);
        Ok(self.codec.decode_body(header, &body)?)
    }
}

#[async_trait]
impl<'a> CommandRunner for Exchange<'a> {
    async fn run_command(
        &mut self,
        request: RemoteCommandRequest,
    ) -> Result<RemoteCommandResponse, NetworkError> {
        let started = Instant::now();
        let protocol = self.protocol()?;
        let frame = self
            .codec
            .encode(protocol, &request.dbname, &request.cmd, &request.metadata)?;
        let reply = self.round_trip(&frame).await?;
        Ok(RemoteCommandResponse {
            data: reply.data,
            metadata: reply.metadata,
            elapsed: started.elapsed(),
        })
    }
}
