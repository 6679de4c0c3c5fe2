//! One in-flight remote command: its request, callback and lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::error::NetworkError;
use crate::request::{CallbackHandle, CompletionFn, RemoteCommandRequest, ResponseStatus};
use crate::state::{OpState, StateHistory};

/// An outstanding command.
///
/// All lifecycle changes go through the state history lock, so `cancel`,
/// `time_out` and `finish` racing from different threads serialize into a
/// valid transition sequence. The completion callback runs at most once.
pub struct Operation {
    handle: CallbackHandle,
    request: RemoteCommandRequest,
    timeout: Option<Duration>,
    on_finish: Mutex<Option<CompletionFn>>,
    created: Instant,
    start: Mutex<Option<Instant>>,
    history: Mutex<StateHistory>,
    completed: AtomicBool,
    cancel: CancelHandle,
    token: CancelToken,
}

impl Operation {
    /// Creates an operation in the `Uninitialized` state.
    pub fn new(
        handle: CallbackHandle,
        request: RemoteCommandRequest,
        timeout: Option<Duration>,
        on_finish: CompletionFn,
        now: Instant,
    ) -> Self {
        let (token, cancel) = new_cancel_pair();
        Self {
            handle,
            request,
            timeout,
            on_finish: Mutex::new(Some(on_finish)),
            created: now,
            start: Mutex::new(None),
            history: Mutex::new(StateHistory::new()),
            completed: AtomicBool::new(false),
            cancel,
            token,
        }
    }

    /// Caller-assigned handle.
    pub fn handle(&self) -> CallbackHandle {
        self.handle
    }

    /// The request being run.
    pub fn request(&self) -> &RemoteCommandRequest {
        &self.request
    }

    /// Effective timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Token the I/O driver checks at its checkpoints.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OpState {
        self.history.lock().current()
    }

    /// Snapshot of every state entered so far.
    pub fn history(&self) -> StateHistory {
        self.history.lock().clone()
    }

    /// When the operation entered `InProgress`.
    pub fn start(&self) -> Option<Instant> {
        *self.start.lock()
    }

    /// Whether the callback has been dispatched (or is being dispatched).
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Moves to `InProgress` and records the start time.
    pub fn start_progress(&self, now: Instant) {
        self.transition(OpState::InProgress);
        *self.start.lock() = Some(now);
    }

    /// Marks the operation canceled and interrupts its pending I/O.
    ///
    /// Completion is left to the I/O driver. Returns `false` when the
    /// operation is no longer in progress (already timed out, canceled or
    /// finished).
    pub fn cancel(&self) -> bool {
        self.interrupt(OpState::Canceled, CancelReason::UserRequested)
    }

    /// Marks the operation timed out and interrupts its pending I/O, with the
    /// same rules as [`Operation::cancel`].
    pub fn time_out(&self) -> bool {
        self.interrupt(OpState::TimedOut, CancelReason::DeadlineExceeded)
    }

    /// Wakes the I/O driver because the interface is shutting down. The
    /// lifecycle state is left alone; shutdown finishes the operation itself.
    pub fn interrupt_for_shutdown(&self) {
        self.cancel.cancel(CancelReason::Shutdown);
    }

    fn interrupt(&self, state: OpState, reason: CancelReason) -> bool {
        {
            let mut history = self.history.lock();
            if history.current() != OpState::InProgress {
                debug!(
                    handle = %self.handle,
                    state = %history.current(),
                    requested = %state,
                    "ignoring interrupt of operation no longer in progress"
                );
                return false;
            }
            if let Err(e) = history.record(state) {
                drop(history);
                self.invariant_failure(&e.to_string());
            }
        }
        self.cancel.cancel(reason);
        true
    }

    /// Moves to `Finished` and invokes the completion callback.
    ///
    /// Only the first caller wins; later calls return `false` without side
    /// effects. If the operation was canceled or timed out, the delivered
    /// status is `CallbackCanceled` or `ExceededTimeLimit` regardless of
    /// `status`, unless `status` reports shutdown.
    pub fn finish(&self, status: ResponseStatus) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(handle = %self.handle, "duplicate completion ignored");
            return false;
        }

        let status = {
            let mut history = self.history.lock();
            let status = match status {
                Err(NetworkError::ShutdownInProgress) => Err(NetworkError::ShutdownInProgress),
                _ if history.contains(OpState::Canceled) => Err(NetworkError::CallbackCanceled),
                _ if history.contains(OpState::TimedOut) => Err(NetworkError::ExceededTimeLimit {
                    timeout_ms: self.timeout_ms(),
                }),
                other => other,
            };
            if let Err(e) = history.record(OpState::Finished) {
                drop(history);
                self.invariant_failure(&e.to_string());
            }
            status
        };

        let callback = self.on_finish.lock().take();
        match callback {
            Some(on_finish) => on_finish(status),
            None => self.invariant_failure("completion callback already taken"),
        }
        true
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0)
    }

    /// One-line summary for diagnostics.
    pub fn describe(&self, now: Instant) -> String {
        let started = self.start().unwrap_or(self.created);
        format!(
            "{}\t{:?}\t{}\t{}\t[{}]",
            self.state(),
            now.saturating_duration_since(started),
            self.handle,
            self.request,
            self.history()
        )
    }

    fn invariant_failure(&self, msg: &str) -> ! {
        error!(handle = %self.handle, request = %self.request, "operation invariant failure: {}", msg);
        panic!(
            "operation invariant failure: {}\n\toperation: {}",
            msg,
            self.describe(Instant::now())
        );
    }

    fn transition(&self, next: OpState) {
        let result = self.history.lock().record(next);
        if let Err(e) = result {
            self.invariant_failure(&e.to_string());
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("handle", &self.handle)
            .field("request", &self.request.to_string())
            .field("history", &self.history().to_string())
            .field("completed", &self.is_completed())
            .finish()
    }
}
