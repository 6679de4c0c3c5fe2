//! Cooperative interruption of in-flight operations.
//!
//! Canceling never tears down socket I/O directly. The handle side records a
//! reason and wakes whoever is parked on the token; the I/O driver drops the
//! pending read or write and observes the flag at its next checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Why an operation was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller canceled the command.
    UserRequested,
    /// The command's timeout fired.
    DeadlineExceeded,
    /// The interface is shutting down.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// Observer side: checked at checkpoints, awaited alongside pending I/O.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// Whether the operation has been interrupted.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// The first reason recorded, if interrupted.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.state.reason.lock()
    }

    /// Resolves once the operation is interrupted.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.cancelled_reason())
            .finish()
    }
}

/// Trigger side, held by the operation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Interrupts with `reason`. Only the first reason is kept; returns
    /// `true` if this call was the first.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = {
            let mut r = self.state.reason.lock();
            if r.is_none() {
                *r = Some(reason);
                true
            } else {
                false
            }
        };
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
        first
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Creates a linked token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState {
        cancelled: AtomicBool::new(false),
        reason: Mutex::new(None),
        notify: Notify::new(),
    });
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}
