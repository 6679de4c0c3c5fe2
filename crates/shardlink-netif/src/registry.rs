//! Table of in-flight operations keyed by callback handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::operation::Operation;
use crate::request::CallbackHandle;

/// Counters about registry traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    /// Operations ever inserted.
    pub total_registered: u64,
    /// Cancel requests that hit an in-progress operation.
    pub total_canceled: u64,
    /// Operations removed for completion.
    pub total_completed: u64,
    /// Operations currently registered.
    pub active_count: usize,
}

/// Owns every outstanding [`Operation`].
///
/// An operation is present from `start_command` until whoever completes it
/// removes it. Removal is the claim: at most one caller gets the `Arc` back.
pub struct OperationRegistry {
    ops: Mutex<HashMap<CallbackHandle, Arc<Operation>>>,
    total_registered: AtomicU64,
    total_canceled: AtomicU64,
    total_completed: AtomicU64,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(HashMap::new()),
            total_registered: AtomicU64::new(0),
            total_canceled: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
        }
    }

    /// Registers `op`. Hands it back if its handle is already in use.
    pub fn insert(&self, op: Arc<Operation>) -> Result<(), Arc<Operation>> {
        let mut ops = self.ops.lock();
        if ops.contains_key(&op.handle()) {
            return Err(op);
        }
        ops.insert(op.handle(), op);
        drop(ops);
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Looks up an operation without claiming it.
    pub fn get(&self, handle: CallbackHandle) -> Option<Arc<Operation>> {
        self.ops.lock().get(&handle).cloned()
    }

    /// Cancels the operation registered under `handle`. Unknown handles and
    /// operations that are no longer in progress are ignored.
    pub fn cancel(&self, handle: CallbackHandle) -> bool {
        let Some(op) = self.get(handle) else {
            return false;
        };
        let canceled = op.cancel();
        if canceled {
            self.total_canceled.fetch_add(1, Ordering::Relaxed);
        }
        canceled
    }

    /// Claims the operation for completion.
    pub fn remove(&self, handle: CallbackHandle) -> Option<Arc<Operation>> {
        let op = self.ops.lock().remove(&handle);
        if op.is_some() {
            self.total_completed.fetch_add(1, Ordering::Relaxed);
        }
        op
    }

    /// Claims every registered operation.
    pub fn drain(&self) -> Vec<Arc<Operation>> {
        let drained: Vec<_> = self.ops.lock().drain().map(|(_, op)| op).collect();
        self.total_completed
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Whether no operation is registered.
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_canceled: self.total_canceled.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            active_count: self.len(),
        }
    }

    /// One line per registered operation, ordered by handle.
    pub fn describe_all(&self, now: Instant) -> Vec<String> {
        let mut ops: Vec<_> = self.ops.lock().values().cloned().collect();
        ops.sort_by_key(|op| op.handle());
        ops.iter().map(|op| op.describe(now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentBuilder;
    use crate::request::{HostAndPort, RemoteCommandRequest};
    use crate::state::OpState;

    fn op(id: u64) -> Arc<Operation> {
        let req = RemoteCommandRequest::new(
            HostAndPort::new("localhost", 27017),
            "admin",
            DocumentBuilder::new().append_i32("ping", 1).build(),
        );
        let op = Operation::new(CallbackHandle::new(id), req, None, Box::new(|_| {}), Instant::now());
        op.start_progress(Instant::now());
        Arc::new(op)
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = OperationRegistry::new();
        registry.insert(op(1)).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(CallbackHandle::new(1)).is_some());
        assert!(registry.remove(CallbackHandle::new(1)).is_some());
        assert!(registry.remove(CallbackHandle::new(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let registry = OperationRegistry::new();
        registry.insert(op(7)).unwrap();
        let rejected = registry.insert(op(7)).unwrap_err();
        assert_eq!(rejected.handle(), CallbackHandle::new(7));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let registry = OperationRegistry::new();
        assert!(!registry.cancel(CallbackHandle::new(42)));
        assert_eq!(registry.stats().total_canceled, 0);
    }

    #[test]
    fn test_cancel_registered() {
        let registry = OperationRegistry::new();
        registry.insert(op(3)).unwrap();
        assert!(registry.cancel(CallbackHandle::new(3)));
        assert!(!registry.cancel(CallbackHandle::new(3)));
        let op = registry.get(CallbackHandle::new(3)).unwrap();
        assert_eq!(op.state(), OpState::Canceled);
        assert_eq!(registry.stats().total_canceled, 1);
    }

    #[test]
    fn test_drain_and_stats() {
        let registry = OperationRegistry::new();
        for id in 1..=3 {
            registry.insert(op(id)).unwrap();
        }
        let lines = registry.describe_all(Instant::now());
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("#1"));
        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        let stats = registry.stats();
        assert_eq!(stats.total_registered, 3);
        assert_eq!(stats.total_completed, 3);
        assert_eq!(stats.active_count, 0);
    }
}
