//! Active compiled-policy snapshot.
//!
//! The store holds exactly one [`CompiledQueryPair`] behind an `ArcSwap`:
//! readers take a lock-free snapshot, the refresh scheduler swaps in a whole
//! new pair. A pair is never mutated in place, so a reader sees either the
//! pair before a publish or the pair after it.
//!
//! The store also owns the one-shot readiness signal. It fires on the first
//! publish and never resets.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::access::AccessKind;
use crate::engine::CompiledQuery;

// =============================================================================
// Compiled Query Pair
// =============================================================================

/// Read and write queries produced by one refresh cycle.
pub struct CompiledQueryPair {
    /// Query answering readable fields.
    pub read: Arc<dyn CompiledQuery>,

    /// Query answering writable fields.
    pub write: Arc<dyn CompiledQuery>,

    /// Publish counter, starting at 1.
    pub version: u64,

    /// When the pair was compiled.
    pub compiled_at: OffsetDateTime,
}

impl CompiledQueryPair {
    /// Pair two queries compiled in the same cycle.
    #[must_use]
    pub fn new(read: Arc<dyn CompiledQuery>, write: Arc<dyn CompiledQuery>, version: u64) -> Self {
        Self {
            read,
            write,
            version,
            compiled_at: OffsetDateTime::now_utc(),
        }
    }

    /// The query answering `kind`.
    #[must_use]
    pub fn query(&self, kind: AccessKind) -> &Arc<dyn CompiledQuery> {
        match kind {
            AccessKind::Read => &self.read,
            AccessKind::Write => &self.write,
        }
    }
}

impl fmt::Debug for CompiledQueryPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQueryPair")
            .field("version", &self.version)
            .field("compiled_at", &self.compiled_at)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Snapshot Store
// =============================================================================

/// Holder of the active query pair and the readiness signal.
pub struct SnapshotStore {
    current: ArcSwapOption<CompiledQueryPair>,
    ready_tx: watch::Sender<bool>,
}

impl SnapshotStore {
    /// Create an empty, unready store.
    #[must_use]
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            current: ArcSwapOption::empty(),
            ready_tx,
        }
    }

    /// Replace the active pair and fire readiness if this is the first publish.
    pub fn publish(&self, pair: CompiledQueryPair) {
        let version = pair.version;
        self.current.store(Some(Arc::new(pair)));

        let first = self.ready_tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });

        if first {
            tracing::info!(version, "Policy snapshot ready");
        }
    }

    /// The active pair, if any publish has happened.
    #[must_use]
    pub fn current(&self) -> Option<Arc<CompiledQueryPair>> {
        self.current.load_full()
    }

    /// Whether the first publish has happened.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Version of the active pair, `0` before the first publish.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.load_full().map_or(0, |pair| pair.version)
    }

    /// Wait until the first publish has happened.
    ///
    /// Returns immediately once the store is ready.
    pub async fn await_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("ready", &self.is_ready())
            .field("version", &self.version())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessInput;
    use crate::engine::ResultSet;
    use crate::error::EngineError;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    struct FixedQuery(&'static str);

    impl CompiledQuery for FixedQuery {
        fn evaluate(&self, _input: &AccessInput) -> Result<Vec<ResultSet>, EngineError> {
            Ok(vec![ResultSet::single(json!([self.0]))])
        }
    }

    fn pair(version: u64) -> CompiledQueryPair {
        CompiledQueryPair::new(
            Arc::new(FixedQuery("read")),
            Arc::new(FixedQuery("write")),
            version,
        )
    }

    #[test]
    fn test_initially_empty() {
        let store = SnapshotStore::new();
        assert!(!store.is_ready());
        assert!(store.current().is_none());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_publish_replaces_pair() {
        let store = SnapshotStore::new();
        store.publish(pair(1));
        assert_eq!(store.version(), 1);

        let held = store.current().unwrap();
        store.publish(pair(2));

        // A snapshot taken earlier keeps the old pair alive and unchanged.
        assert_eq!(held.version, 1);
        assert_eq!(store.current().unwrap().version, 2);
        assert!(store.is_ready());
    }

    #[test]
    fn test_query_selection() {
        let pair = pair(1);
        let input = AccessInput::new("u", "r");
        assert_eq!(
            pair.query(AccessKind::Read).evaluate(&input).unwrap(),
            vec![ResultSet::single(json!(["read"]))]
        );
        assert_eq!(
            pair.query(AccessKind::Write).evaluate(&input).unwrap(),
            vec![ResultSet::single(json!(["write"]))]
        );
    }

    #[test]
    fn test_await_ready_wakes_on_first_publish() {
        let store = SnapshotStore::new();
        let mut waiter = task::spawn(store.await_ready());
        assert_pending!(waiter.poll());

        store.publish(pair(1));
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_await_ready_is_idempotent() {
        let store = SnapshotStore::new();
        store.publish(pair(1));
        store.publish(pair(2));

        for _ in 0..3 {
            tokio::time::timeout(std::time::Duration::from_millis(100), store.await_ready())
                .await
                .expect("ready store must not block");
        }
        assert!(store.is_ready());
    }

    #[tokio::test]
    async fn test_many_waiters_released() {
        let store = Arc::new(SnapshotStore::new());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.await_ready().await })
            })
            .collect();

        tokio::task::yield_now().await;
        store.publish(pair(1));

        for waiter in waiters {
            tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
                .await
                .expect("waiter released")
                .unwrap();
        }
    }
}
