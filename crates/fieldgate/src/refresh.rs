//! Background policy refresh.
//!
//! The [`RefreshScheduler`] keeps the [`SnapshotStore`] in step with the
//! external policy sources. Each cycle:
//!
//! 1. Fetches data and module text concurrently; the first failure abandons
//!    the other fetch.
//! 2. Compiles the read and write queries on the blocking pool.
//! 3. Publishes the pair, firing readiness on the first success.
//!
//! A failed cycle leaves the published snapshot untouched and is retried on
//! the next tick. There is no backoff and no retry in between.
//!
//! # Lifecycle
//!
//! ```text
//!   spawn ──► tick (immediate) ──► cycle ──► wait for tick / manual trigger ─┐
//!               ▲                                                              │
//!               └──────────────────────────────────────────────────────────────┘
//!   cancel token fired ──► in-flight fetch/compile wait dropped ──► task exits
//! ```
//!
//! A compile already running on the blocking pool cannot be interrupted. It
//! runs to completion in the background, but the token is checked before
//! each compile so a cancelled cycle starts no further work.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::{PolicyEngine, QueryName};
use crate::error::FieldgateError;
use crate::providers::{DataProvider, ModuleProvider};
use crate::snapshot::{CompiledQueryPair, SnapshotStore};

/// Reply channel for a manually requested cycle; receives `true` on publish.
pub type RefreshReply = oneshot::Sender<bool>;

// =============================================================================
// Refresh Statistics
// =============================================================================

/// Statistics about the refresh scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshStats {
    /// Total number of cycles started.
    pub cycles: u64,
    /// Number of cycles that published a snapshot.
    pub successful: u64,
    /// Number of cycles that failed while fetching sources.
    pub source_failures: u64,
    /// Number of cycles that failed while compiling.
    pub compile_failures: u64,
    /// Version of the last published snapshot, `0` if none.
    pub version: u64,
    /// Time of the last successful cycle.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    /// Error message of the last failed cycle.
    pub last_error: Option<String>,
}

impl RefreshStats {
    /// Number of failed cycles of any kind.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.source_failures + self.compile_failures
    }
}

/// Shared handle to the scheduler's statistics.
pub type SharedRefreshStats = Arc<Mutex<RefreshStats>>;

// =============================================================================
// Refresh Scheduler
// =============================================================================

/// Periodically compiles and publishes the policy for one site.
pub struct RefreshScheduler {
    site: String,
    data: Arc<dyn DataProvider>,
    module: Arc<dyn ModuleProvider>,
    engine: Arc<dyn PolicyEngine>,
    store: Arc<SnapshotStore>,
    interval: Duration,
    stats: SharedRefreshStats,
    cancel: CancellationToken,
}

impl RefreshScheduler {
    /// Create a scheduler publishing into `store`.
    ///
    /// # Panics
    ///
    /// [`spawn`](Self::spawn) panics if `interval` is zero.
    #[must_use]
    pub fn new(
        site: impl Into<String>,
        data: Arc<dyn DataProvider>,
        module: Arc<dyn ModuleProvider>,
        engine: Arc<dyn PolicyEngine>,
        store: Arc<SnapshotStore>,
        interval: Duration,
    ) -> Self {
        Self {
            site: site.into(),
            data,
            module,
            engine,
            store,
            interval,
            stats: Arc::new(Mutex::new(RefreshStats::default())),
            cancel: CancellationToken::new(),
        }
    }

    /// Handle to the statistics updated by this scheduler.
    #[must_use]
    pub fn stats_handle(&self) -> SharedRefreshStats {
        self.stats.clone()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> RefreshStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch sources and compile a new query pair without publishing it.
    ///
    /// # Errors
    ///
    /// Returns `FieldgateError::Source` if either provider fails,
    /// `FieldgateError::Compile` if either query fails to compile and
    /// `FieldgateError::Cancelled` if the scheduler was stopped between the
    /// two compiles.
    pub async fn poll_once(&self) -> Result<CompiledQueryPair, FieldgateError> {
        let (data, module) = tokio::try_join!(
            self.data.fetch_data(&self.site),
            self.module.fetch_module(&self.site),
        )?;

        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        let (read, write) = tokio::task::spawn_blocking(move || {
            let compile = |query| {
                if cancel.is_cancelled() {
                    return Err(FieldgateError::Cancelled);
                }
                Ok(engine.compile(&data, &module, query)?)
            };
            Ok::<_, FieldgateError>((
                compile(QueryName::ReadAccess)?,
                compile(QueryName::WriteAccess)?,
            ))
        })
        .await
        .map_err(|e| FieldgateError::Internal(format!("compile task failed: {e}")))??;

        Ok(CompiledQueryPair::new(read, write, self.store.version() + 1))
    }

    /// Run one full cycle: poll, publish on success, record the outcome.
    ///
    /// Returns the published version.
    ///
    /// # Errors
    ///
    /// Returns the cycle's error after logging it; the published snapshot is
    /// left untouched.
    pub async fn refresh(&self) -> Result<u64, FieldgateError> {
        tracing::debug!(site = %self.site, "Starting policy refresh");
        self.update_stats(|stats| stats.cycles += 1);

        match self.poll_once().await {
            Ok(pair) => {
                let version = pair.version;
                self.store.publish(pair);
                self.update_stats(|stats| {
                    stats.successful += 1;
                    stats.version = version;
                    stats.last_success = Some(OffsetDateTime::now_utc());
                });
                tracing::info!(site = %self.site, version, "Policy snapshot published");
                Ok(version)
            }
            Err(e) if e.is_cancelled() => {
                tracing::debug!(site = %self.site, "Policy refresh cancelled");
                Err(e)
            }
            Err(e) => {
                self.update_stats(|stats| {
                    if e.is_source() {
                        stats.source_failures += 1;
                    } else {
                        stats.compile_failures += 1;
                    }
                    stats.last_error = Some(e.to_string());
                });
                tracing::warn!(
                    site = %self.site,
                    version = self.store.version(),
                    error = %e,
                    "Policy refresh failed, keeping current snapshot"
                );
                Err(e)
            }
        }
    }

    /// Start the refresh loop on the current tokio runtime.
    ///
    /// The loop runs a cycle immediately, then once per interval and on every
    /// request received on `trigger`, until `cancel` fires.
    pub fn spawn(
        mut self,
        cancel: CancellationToken,
        trigger: mpsc::Receiver<RefreshReply>,
    ) -> JoinHandle<()> {
        self.cancel = cancel.clone();
        tokio::spawn(self.run(cancel, trigger))
    }

    async fn run(self, cancel: CancellationToken, mut trigger: mpsc::Receiver<RefreshReply>) {
        tracing::info!(
            site = %self.site,
            interval_ms = self.interval.as_millis() as u64,
            "Policy refresh scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(reply) = trigger.recv() => Some(reply),
                _ = ticker.tick() => None,
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(site = %self.site, "Policy refresh aborted by shutdown");
                    break;
                }
                outcome = self.refresh() => outcome,
            };

            if let Some(reply) = reply {
                let _ = reply.send(outcome.is_ok());
            }
        }

        tracing::info!(site = %self.site, "Policy refresh scheduler stopped");
    }

    fn update_stats(&self, f: impl FnOnce(&mut RefreshStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataMap;
    use crate::access::AccessInput;
    use crate::engine::{CompiledQuery, ResultSet};
    use crate::error::{EngineError, ProviderError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // -------------------------------------------------------------------------
    // Mocks
    // -------------------------------------------------------------------------

    /// Module provider returning "v<call number>", optionally failing.
    struct CountingModule {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl CountingModule {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ModuleProvider for CountingModule {
        async fn fetch_module(&self, _site: &str) -> Result<String, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::unavailable("module source down"));
            }
            Ok(format!("v{n}"))
        }
    }

    struct FailingData;

    #[async_trait]
    impl DataProvider for FailingData {
        async fn fetch_data(&self, _site: &str) -> Result<DataMap, ProviderError> {
            Err(ProviderError::unavailable("data source down"))
        }
    }

    struct HangingData;

    #[async_trait]
    impl DataProvider for HangingData {
        async fn fetch_data(&self, _site: &str) -> Result<DataMap, ProviderError> {
            std::future::pending().await
        }
    }

    /// Query that reports the module text and query name it was compiled from.
    struct EchoQuery {
        module: String,
        query: QueryName,
    }

    impl CompiledQuery for EchoQuery {
        fn evaluate(&self, _input: &AccessInput) -> Result<Vec<ResultSet>, EngineError> {
            Ok(vec![ResultSet::single(json!([
                self.module.clone(),
                self.query.as_str()
            ]))])
        }
    }

    /// Engine echoing the module; fails to compile modules containing "bad".
    struct EchoEngine {
        compiles: AtomicUsize,
    }

    impl EchoEngine {
        fn new() -> Self {
            Self {
                compiles: AtomicUsize::new(0),
            }
        }
    }

    impl PolicyEngine for EchoEngine {
        fn compile(
            &self,
            _data: &DataMap,
            module: &str,
            query: QueryName,
        ) -> Result<Arc<dyn CompiledQuery>, EngineError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            if module.contains("bad") {
                return Err(EngineError::compile(query.as_str(), "bad module"));
            }
            Ok(Arc::new(EchoQuery {
                module: module.to_string(),
                query,
            }))
        }
    }

    /// Engine whose compiles take a while and cannot be interrupted.
    struct SlowEngine {
        compiles: AtomicUsize,
        delay: Duration,
    }

    impl PolicyEngine for SlowEngine {
        fn compile(
            &self,
            _data: &DataMap,
            _module: &str,
            query: QueryName,
        ) -> Result<Arc<dyn CompiledQuery>, EngineError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(Arc::new(EchoQuery {
                module: "slow".to_string(),
                query,
            }))
        }
    }

    fn scheduler(
        data: Arc<dyn DataProvider>,
        module: Arc<dyn ModuleProvider>,
        engine: Arc<dyn PolicyEngine>,
        interval: Duration,
    ) -> (RefreshScheduler, Arc<SnapshotStore>) {
        let store = Arc::new(SnapshotStore::new());
        let scheduler = RefreshScheduler::new(
            "example.com",
            data,
            module,
            engine,
            store.clone(),
            interval,
        );
        (scheduler, store)
    }

    fn module_of(store: &SnapshotStore) -> (String, String) {
        let pair = store.current().unwrap();
        let read = pair.read.evaluate(&AccessInput::new("u", "r")).unwrap();
        let write = pair.write.evaluate(&AccessInput::new("u", "r")).unwrap();
        (
            read[0].expressions[0][0].as_str().unwrap().to_string(),
            write[0].expressions[0][0].as_str().unwrap().to_string(),
        )
    }

    // -------------------------------------------------------------------------
    // Tests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_refresh_publishes_pair() {
        let engine = Arc::new(EchoEngine::new());
        let (scheduler, store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            Arc::new(CountingModule::new()),
            engine.clone(),
            Duration::from_secs(60),
        );

        assert_eq!(scheduler.refresh().await.unwrap(), 1);
        assert!(store.is_ready());
        assert_eq!(module_of(&store), ("v1".to_string(), "v1".to_string()));
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 2);

        assert_eq!(scheduler.refresh().await.unwrap(), 2);
        assert_eq!(module_of(&store), ("v2".to_string(), "v2".to_string()));

        let stats = scheduler.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.version, 2);
        assert!(stats.last_success.is_some());
    }

    #[tokio::test]
    async fn test_pair_queries_match_names() {
        let (scheduler, _store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            Arc::new(CountingModule::new()),
            Arc::new(EchoEngine::new()),
            Duration::from_secs(60),
        );

        let pair = scheduler.poll_once().await.unwrap();
        let read = pair.read.evaluate(&AccessInput::new("u", "r")).unwrap();
        let write = pair.write.evaluate(&AccessInput::new("u", "r")).unwrap();
        assert_eq!(read[0].expressions[0][1], json!("read_access"));
        assert_eq!(write[0].expressions[0][1], json!("write_access"));
    }

    #[tokio::test]
    async fn test_source_failure_keeps_snapshot() {
        let module = Arc::new(CountingModule::new());
        let (scheduler, store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            module.clone(),
            Arc::new(EchoEngine::new()),
            Duration::from_secs(60),
        );

        scheduler.refresh().await.unwrap();
        module.failing.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            let err = scheduler.refresh().await.unwrap_err();
            assert!(err.is_source());
        }

        assert_eq!(store.version(), 1);
        assert_eq!(module_of(&store), ("v1".to_string(), "v1".to_string()));

        let stats = scheduler.stats();
        assert_eq!(stats.source_failures, 3);
        assert_eq!(stats.compile_failures, 0);
        assert_eq!(stats.failed(), 3);
        assert!(stats.last_error.unwrap().contains("module source down"));
    }

    #[tokio::test]
    async fn test_compile_failure_keeps_snapshot() {
        let module_text = Arc::new(Mutex::new("good".to_string()));
        let text = module_text.clone();
        let module = crate::providers::FnModuleProvider::new(move |_site: String| {
            let text = text.lock().unwrap().clone();
            async move { Ok::<_, ProviderError>(text) }
        });

        let (scheduler, store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            Arc::new(module),
            Arc::new(EchoEngine::new()),
            Duration::from_secs(60),
        );

        scheduler.refresh().await.unwrap();
        *module_text.lock().unwrap() = "bad".to_string();

        let err = scheduler.refresh().await.unwrap_err();
        assert!(err.is_compile());
        assert_eq!(module_of(&store), ("good".to_string(), "good".to_string()));
        assert_eq!(scheduler.stats().compile_failures, 1);
    }

    #[tokio::test]
    async fn test_first_failure_leaves_unready() {
        let (scheduler, store) = scheduler(
            Arc::new(FailingData),
            Arc::new(CountingModule::new()),
            Arc::new(EchoEngine::new()),
            Duration::from_secs(60),
        );

        assert!(scheduler.refresh().await.is_err());
        assert!(!store.is_ready());
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn test_loop_ticks_on_interval() {
        let module = Arc::new(CountingModule::new());
        let (scheduler, store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            module.clone(),
            Arc::new(EchoEngine::new()),
            Duration::from_millis(20),
        );

        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(1);
        let handle = scheduler.spawn(cancel.clone(), rx);

        store.await_ready().await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.version() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scheduler keeps publishing");

        cancel.cancel();
        handle.await.unwrap();

        // A cycle cut short by the cancel fetches without publishing.
        let calls = module.calls.load(Ordering::SeqCst) as u64;
        let version = store.version();
        assert!(version >= 3);
        assert!(calls == version || calls == version + 1);
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let (scheduler, store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            Arc::new(CountingModule::new()),
            Arc::new(EchoEngine::new()),
            Duration::from_secs(3600),
        );

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let handle = scheduler.spawn(cancel.clone(), rx);
        store.await_ready().await;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(reply_tx).await.unwrap();
        assert!(reply_rx.await.unwrap());
        assert_eq!(store.version(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_aborts_hanging_fetch() {
        let (scheduler, store) = scheduler(
            Arc::new(HangingData),
            Arc::new(CountingModule::new()),
            Arc::new(EchoEngine::new()),
            Duration::from_secs(60),
        );

        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(1);
        let handle = scheduler.spawn(cancel.clone(), rx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler must exit promptly")
            .unwrap();
        assert!(!store.is_ready());
    }

    #[tokio::test]
    async fn test_ready_after_earlier_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let module = crate::providers::FnModuleProvider::new(move |_site: String| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    Err(ProviderError::unavailable("module source down"))
                } else {
                    Ok(format!("v{n}"))
                }
            }
        });
        let (scheduler, store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            Arc::new(module),
            Arc::new(EchoEngine::new()),
            Duration::from_secs(60),
        );

        assert!(scheduler.refresh().await.unwrap_err().is_source());
        assert!(scheduler.refresh().await.unwrap_err().is_source());
        assert!(!store.is_ready());

        assert_eq!(scheduler.refresh().await.unwrap(), 1);
        tokio::time::timeout(Duration::from_secs(1), store.await_ready())
            .await
            .expect("ready after the first publish");
        assert_eq!(module_of(&store), ("v3".to_string(), "v3".to_string()));

        // Readiness is sticky: later waits resolve immediately.
        tokio::time::timeout(Duration::from_millis(50), store.await_ready())
            .await
            .expect("still ready");

        let stats = scheduler.stats();
        assert_eq!(stats.source_failures, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_skips_remaining_compile() {
        let engine = Arc::new(SlowEngine {
            compiles: AtomicUsize::new(0),
            delay: Duration::from_millis(150),
        });
        let (scheduler, store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            Arc::new(CountingModule::new()),
            engine.clone(),
            Duration::from_secs(60),
        );

        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(1);
        let handle = scheduler.spawn(cancel.clone(), rx);

        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.compiles.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first compile starts");
        cancel.cancel();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("scheduler exits without waiting for the compile")
            .unwrap();

        // Let the detached read compile finish; the write compile never starts.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 1);
        assert!(!store.is_ready());
    }

    #[tokio::test]
    async fn test_cancelled_poll_is_not_counted() {
        let engine = Arc::new(EchoEngine::new());
        let (scheduler, store) = scheduler(
            Arc::new(crate::providers::EmptyData),
            Arc::new(CountingModule::new()),
            engine.clone(),
            Duration::from_secs(60),
        );
        scheduler.cancel.cancel();

        assert!(scheduler.refresh().await.unwrap_err().is_cancelled());
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 0);
        assert!(!store.is_ready());

        let stats = scheduler.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.failed(), 0);
        assert!(stats.last_error.is_none());
    }
}
