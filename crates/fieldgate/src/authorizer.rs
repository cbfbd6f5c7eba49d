//! The authorizer facade.
//!
//! An [`Authorizer`] owns the snapshot store and the background refresh task
//! for one site. Access checks wait for the first successful refresh, then
//! evaluate the active compiled query against `{uid, resource}`.
//!
//! ```ignore
//! let authorizer = Authorizer::builder("example.com")
//!     .with_module_file("policy/module.js")
//!     .with_data_url("https://policy.example.com/data.json")
//!     .await
//!     .with_interval(Duration::from_secs(30))
//!     .build();
//!
//! let result = authorizer.read_access("abc", "agents").await;
//! assert!(result.allowed);
//!
//! authorizer.stop().await;
//! ```

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{DataMap, FieldgateResult};
use crate::access::{AccessInput, AccessKind, AccessResult, collect_fields};
use crate::config::{
    AuthorizerConfig, DEFAULT_INTERVAL, DataSourceConfig, ModuleSourceConfig, QuickJsConfig,
};
use crate::engine::{PolicyEngine, QuickJsEngine};
use crate::error::ProviderError;
use crate::providers::{
    DataProvider, EmptyData, EmptyModule, FileDataProvider, FileModuleProvider, FnDataProvider,
    FnModuleProvider, ModuleProvider, StaticData, StaticModule, UrlDataProvider,
};
use crate::refresh::{RefreshReply, RefreshScheduler, RefreshStats, SharedRefreshStats};
use crate::snapshot::SnapshotStore;

// =============================================================================
// Authorizer State
// =============================================================================

/// Lifecycle state of an authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizerState {
    /// No refresh has succeeded yet; checks wait.
    Unready,
    /// A compiled policy is being served.
    Ready,
    /// The refresh task has been stopped.
    Stopped,
}

impl fmt::Display for AuthorizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unready => write!(f, "unready"),
            Self::Ready => write!(f, "ready"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Authorizer
// =============================================================================

/// Field-level authorizer for one site.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Dropping the
/// authorizer cancels the refresh task without waiting for it.
pub struct Authorizer {
    site: String,
    store: Arc<SnapshotStore>,
    stats: SharedRefreshStats,
    cancel: CancellationToken,
    trigger: mpsc::Sender<RefreshReply>,
    task: Mutex<Option<JoinHandle<()>>>,
    startup_timeout: Option<Duration>,
}

impl Authorizer {
    /// Start configuring an authorizer for `site`.
    pub fn builder(site: impl Into<String>) -> AuthorizerBuilder {
        AuthorizerBuilder::new(site)
    }

    /// Authorizer with empty data and an empty module; every check is denied.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(site: impl Into<String>) -> Self {
        Self::builder(site).build()
    }

    /// Build an authorizer from a validated configuration.
    ///
    /// A URL data source is fetched here, once.
    ///
    /// # Errors
    ///
    /// Returns `FieldgateError::Config` if the configuration is invalid.
    pub async fn from_config(config: &AuthorizerConfig) -> FieldgateResult<Self> {
        config.validate()?;

        let mut builder = Self::builder(config.site.clone())
            .with_interval(config.interval)
            .with_quickjs(config.quickjs.clone());

        if let Some(timeout) = config.startup_timeout {
            builder = builder.with_startup_timeout(timeout);
        }

        builder = match &config.data {
            DataSourceConfig::None => builder,
            DataSourceConfig::Inline { value } => builder.with_static_data(value.clone()),
            DataSourceConfig::Url { url } => builder.with_data_url(url).await,
            DataSourceConfig::File { path } => builder.with_data_file(path.clone()),
        };

        builder = match &config.module {
            ModuleSourceConfig::None => builder,
            ModuleSourceConfig::Inline { text } => builder.with_static_module(text.clone()),
            ModuleSourceConfig::File { path } => builder.with_module_file(path.clone()),
        };

        Ok(builder.build())
    }

    /// The site this authorizer serves.
    #[must_use]
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Fields `uid` may read on `resource`.
    pub async fn read_access(&self, uid: &str, resource: &str) -> AccessResult {
        self.check_access(AccessKind::Read, uid, resource).await
    }

    /// Fields `uid` may write on `resource`.
    pub async fn write_access(&self, uid: &str, resource: &str) -> AccessResult {
        self.check_access(AccessKind::Write, uid, resource).await
    }

    /// Evaluate the active policy for `kind`.
    ///
    /// Waits for the first successful refresh. Returns a denial if the
    /// startup timeout expires first, if the authorizer is stopped before it
    /// ever became ready, or if evaluation fails.
    pub async fn check_access(&self, kind: AccessKind, uid: &str, resource: &str) -> AccessResult {
        if !self.wait_ready().await {
            return AccessResult::denied();
        }

        // Snapshot once; a concurrent publish cannot split the read below.
        let Some(pair) = self.store.current() else {
            return AccessResult::denied();
        };

        let input = AccessInput::new(uid, resource);
        match pair.query(kind).evaluate(&input) {
            Ok(results) => collect_fields(&results),
            Err(e) => {
                tracing::warn!(
                    site = %self.site,
                    kind = %kind,
                    uid,
                    resource,
                    version = pair.version,
                    error = %e,
                    "Policy evaluation failed, denying access"
                );
                AccessResult::denied()
            }
        }
    }

    async fn wait_ready(&self) -> bool {
        if self.store.is_ready() {
            return true;
        }

        let ready = async {
            tokio::select! {
                () = self.store.await_ready() => true,
                () = self.cancel.cancelled() => self.store.is_ready(),
            }
        };

        match self.startup_timeout {
            None => ready.await,
            Some(timeout) => match tokio::time::timeout(timeout, ready).await {
                Ok(ready) => ready,
                Err(_) => {
                    tracing::warn!(
                        site = %self.site,
                        timeout_ms = timeout.as_millis() as u64,
                        "Policy not ready before startup timeout, denying access"
                    );
                    false
                }
            },
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AuthorizerState {
        if self.cancel.is_cancelled() {
            AuthorizerState::Stopped
        } else if self.store.is_ready() {
            AuthorizerState::Ready
        } else {
            AuthorizerState::Unready
        }
    }

    /// Whether a compiled policy has been published.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.store.is_ready()
    }

    /// Version of the active policy, `0` before the first publish.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.store.version()
    }

    /// Refresh statistics.
    #[must_use]
    pub fn stats(&self) -> RefreshStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a refresh cycle now and wait for it.
    ///
    /// Returns `true` if the cycle published a new policy, `false` if it
    /// failed or the authorizer is stopped.
    pub async fn refresh_now(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        if self.trigger.send(tx).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop the refresh task and wait for it to exit.
    ///
    /// Interrupts an in-flight fetch or compile wait. Safe to call more than
    /// once. The last published policy keeps being served afterwards.
    ///
    /// A query compile already running on the blocking pool cannot be
    /// interrupted and finishes after this returns; it is never published
    /// and the rest of that cycle is skipped.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && e.is_panic()
        {
            tracing::error!(site = %self.site, error = %e, "Policy refresh task panicked");
        }
    }
}

impl Drop for Authorizer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer")
            .field("site", &self.site)
            .field("state", &self.state())
            .field("version", &self.version())
            .field("startup_timeout", &self.startup_timeout)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Authorizer`].
///
/// Defaults: empty data, empty module, QuickJS engine, 60 second interval,
/// no startup timeout.
pub struct AuthorizerBuilder {
    site: String,
    data: Arc<dyn DataProvider>,
    module: Arc<dyn ModuleProvider>,
    engine: Option<Arc<dyn PolicyEngine>>,
    quickjs: QuickJsConfig,
    interval: Duration,
    startup_timeout: Option<Duration>,
}

impl AuthorizerBuilder {
    fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            data: Arc::new(EmptyData),
            module: Arc::new(EmptyModule),
            engine: None,
            quickjs: QuickJsConfig::default(),
            interval: DEFAULT_INTERVAL,
            startup_timeout: None,
        }
    }

    /// Use a custom data provider.
    #[must_use]
    pub fn with_data(mut self, provider: impl DataProvider + 'static) -> Self {
        self.data = Arc::new(provider);
        self
    }

    /// Fetch data by calling `f` with the site every cycle.
    #[must_use]
    pub fn with_data_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DataMap, ProviderError>> + Send + 'static,
    {
        self.with_data(FnDataProvider::new(f))
    }

    /// Serve the same data every cycle.
    #[must_use]
    pub fn with_static_data(self, data: DataMap) -> Self {
        self.with_data(StaticData(data))
    }

    /// Fetch a JSON document from `url` now and serve it every cycle.
    ///
    /// A failed fetch is not reported here; every cycle then fails with it.
    pub async fn with_data_url(self, url: &str) -> Self {
        let provider = UrlDataProvider::fetch(url).await;
        self.with_data(provider)
    }

    /// Re-read a JSON file every cycle.
    #[must_use]
    pub fn with_data_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_data(FileDataProvider::new(path))
    }

    /// Use a custom module provider.
    #[must_use]
    pub fn with_module(mut self, provider: impl ModuleProvider + 'static) -> Self {
        self.module = Arc::new(provider);
        self
    }

    /// Fetch module text by calling `f` with the site every cycle.
    #[must_use]
    pub fn with_module_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ProviderError>> + Send + 'static,
    {
        self.with_module(FnModuleProvider::new(f))
    }

    /// Serve the same module text every cycle.
    #[must_use]
    pub fn with_static_module(self, text: impl Into<String>) -> Self {
        self.with_module(StaticModule(text.into()))
    }

    /// Re-read a module file every cycle.
    #[must_use]
    pub fn with_module_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_module(FileModuleProvider::new(path))
    }

    /// Refresh period. A zero interval is replaced by the default.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Deny checks that wait longer than `timeout` for the first refresh.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Use a custom policy engine instead of QuickJS.
    #[must_use]
    pub fn with_engine(mut self, engine: impl PolicyEngine + 'static) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// QuickJS limits; ignored when a custom engine is set.
    #[must_use]
    pub fn with_quickjs(mut self, config: QuickJsConfig) -> Self {
        self.quickjs = config;
        self
    }

    /// Build the authorizer and start its refresh task.
    ///
    /// The first refresh cycle starts immediately.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn build(self) -> Authorizer {
        let interval = if self.interval.is_zero() {
            tracing::warn!(site = %self.site, "Zero refresh interval, using default");
            DEFAULT_INTERVAL
        } else {
            self.interval
        };

        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(QuickJsEngine::new(self.quickjs)));
        let store = Arc::new(SnapshotStore::new());

        let scheduler = RefreshScheduler::new(
            self.site.clone(),
            self.data,
            self.module,
            engine,
            store.clone(),
            interval,
        );
        let stats = scheduler.stats_handle();

        let cancel = CancellationToken::new();
        let (trigger, trigger_rx) = mpsc::channel(1);
        let task = scheduler.spawn(cancel.clone(), trigger_rx);

        Authorizer {
            site: self.site,
            store,
            stats,
            cancel,
            trigger,
            task: Mutex::new(Some(task)),
            startup_timeout: self.startup_timeout,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
