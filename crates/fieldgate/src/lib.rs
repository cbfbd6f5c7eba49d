//! # fieldgate
//!
//! Field-level authorization for one site, backed by a compiled policy that
//! is refreshed on an interval.
//!
//! ## Overview
//!
//! An [`Authorizer`] answers two questions about an authenticated user and a
//! resource: which fields may be read, and which may be written. The answers
//! come from a rule module evaluated against reference data. Both sources are
//! pluggable through [`DataProvider`] and [`ModuleProvider`].
//!
//! A background task re-fetches both sources, compiles the `read_access` and
//! `write_access` queries, and atomically swaps the pair in. Failed refreshes
//! keep the last good policy. Checks issued before the first success wait.
//!
//! ## Example
//!
//! ```ignore
//! use fieldgate::prelude::*;
//!
//! let authorizer = Authorizer::builder("example.com")
//!     .with_module_file("policy/module.js")
//!     .with_data_file("policy/data.json")
//!     .build();
//!
//! let result = authorizer.read_access("abc", "agents").await;
//! if result.permits("first_name") {
//!     // ...
//! }
//!
//! authorizer.stop().await;
//! ```
//!
//! ## Custom Engines
//!
//! QuickJS is the default engine. Anything implementing [`PolicyEngine`] can
//! replace it via [`AuthorizerBuilder::with_engine`].

pub mod access;
pub mod authorizer;
pub mod config;
pub mod engine;
pub mod error;
pub mod providers;
pub mod refresh;
pub mod snapshot;

pub use access::{AccessInput, AccessKind, AccessResult};
pub use authorizer::{Authorizer, AuthorizerBuilder, AuthorizerState};
pub use config::{
    AuthorizerConfig, ConfigError, DataSourceConfig, ModuleSourceConfig, QuickJsConfig,
};
pub use engine::{CompiledQuery, PolicyEngine, QueryName, QuickJsEngine, ResultSet};
pub use error::{EngineError, FieldgateError, ProviderError};
pub use providers::{DataProvider, ModuleProvider};
pub use refresh::RefreshStats;

/// Reference data handed to a rule module.
pub type DataMap = serde_json::Map<String, serde_json::Value>;

/// Type alias for a fieldgate result.
pub type FieldgateResult<T> = Result<T, FieldgateError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use fieldgate::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AccessKind, AccessResult, Authorizer, AuthorizerConfig, DataMap, DataProvider,
        FieldgateError, FieldgateResult, ModuleProvider, ProviderError,
    };
}
