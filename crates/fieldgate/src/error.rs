//! Error types for policy sources, policy engines and configuration.
//!
//! Access checks never return these: engine failures collapse to a denied
//! [`AccessResult`](crate::access::AccessResult). They surface from the refresh
//! scheduler (logged and counted) and from configuration loading.

use crate::config::ConfigError;

/// Errors raised by a data or module provider while fetching policy sources.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The source could not be reached or read.
    #[error("Source unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The source was read but its content is not usable.
    #[error("Invalid source content: {message}")]
    InvalidContent {
        /// Description of what is wrong with the content.
        message: String,
    },
}

impl ProviderError {
    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidContent` error.
    #[must_use]
    pub fn invalid_content(message: impl Into<String>) -> Self {
        Self::InvalidContent {
            message: message.into(),
        }
    }
}

/// Errors raised by a policy engine while compiling or evaluating a query.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The engine runtime could not be created.
    #[error("Engine initialization failed: {0}")]
    Init(String),

    /// The rule module or reference data could not be compiled.
    #[error("Compilation of '{query}' failed: {message}")]
    Compile {
        /// Name of the query being compiled.
        query: String,
        /// Description of the failure.
        message: String,
    },

    /// A compiled query failed while evaluating an input.
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Evaluation exceeded the configured time budget.
    #[error("Evaluation timed out")]
    Timeout,
}

impl EngineError {
    /// Creates a new `Compile` error.
    #[must_use]
    pub fn compile(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compile {
            query: query.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if the error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Top-level error for a refresh cycle or authorizer construction.
#[derive(Debug, thiserror::Error)]
pub enum FieldgateError {
    /// Fetching data or module text failed.
    #[error("Policy source error: {0}")]
    Source(#[from] ProviderError),

    /// Compiling the query pair failed.
    #[error("Policy compile error: {0}")]
    Compile(#[from] EngineError),

    /// Configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The refresh was stopped before the cycle finished.
    #[error("Refresh cancelled")]
    Cancelled,

    /// An unexpected internal failure (e.g. a panicked compile task).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FieldgateError {
    /// Returns `true` for failures originating in a policy source.
    #[must_use]
    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    /// Returns `true` for failures originating in the policy engine.
    #[must_use]
    pub fn is_compile(&self) -> bool {
        matches!(self, Self::Compile(_))
    }

    /// Returns `true` if the cycle was abandoned because of shutdown.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
