//! Policy engine interface.
//!
//! The authorizer treats rule evaluation as an opaque capability with two
//! steps:
//!
//! - [`PolicyEngine::compile`] binds reference data and a rule module to one
//!   named query, producing a reusable [`CompiledQuery`].
//! - [`CompiledQuery::evaluate`] runs that query for one input.
//!
//! Compilation happens once per refresh cycle; evaluation happens on every
//! access check and must be safe to call from many threads at once.
//!
//! ```ignore
//! use fieldgate::engine::{PolicyEngine, QueryName, QuickJsEngine};
//!
//! let engine = QuickJsEngine::new(QuickJsConfig::default());
//! let read = engine.compile(&data, module, QueryName::ReadAccess)?;
//! let results = read.evaluate(&AccessInput::new("abc", "agents"))?;
//! ```

pub mod quickjs;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::DataMap;
use crate::access::AccessInput;
use crate::error::EngineError;

pub use quickjs::{QuickJsEngine, QuickJsQuery, QuickJsStats};

// =============================================================================
// Query Names
// =============================================================================

/// The two queries compiled on every refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryName {
    /// Fields the user may read.
    ReadAccess,
    /// Fields the user may write.
    WriteAccess,
}

impl QueryName {
    /// Name of the rule the module must define.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadAccess => "read_access",
            Self::WriteAccess => "write_access",
        }
    }
}

impl fmt::Display for QueryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Results
// =============================================================================

/// One set of expression values produced by an evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Expression values in query order.
    pub expressions: Vec<Value>,
}

impl ResultSet {
    /// A result-set holding a single expression.
    #[must_use]
    pub fn single(value: Value) -> Self {
        Self {
            expressions: vec![value],
        }
    }
}

// =============================================================================
// Engine Traits
// =============================================================================

/// A query bound to one version of data and rules.
pub trait CompiledQuery: Send + Sync {
    /// Evaluate the query for one input.
    ///
    /// An empty vector means the query is undefined for this input.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation fails or times out.
    fn evaluate(&self, input: &AccessInput) -> Result<Vec<ResultSet>, EngineError>;
}

/// A rule-evaluation engine able to compile named queries.
pub trait PolicyEngine: Send + Sync {
    /// Compile `query` against the given reference data and rule module.
    ///
    /// # Errors
    ///
    /// Returns an error if the module or data cannot be compiled.
    fn compile(
        &self,
        data: &DataMap,
        module: &str,
        query: QueryName,
    ) -> Result<Arc<dyn CompiledQuery>, EngineError>;
}
