//! Access requests and results.
//!
//! An access check asks a compiled query which fields of `resource` the user
//! `uid` may read or write. The engine output is reduced here to a sorted,
//! duplicate-free field list. Any output that does not have the expected shape
//! is treated as "no access".

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::ResultSet;

// =============================================================================
// Access Kind
// =============================================================================

/// Kind of access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    /// Field visibility.
    Read,
    /// Field editability.
    Write,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

// =============================================================================
// Access Input
// =============================================================================

/// Input handed to the policy engine for one check.
///
/// Serializes to exactly `{"uid": ..., "resource": ...}`; nothing else about
/// the request reaches the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessInput {
    /// Already-authenticated user id.
    pub uid: String,
    /// Resource name, e.g. `agents`.
    pub resource: String,
}

impl AccessInput {
    /// Create an input for the given user and resource.
    #[must_use]
    pub fn new(uid: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            resource: resource.into(),
        }
    }
}

// =============================================================================
// Access Result
// =============================================================================

/// Outcome of an access check.
///
/// `allowed` is true iff `fields` is non-empty. An empty field list and
/// "no access" are the same thing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessResult {
    /// Permitted field names, sorted and deduplicated.
    pub fields: Vec<String>,
    /// Whether any access is permitted.
    pub allowed: bool,
}

impl AccessResult {
    /// The "no access" result.
    #[must_use]
    pub fn denied() -> Self {
        Self::default()
    }

    /// Build a result from raw field names, sorting and deduplicating them.
    #[must_use]
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let allowed = !fields.is_empty();
        Self { fields, allowed }
    }

    /// Returns `true` if the named field is permitted.
    #[must_use]
    pub fn permits(&self, field: &str) -> bool {
        self.fields.binary_search_by(|f| f.as_str().cmp(field)).is_ok()
    }
}

// =============================================================================
// Result Postprocessing
// =============================================================================

/// Reduce raw engine output to an [`AccessResult`].
///
/// Exactly one result-set holding exactly one array expression is accepted.
/// Non-string array elements are dropped. Every other shape is denied.
#[must_use]
pub fn collect_fields(results: &[ResultSet]) -> AccessResult {
    let [result] = results else {
        tracing::debug!(result_sets = results.len(), "Unexpected result-set count");
        return AccessResult::denied();
    };

    let [expression] = result.expressions.as_slice() else {
        tracing::debug!(
            expressions = result.expressions.len(),
            "Unexpected expression count"
        );
        return AccessResult::denied();
    };

    let Value::Array(items) = expression else {
        tracing::debug!("Policy result is not an array");
        return AccessResult::denied();
    };

    AccessResult::from_fields(items.iter().filter_map(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single(value: Value) -> Vec<ResultSet> {
        vec![ResultSet::single(value)]
    }

    #[test]
    fn test_sorts_and_dedupes() {
        let result = collect_fields(&single(json!(["user", "first_name", "user"])));
        assert_eq!(result.fields, vec!["first_name", "user"]);
        assert!(result.allowed);
    }

    #[test]
    fn test_drops_non_string_elements() {
        let result = collect_fields(&single(json!(["name", 42, null, {"a": 1}, ["x"], "email"])));
        assert_eq!(result.fields, vec!["email", "name"]);
        assert!(result.allowed);
    }

    #[test]
    fn test_only_non_strings_is_denied() {
        let result = collect_fields(&single(json!([1, 2, true])));
        assert_eq!(result, AccessResult::denied());
    }

    #[test]
    fn test_empty_array_is_denied() {
        let result = collect_fields(&single(json!([])));
        assert!(result.fields.is_empty());
        assert!(!result.allowed);
    }

    #[test]
    fn test_zero_result_sets_denied() {
        assert_eq!(collect_fields(&[]), AccessResult::denied());
    }

    #[test]
    fn test_multiple_result_sets_denied() {
        let results = vec![
            ResultSet::single(json!(["a"])),
            ResultSet::single(json!(["b"])),
        ];
        assert_eq!(collect_fields(&results), AccessResult::denied());
    }

    #[test]
    fn test_multiple_expressions_denied() {
        let results = vec![ResultSet {
            expressions: vec![json!(["a"]), json!(["b"])],
        }];
        assert_eq!(collect_fields(&results), AccessResult::denied());
    }

    #[test]
    fn test_no_expressions_denied() {
        let results = vec![ResultSet {
            expressions: vec![],
        }];
        assert_eq!(collect_fields(&results), AccessResult::denied());
    }

    #[test]
    fn test_non_array_expression_denied() {
        for value in [json!("user"), json!(true), json!({"fields": ["a"]}), json!(null)] {
            assert_eq!(collect_fields(&single(value)), AccessResult::denied());
        }
    }

    #[test]
    fn test_permits() {
        let result = AccessResult::from_fields(["user", "email"]);
        assert!(result.permits("email"));
        assert!(result.permits("user"));
        assert!(!result.permits("password"));
    }

    #[test]
    fn test_input_serializes_to_exact_shape() {
        let input = AccessInput::new("abc", "agents");
        assert_eq!(
            serde_json::to_value(&input).unwrap(),
            json!({"uid": "abc", "resource": "agents"})
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(AccessKind::Read.to_string(), "read");
        assert_eq!(AccessKind::Write.to_string(), "write");
    }
}
