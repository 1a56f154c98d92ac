//! Query model: the logical condition tree, sort keys, and page shapes.
//!
//! Conditions are a sum type of two variants. [`Condition::Kv`] values use
//! the `"op:literal"` wire prefix to encode the operator; a bare literal
//! means `equals`.

pub mod condition;
pub mod paged;

use serde::{Deserialize, Serialize};

use crate::federation::routing::Tier;
use crate::record::PersistentRecord;

/// Composite connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
        }
    }
}

/// A logical filter over entity attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// `and`/`or` over child conditions. An empty composite compiles to the
    /// empty string and is ignored by its parent.
    Composite {
        logic: Logic,
        conditions: Vec<Condition>,
    },
    /// One attribute predicate; `value` is `"op:literal"` or a bare literal.
    Kv { attr: String, value: String },
}

impl Condition {
    /// Convenience constructor for an equality / prefixed-operator predicate.
    #[must_use]
    pub fn kv(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Kv {
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// Conjunction of the given conditions.
    #[must_use]
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::Composite {
            logic: Logic::And,
            conditions,
        }
    }

    /// Disjunction of the given conditions.
    #[must_use]
    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::Composite {
            logic: Logic::Or,
            conditions,
        }
    }
}

/// Comparison operator of a [`Condition::Kv`] predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    StartsWith,
    Contains,
}

impl Operator {
    /// Split a wire value into operator and literal. An unknown prefix is
    /// part of the literal, not an operator.
    #[must_use]
    pub fn parse(value: &str) -> (Self, &str) {
        if let Some((prefix, literal)) = value.split_once(':') {
            let op = match prefix {
                "equals" => Some(Self::Equals),
                "not_equals" => Some(Self::NotEquals),
                "gt" => Some(Self::Gt),
                "gte" => Some(Self::Gte),
                "lt" => Some(Self::Lt),
                "lte" => Some(Self::Lte),
                "starts_with" => Some(Self::StartsWith),
                "contains" => Some(Self::Contains),
                _ => None,
            };
            if let Some(op) = op {
                return (op, literal);
            }
        }
        (Self::Equals, value)
    }

    /// SQL comparison token. `starts_with`/`contains` both render as `LIKE`;
    /// the literal carries the wildcards.
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Equals => "=",
            Self::NotEquals => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::StartsWith | Self::Contains => "LIKE",
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::StartsWith => "starts_with",
            Self::Contains => "contains",
        }
    }

    /// Wrap a literal for `LIKE` when the operator calls for it.
    #[must_use]
    pub fn wrap_literal(self, literal: &str) -> String {
        match self {
            Self::StartsWith => format!("{literal}%"),
            Self::Contains => format!("%{literal}%"),
            _ => literal.to_string(),
        }
    }
}

/// One sort key of a paged query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub attr: String,
    #[serde(default)]
    pub descending: bool,
}

/// Per-query routing hints supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryHints {
    /// Explicit tier preference; empty means "let the policy decide".
    #[serde(default)]
    pub preferred_tiers: Vec<Tier>,
    #[serde(default)]
    pub prefer_hot: bool,
    /// Force the anchor choice instead of inspecting the condition.
    #[serde(default)]
    pub use_main_as_anchor: Option<bool>,
}

/// A federated read request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederatedQuery {
    pub schema: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub hints: QueryHints,
}

/// Pagination counters of one result page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounters {
    pub total_records: i64,
    pub total_pages: i64,
    pub current_page: i64,
}

/// One page of records plus counters, identical in shape for both tiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub records: Vec<PersistentRecord>,
    pub counters: PageCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_prefix_parsing() {
        assert_eq!(Operator::parse("equals:call"), (Operator::Equals, "call"));
        assert_eq!(Operator::parse("gt:100"), (Operator::Gt, "100"));
        assert_eq!(Operator::parse("call"), (Operator::Equals, "call"));
        // Unknown prefix stays in the literal.
        assert_eq!(
            Operator::parse("urn:something"),
            (Operator::Equals, "urn:something")
        );
    }

    #[test]
    fn like_literal_wrapping() {
        assert_eq!(Operator::StartsWith.wrap_literal("ca"), "ca%");
        assert_eq!(Operator::Contains.wrap_literal("ca"), "%ca%");
        assert_eq!(Operator::Equals.wrap_literal("ca"), "ca");
    }

    #[test]
    fn condition_wire_format() {
        let wire = r#"{
            "logic": "and",
            "conditions": [
                {"attr": "type", "value": "equals:call"},
                {"logic": "or", "conditions": [{"attr": "status", "value": "open"}]}
            ]
        }"#;
        let parsed: Condition = serde_json::from_str(wire).unwrap();
        let expected = Condition::and(vec![
            Condition::kv("type", "equals:call"),
            Condition::or(vec![Condition::kv("status", "open")]),
        ]);
        assert_eq!(parsed, expected);
    }
}
