//! Condition expression types used to gate step execution.
//!
//! A step `condition` is written either as a compact string
//! (`"{{steps.fetch.ok}} == true && exists {{steps.fetch.items}}"`) or as an
//! explicit tree. Evaluation lives in `conductor-core`; this module only
//! defines the serializable shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a condition is written in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    /// Compact string form, parsed at evaluation time.
    Expression(String),
    /// Explicit expression tree.
    Tree(Condition),
}

/// Boolean expression tree.
///
/// ```yaml
/// condition:
///   and:
///     - compare: { left: "{{steps.a.ok}}", operator: equals, right: true }
///     - not:
///         - compare: { left: "{{steps.a.error}}", operator: exists }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Compare(Comparison),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    /// Must hold exactly one operand.
    Not(Vec<Condition>),
}

/// A single operator application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub left: Value,
    pub operator: ConditionOperator,
    /// Absent for the unary `exists` / `not_exists` operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Value>,
}

/// The fixed operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Exists,
    NotExists,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Matches,
    NotMatches,
}

impl ConditionOperator {
    /// Whether the operator takes only a left operand.
    pub fn is_unary(&self) -> bool {
        matches!(self, ConditionOperator::Exists | ConditionOperator::NotExists)
    }

    /// Symbol used when rendering an expression for logs.
    pub fn symbol(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "==",
            ConditionOperator::NotEquals => "!=",
            ConditionOperator::Contains => "contains",
            ConditionOperator::NotContains => "not_contains",
            ConditionOperator::Exists => "exists",
            ConditionOperator::NotExists => "not_exists",
            ConditionOperator::GreaterThan => ">",
            ConditionOperator::GreaterThanOrEqual => ">=",
            ConditionOperator::LessThan => "<",
            ConditionOperator::LessThanOrEqual => "<=",
            ConditionOperator::Matches => "matches",
            ConditionOperator::NotMatches => "not_matches",
        }
    }

    /// Parse an operator from its symbol or word form.
    pub fn parse(token: &str) -> Option<Self> {
        let op = match token {
            "==" | "equals" | "eq" => ConditionOperator::Equals,
            "!=" | "not_equals" | "ne" => ConditionOperator::NotEquals,
            "contains" => ConditionOperator::Contains,
            "not_contains" => ConditionOperator::NotContains,
            "exists" => ConditionOperator::Exists,
            "not_exists" => ConditionOperator::NotExists,
            ">" | "greater_than" | "gt" => ConditionOperator::GreaterThan,
            ">=" | "greater_than_or_equal" | "gte" => ConditionOperator::GreaterThanOrEqual,
            "<" | "less_than" | "lt" => ConditionOperator::LessThan,
            "<=" | "less_than_or_equal" | "lte" => ConditionOperator::LessThanOrEqual,
            "matches" | "=~" => ConditionOperator::Matches,
            "not_matches" | "!~" => ConditionOperator::NotMatches,
            _ => return None,
        };
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_condition_is_expression() {
        let spec: ConditionSpec = serde_json::from_value(json!("{{steps.a.ok}} == true")).unwrap();
        assert!(matches!(spec, ConditionSpec::Expression(_)));
    }

    #[test]
    fn test_tree_condition_deserializes() {
        let spec: ConditionSpec = serde_json::from_value(json!({
            "and": [
                { "compare": { "left": "{{steps.a.ok}}", "operator": "equals", "right": true } },
                { "not": [ { "compare": { "left": "{{steps.a.error}}", "operator": "exists" } } ] }
            ]
        }))
        .unwrap();

        let ConditionSpec::Tree(Condition::And(children)) = spec else {
            panic!("expected and-tree");
        };
        assert_eq!(children.len(), 2);
        match &children[1] {
            Condition::Not(inner) => match &inner[0] {
                Condition::Compare(cmp) => {
                    assert_eq!(cmp.operator, ConditionOperator::Exists);
                    assert!(cmp.right.is_none());
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_operator_parse_aliases() {
        assert_eq!(ConditionOperator::parse("=="), Some(ConditionOperator::Equals));
        assert_eq!(ConditionOperator::parse("gte"), Some(ConditionOperator::GreaterThanOrEqual));
        assert_eq!(ConditionOperator::parse("!~"), Some(ConditionOperator::NotMatches));
        assert_eq!(ConditionOperator::parse("~~"), None);
        assert!(ConditionOperator::Exists.is_unary());
        assert!(!ConditionOperator::Matches.is_unary());
    }
}
