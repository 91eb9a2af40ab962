//! Rule model: condition trees and ordered action lists.
//!
//! Rules load from JSON files (one object or an array per file) and from the
//! inline config list. The engine evaluates them priority-descending; the
//! shape here is the exact wire/file schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use super::point::DataType;

/// Maximum nesting depth accepted for a condition tree. Deeper trees are
/// almost certainly generated by mistake and would risk stack exhaustion in
/// the recursive evaluator.
pub const MAX_CONDITION_DEPTH: usize = 32;

/// Known action handler kinds. The registry is keyed by these strings.
pub const KNOWN_ACTION_TYPES: &[&str] = &["alert", "transform", "filter", "aggregate", "forward"];

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RuleValidationError {
    #[error("Rule id must not be empty")]
    EmptyId,

    #[error("Rule {0}: name must not be empty")]
    EmptyName(String),

    #[error("Rule {0}: priority {1} outside 0-100")]
    PriorityRange(String, u8),

    #[error("Rule {0}: no actions declared")]
    NoActions(String),

    #[error("Rule {0}: unknown action type '{1}'")]
    UnknownActionType(String, String),

    #[error("Rule {0}: condition tree deeper than {MAX_CONDITION_DEPTH}")]
    ConditionTooDeep(String),

    #[error("Rule {0}: 'between' needs a 2-element array")]
    BadBetween(String),

    #[error("Rule {0}: 'in' needs an array value")]
    BadIn(String),
}

// ============================================================================
// Conditions
// ============================================================================

/// Comparison operator for simple conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Startswith,
    Endswith,
    Regex,
    In,
    Between,
    Exists,
}

/// Condition tree node.
///
/// `Simple` compares one point field against a literal; `Expression` runs a
/// script through the expression engine. Either way evaluation yields a
/// deterministic boolean or fails that rule for that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Condition {
    Simple {
        field: String,
        operator: Operator,
        #[serde(default)]
        value: serde_json::Value,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
    Expression {
        script: String,
    },
}

impl Condition {
    fn depth(&self) -> usize {
        match self {
            Condition::Simple { .. } | Condition::Expression { .. } => 1,
            Condition::Not { condition } => 1 + condition.depth(),
            Condition::And { conditions } | Condition::Or { conditions } => {
                1 + conditions.iter().map(Condition::depth).max().unwrap_or(0)
            }
        }
    }

    /// Validate literal shapes that the evaluator depends on.
    fn validate(&self, rule_id: &str) -> Result<(), RuleValidationError> {
        match self {
            Condition::Simple {
                operator, value, ..
            } => match operator {
                Operator::Between => {
                    let ok = value.as_array().is_some_and(|a| a.len() == 2);
                    if !ok {
                        return Err(RuleValidationError::BadBetween(rule_id.to_string()));
                    }
                    Ok(())
                }
                Operator::In => {
                    if value.as_array().is_none() {
                        return Err(RuleValidationError::BadIn(rule_id.to_string()));
                    }
                    Ok(())
                }
                _ => Ok(()),
            },
            Condition::Not { condition } => condition.validate(rule_id),
            Condition::And { conditions } | Condition::Or { conditions } => {
                for c in conditions {
                    c.validate(rule_id)?;
                }
                Ok(())
            }
            Condition::Expression { .. } => Ok(()),
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Retry policy for one action. Back-off doubles per attempt, capped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial back-off in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Back-off ceiling in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_backoff_ms() -> u64 {
    100
}
fn default_backoff_cap_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// One entry in a rule's ordered action list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Handler kind ("alert", "transform", "filter", "aggregate", "forward")
    #[serde(rename = "type")]
    pub action_type: String,
    /// Handler-specific configuration, validated by the handler at execution
    #[serde(default)]
    pub config: serde_json::Value,
    /// Asynchronous actions are handed to a detached executor and do not
    /// block the next action in the list
    #[serde(default, rename = "async")]
    pub run_async: bool,
    /// Per-attempt execution budget in milliseconds
    #[serde(default = "default_action_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_action_timeout_ms() -> u64 {
    5_000
}

impl ActionSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Rule
// ============================================================================

/// Conditions plus ordered actions, evaluated against every matching point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier; doubles as the rule file stem and output subject
    /// segment
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 0-100, higher evaluated first
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Bumped on every save; a stale save loses
    #[serde(default)]
    pub version: u64,
    /// Optional point-type filter, checked before any condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    pub conditions: Condition,
    pub actions: Vec<ActionSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}
fn default_priority() -> u8 {
    50
}

impl Rule {
    /// Structural validation applied on load and on save. A failing rule is
    /// rejected alone; the rest of the set still loads.
    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.id.is_empty() {
            return Err(RuleValidationError::EmptyId);
        }
        if self.name.is_empty() {
            return Err(RuleValidationError::EmptyName(self.id.clone()));
        }
        if self.priority > 100 {
            return Err(RuleValidationError::PriorityRange(
                self.id.clone(),
                self.priority,
            ));
        }
        if self.actions.is_empty() {
            return Err(RuleValidationError::NoActions(self.id.clone()));
        }
        for action in &self.actions {
            if !KNOWN_ACTION_TYPES.contains(&action.action_type.as_str()) {
                return Err(RuleValidationError::UnknownActionType(
                    self.id.clone(),
                    action.action_type.clone(),
                ));
            }
        }
        if self.conditions.depth() > MAX_CONDITION_DEPTH {
            return Err(RuleValidationError::ConditionTooDeep(self.id.clone()));
        }
        self.conditions.validate(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: "high temperature".to_string(),
            description: String::new(),
            enabled: true,
            priority: 50,
            version: 0,
            data_type: None,
            conditions: Condition::Simple {
                field: "value".to_string(),
                operator: Operator::Gt,
                value: serde_json::json!(40),
            },
            actions: vec![ActionSpec {
                action_type: "alert".to_string(),
                config: serde_json::json!({"level": "warning"}),
                run_async: false,
                timeout_ms: 5_000,
                retry: RetryPolicy::default(),
            }],
            tags: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn minimal_rule_validates() {
        assert!(minimal_rule("r1").validate().is_ok());
    }

    #[test]
    fn unknown_action_type_rejected() {
        let mut rule = minimal_rule("r2");
        rule.actions[0].action_type = "teleport".to_string();
        assert!(matches!(
            rule.validate(),
            Err(RuleValidationError::UnknownActionType(_, _))
        ));
    }

    #[test]
    fn between_requires_pair() {
        let mut rule = minimal_rule("r3");
        rule.conditions = Condition::Simple {
            field: "value".to_string(),
            operator: Operator::Between,
            value: serde_json::json!([1]),
        };
        assert!(matches!(
            rule.validate(),
            Err(RuleValidationError::BadBetween(_))
        ));
    }

    #[test]
    fn rule_json_round_trip() {
        let rule = minimal_rule("r4");
        let json = serde_json::to_string_pretty(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "r4");
        assert!(matches!(
            back.conditions,
            Condition::Simple {
                operator: Operator::Gt,
                ..
            }
        ));
    }

    #[test]
    fn condition_tree_parses_nested() {
        let json = serde_json::json!({
            "kind": "and",
            "conditions": [
                {"kind": "simple", "field": "value", "operator": "gt", "value": 10},
                {"kind": "not", "condition":
                    {"kind": "simple", "field": "quality", "operator": "ne", "value": 0}},
                {"kind": "expression", "script": "value * 2 > 15"}
            ]
        });
        let cond: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(cond.depth(), 3);
    }

    #[test]
    fn async_and_timeout_deserialize() {
        let spec: ActionSpec = serde_json::from_value(serde_json::json!({
            "type": "forward",
            "async": true,
            "timeout_ms": 250,
            "retry": {"max_attempts": 3}
        }))
        .unwrap();
        assert!(spec.run_async);
        assert_eq!(spec.timeout(), Duration::from_millis(250));
        assert_eq!(spec.retry.max_attempts, 3);
        assert_eq!(spec.retry.backoff_ms, 100);
    }
}
