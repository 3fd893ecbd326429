//! Policy model - ABAC policy documents evaluated by the decision point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// Request attributes supplied alongside a permission check.
pub type PolicyContext = serde_json::Map<String, serde_json::Value>;

/// Policy effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

impl PolicyEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyEffect::Allow => "ALLOW",
            PolicyEffect::Deny => "DENY",
        }
    }
}

impl std::str::FromStr for PolicyEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ALLOW" => Ok(PolicyEffect::Allow),
            "DENY" => Ok(PolicyEffect::Deny),
            _ => Err(format!("Invalid policy effect: {}", s)),
        }
    }
}

/// Comparison applied between a context value and the condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    /// Operators this build does not know never match.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(operator: ConditionOperator, value: serde_json::Value) -> Self {
        Self { operator, value }
    }
}

/// Policy entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub policy_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub effect: PolicyEffect,
    pub subjects: Vec<String>,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
    pub conditions: BTreeMap<String, Condition>,
    pub priority: i32,
    pub enabled: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Raw `policies` row.
#[derive(Debug, Clone, FromRow)]
pub struct PolicyRow {
    pub policy_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub effect: String,
    pub subjects: Vec<String>,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
    pub conditions: serde_json::Value,
    pub priority: i32,
    pub enabled: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl TryFrom<PolicyRow> for Policy {
    type Error = String;

    fn try_from(row: PolicyRow) -> Result<Self, Self::Error> {
        let conditions = if row.conditions.is_null() {
            BTreeMap::new()
        } else {
            serde_json::from_value(row.conditions)
                .map_err(|e| format!("Invalid conditions on policy {}: {}", row.name, e))?
        };

        Ok(Self {
            policy_id: row.policy_id,
            effect: row.effect.parse()?,
            name: row.name,
            description: row.description,
            subjects: row.subjects,
            actions: row.actions,
            resources: row.resources,
            conditions,
            priority: row.priority,
            enabled: row.enabled,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

/// Writable part of a policy, used for create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub effect: PolicyEffect,
    pub subjects: Vec<String>,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl PolicyDocument {
    pub fn new(
        name: impl Into<String>,
        effect: PolicyEffect,
        subjects: &[&str],
        actions: &[&str],
        resources: &[&str],
        priority: i32,
    ) -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            name: name.into(),
            description: None,
            effect,
            subjects: owned(subjects),
            actions: owned(actions),
            resources: owned(resources),
            conditions: BTreeMap::new(),
            priority,
            enabled: true,
        }
    }

    pub fn with_condition(mut self, key: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(key.into(), condition);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Materialize as a stored policy.
    pub fn into_policy(self, policy_id: i64) -> Policy {
        let now = Utc::now();
        Policy {
            policy_id,
            name: self.name,
            description: self.description,
            effect: self.effect,
            subjects: self.subjects,
            actions: self.actions,
            resources: self.resources,
            conditions: self.conditions,
            priority: self.priority,
            enabled: self.enabled,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn conditions_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.conditions).unwrap_or_else(|_| serde_json::json!({}))
    }
}
