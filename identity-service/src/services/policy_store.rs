//! Policy persistence. Read-mostly; the decision point loads enabled
//! policies on every uncached check.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::authz::pattern;
use super::error::ServiceError;
use crate::models::{Policy, PolicyDocument, PolicyRow};

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Enabled policies, highest priority first, ties by id.
    async fn list_enabled(&self) -> Result<Vec<Policy>, ServiceError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Policy>, ServiceError>;

    async fn create_policy(&self, document: &PolicyDocument) -> Result<Policy, ServiceError>;

    async fn update_policy(
        &self,
        policy_id: i64,
        document: &PolicyDocument,
    ) -> Result<Option<Policy>, ServiceError>;

    /// Returns false when the policy does not exist.
    async fn set_enabled(&self, policy_id: i64, enabled: bool) -> Result<bool, ServiceError>;
}

/// Reject documents the decision point could never evaluate sensibly.
pub fn validate_policy_document(document: &PolicyDocument) -> Result<(), ServiceError> {
    if document.name.trim().is_empty() {
        return Err(ServiceError::Validation("Policy name is required".to_string()));
    }

    let lists = [
        ("subjects", &document.subjects),
        ("actions", &document.actions),
        ("resources", &document.resources),
    ];
    for (field, patterns) in lists {
        if patterns.is_empty() {
            return Err(ServiceError::Validation(format!(
                "Policy {} needs at least one of {}",
                document.name, field
            )));
        }
        for p in patterns {
            if p.is_empty() {
                return Err(ServiceError::Validation(format!(
                    "Policy {} has an empty pattern in {}",
                    document.name, field
                )));
            }
            pattern::compile(p).map_err(|e| {
                ServiceError::Validation(format!("Invalid pattern {} in {}: {}", p, field, e))
            })?;
        }
    }

    Ok(())
}

fn policy_store_error(e: sqlx::Error) -> ServiceError {
    ServiceError::PolicyStore(anyhow::Error::new(e))
}

fn to_policy(row: PolicyRow) -> Result<Policy, ServiceError> {
    Policy::try_from(row).map_err(|e| ServiceError::PolicyStore(anyhow::anyhow!(e)))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

const POLICY_COLUMNS: &str = "policy_id, name, description, effect, subjects, actions, resources, \
     conditions, priority, enabled, created_utc, updated_utc";

#[derive(Clone)]
pub struct PgPolicyStore {
    pool: PgPool,
}

impl PgPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn list_enabled(&self) -> Result<Vec<Policy>, ServiceError> {
        let rows = sqlx::query_as::<_, PolicyRow>(&format!(
            "SELECT {} FROM policies WHERE enabled ORDER BY priority DESC, policy_id ASC",
            POLICY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(policy_store_error)?;

        rows.into_iter().map(to_policy).collect()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Policy>, ServiceError> {
        let row = sqlx::query_as::<_, PolicyRow>(&format!(
            "SELECT {} FROM policies WHERE name = $1",
            POLICY_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(policy_store_error)?;

        row.map(to_policy).transpose()
    }

    async fn create_policy(&self, document: &PolicyDocument) -> Result<Policy, ServiceError> {
        validate_policy_document(document)?;

        let row = sqlx::query_as::<_, PolicyRow>(&format!(
            r#"
            INSERT INTO policies
                (name, description, effect, subjects, actions, resources, conditions, priority, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            POLICY_COLUMNS
        ))
        .bind(&document.name)
        .bind(&document.description)
        .bind(document.effect.as_str())
        .bind(&document.subjects)
        .bind(&document.actions)
        .bind(&document.resources)
        .bind(document.conditions_json())
        .bind(document.priority)
        .bind(document.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Validation(format!("Policy {} already exists", document.name))
            } else {
                policy_store_error(e)
            }
        })?;

        tracing::info!(policy = %document.name, effect = document.effect.as_str(), "Policy created");
        to_policy(row)
    }

    async fn update_policy(
        &self,
        policy_id: i64,
        document: &PolicyDocument,
    ) -> Result<Option<Policy>, ServiceError> {
        validate_policy_document(document)?;

        let row = sqlx::query_as::<_, PolicyRow>(&format!(
            r#"
            UPDATE policies
            SET name = $2, description = $3, effect = $4, subjects = $5, actions = $6,
                resources = $7, conditions = $8, priority = $9, enabled = $10,
                updated_utc = NOW()
            WHERE policy_id = $1
            RETURNING {}
            "#,
            POLICY_COLUMNS
        ))
        .bind(policy_id)
        .bind(&document.name)
        .bind(&document.description)
        .bind(document.effect.as_str())
        .bind(&document.subjects)
        .bind(&document.actions)
        .bind(&document.resources)
        .bind(document.conditions_json())
        .bind(document.priority)
        .bind(document.enabled)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Validation(format!("Policy {} already exists", document.name))
            } else {
                policy_store_error(e)
            }
        })?;

        row.map(to_policy).transpose()
    }

    async fn set_enabled(&self, policy_id: i64, enabled: bool) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            "UPDATE policies SET enabled = $2, updated_utc = NOW() WHERE policy_id = $1",
        )
        .bind(policy_id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(policy_store_error)?;
        Ok(result.rows_affected() == 1)
    }
}

/// In-memory policy store.
pub struct MockPolicyStore {
    policies: Mutex<BTreeMap<i64, Policy>>,
    next_id: AtomicI64,
    fail: std::sync::atomic::AtomicBool,
}

impl Default for MockPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> ServiceError {
    ServiceError::PolicyStore(anyhow::anyhow!("Mock policy store mutex poisoned: {}", e))
}

impl MockPolicyStore {
    pub fn new() -> Self {
        Self {
            policies: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make every read fail, as an unreachable database would.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<(), ServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::PolicyStore(anyhow::anyhow!("policy store unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for MockPolicyStore {
    async fn list_enabled(&self) -> Result<Vec<Policy>, ServiceError> {
        self.check_failing()?;
        let mut enabled: Vec<Policy> = self
            .policies
            .lock()
            .map_err(poisoned)?
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.policy_id.cmp(&b.policy_id)));
        Ok(enabled)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Policy>, ServiceError> {
        self.check_failing()?;
        Ok(self
            .policies
            .lock()
            .map_err(poisoned)?
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn create_policy(&self, document: &PolicyDocument) -> Result<Policy, ServiceError> {
        validate_policy_document(document)?;
        let mut policies = self.policies.lock().map_err(poisoned)?;
        if policies.values().any(|p| p.name == document.name) {
            return Err(ServiceError::Validation(format!(
                "Policy {} already exists",
                document.name
            )));
        }
        let policy = document
            .clone()
            .into_policy(self.next_id.fetch_add(1, Ordering::SeqCst));
        policies.insert(policy.policy_id, policy.clone());
        Ok(policy)
    }

    async fn update_policy(
        &self,
        policy_id: i64,
        document: &PolicyDocument,
    ) -> Result<Option<Policy>, ServiceError> {
        validate_policy_document(document)?;
        let mut policies = self.policies.lock().map_err(poisoned)?;
        if policies
            .values()
            .any(|p| p.name == document.name && p.policy_id != policy_id)
        {
            return Err(ServiceError::Validation(format!(
                "Policy {} already exists",
                document.name
            )));
        }
        let Some(existing) = policies.get_mut(&policy_id) else {
            return Ok(None);
        };
        let created_utc = existing.created_utc;
        *existing = document.clone().into_policy(policy_id);
        existing.created_utc = created_utc;
        existing.updated_utc = Utc::now();
        Ok(Some(existing.clone()))
    }

    async fn set_enabled(&self, policy_id: i64, enabled: bool) -> Result<bool, ServiceError> {
        let mut policies = self.policies.lock().map_err(poisoned)?;
        match policies.get_mut(&policy_id) {
            Some(policy) => {
                policy.enabled = enabled;
                policy.updated_utc = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
