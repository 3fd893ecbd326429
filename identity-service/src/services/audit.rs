//! Append-only authentication audit trail.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::sync::Mutex;

use crate::models::{AuthEvent, AuthEventType};

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, event: &AuthEvent) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn record(&self, event: &AuthEvent) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO auth_events
                (user_id, event_type, ip_address, session_id, metadata, risk_score, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(&event.ip_address)
        .bind(&event.session_id)
        .bind(&event.metadata)
        .bind(event.risk_score.map(|r| r.as_str()))
        .bind(event.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write audit event: {}", e))?;
        Ok(())
    }
}

/// Keeps audit rows in memory for assertions.
#[derive(Default)]
pub struct MockAuditLog {
    pub events: Mutex<Vec<AuthEvent>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MockAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<AuthEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn of_type(&self, event_type: AuthEventType) -> Vec<AuthEvent> {
        self.recorded()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl AuditLog for MockAuditLog {
    async fn record(&self, event: &AuthEvent) -> Result<(), anyhow::Error> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("audit store unavailable");
        }
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock audit mutex poisoned: {}", e))?
            .push(event.clone());
        Ok(())
    }
}
