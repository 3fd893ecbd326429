//! Role, membership and session administration.
//!
//! Every change that can alter a permission decision drops the affected
//! subject's cached decisions.

use serde_json::json;
use std::sync::Arc;

use super::authz::AuthorizationService;
use super::error::ServiceError;
use super::events::EventPublisher;
use super::session_store::SessionStore;
use super::trading_accounts::TradingAccountStore;
use super::users::UserRepository;
use crate::models::{user_subject, DomainEvent, EventType, TradingAccountMembership};

#[derive(Clone)]
pub struct AccessAdminService {
    users: Arc<dyn UserRepository>,
    trading_accounts: Arc<dyn TradingAccountStore>,
    sessions: Arc<dyn SessionStore>,
    authz: Arc<AuthorizationService>,
    events: Arc<dyn EventPublisher>,
}

impl AccessAdminService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        trading_accounts: Arc<dyn TradingAccountStore>,
        sessions: Arc<dyn SessionStore>,
        authz: Arc<AuthorizationService>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            users,
            trading_accounts,
            sessions,
            authz,
            events,
        }
    }

    /// Returns false when the user already held the role.
    pub async fn assign_role(&self, user_id: i64, role_name: &str) -> Result<bool, ServiceError> {
        let granted = self.users.assign_role(user_id, role_name).await?;
        if !granted {
            return Ok(false);
        }

        tracing::info!(user_id, role = role_name, "Role assigned");
        self.invalidate_user(user_id).await;
        self.events
            .publish(DomainEvent::new(
                EventType::RoleAssigned,
                Some(user_id),
                json!({ "role": role_name }),
            ))
            .await;
        Ok(true)
    }

    /// Returns false when the user did not hold the role.
    pub async fn revoke_role(&self, user_id: i64, role_name: &str) -> Result<bool, ServiceError> {
        let revoked = self.users.revoke_role(user_id, role_name).await?;
        if !revoked {
            return Ok(false);
        }

        tracing::info!(user_id, role = role_name, "Role revoked");
        self.invalidate_user(user_id).await;
        self.events
            .publish(DomainEvent::new(
                EventType::RoleRevoked,
                Some(user_id),
                json!({ "role": role_name }),
            ))
            .await;
        Ok(true)
    }

    pub async fn add_membership(&self, membership: &TradingAccountMembership) -> Result<(), ServiceError> {
        self.trading_accounts.upsert_membership(membership).await?;
        tracing::info!(
            user_id = membership.user_id,
            trading_account_id = membership.trading_account_id,
            "Trading account membership saved"
        );
        self.invalidate_user(membership.user_id).await;
        Ok(())
    }

    pub async fn remove_membership(&self, trading_account_id: i64, user_id: i64) -> Result<bool, ServiceError> {
        let removed = self
            .trading_accounts
            .remove_membership(trading_account_id, user_id)
            .await?;
        if removed {
            tracing::info!(user_id, trading_account_id, "Trading account membership removed");
            self.invalidate_user(user_id).await;
        }
        Ok(removed)
    }

    /// Sign the user out everywhere. Returns the number of sessions removed.
    pub async fn revoke_all_sessions(&self, user_id: i64, reason: &str) -> Result<usize, ServiceError> {
        let removed = self
            .sessions
            .delete_user_sessions(user_id)
            .await
            .map_err(ServiceError::SessionStore)?;

        tracing::warn!(user_id, removed, reason, "All sessions revoked");
        self.events
            .publish(DomainEvent::new(
                EventType::SessionRevoked,
                Some(user_id),
                json!({ "reason": reason, "all_devices": true, "removed": removed }),
            ))
            .await;
        Ok(removed)
    }

    /// The write already happened, so a failed invalidation is only logged;
    /// stale entries expire with the cache TTL.
    async fn invalidate_user(&self, user_id: i64) {
        let subject = user_subject(user_id);
        if let Err(e) = self.authz.invalidate_cache(Some(&subject), None, None).await {
            tracing::error!(subject = %subject, error = %e, "Failed to invalidate authorization cache");
        }
    }
}
