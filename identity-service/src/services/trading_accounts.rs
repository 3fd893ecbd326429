//! Trading account ownership and membership lookups.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use super::error::ServiceError;
use crate::models::TradingAccountMembership;

#[async_trait]
pub trait TradingAccountStore: Send + Sync {
    /// Owner of the account, if the account exists.
    async fn find_owner(&self, trading_account_id: i64) -> Result<Option<i64>, ServiceError>;

    async fn find_membership(
        &self,
        trading_account_id: i64,
        user_id: i64,
    ) -> Result<Option<TradingAccountMembership>, ServiceError>;

    /// Active accounts the user owns or can view, ascending.
    async fn active_account_ids(&self, user_id: i64) -> Result<Vec<i64>, ServiceError>;

    async fn upsert_membership(&self, membership: &TradingAccountMembership) -> Result<(), ServiceError>;

    /// Returns false when there was no membership.
    async fn remove_membership(&self, trading_account_id: i64, user_id: i64) -> Result<bool, ServiceError>;
}

#[derive(Clone)]
pub struct PgTradingAccountStore {
    pool: PgPool,
}

impl PgTradingAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradingAccountStore for PgTradingAccountStore {
    async fn find_owner(&self, trading_account_id: i64) -> Result<Option<i64>, ServiceError> {
        let owner: Option<(i64,)> =
            sqlx::query_as("SELECT user_id FROM trading_accounts WHERE trading_account_id = $1")
                .bind(trading_account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(owner.map(|(user_id,)| user_id))
    }

    async fn find_membership(
        &self,
        trading_account_id: i64,
        user_id: i64,
    ) -> Result<Option<TradingAccountMembership>, ServiceError> {
        let membership = sqlx::query_as::<_, TradingAccountMembership>(
            r#"
            SELECT trading_account_id, user_id, role, can_view, can_trade, can_manage
            FROM trading_account_members
            WHERE trading_account_id = $1 AND user_id = $2
            "#,
        )
        .bind(trading_account_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(membership)
    }

    async fn active_account_ids(&self, user_id: i64) -> Result<Vec<i64>, ServiceError> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT ta.trading_account_id
            FROM trading_accounts ta
            WHERE ta.is_active
              AND (ta.user_id = $1
                   OR EXISTS (SELECT 1 FROM trading_account_members m
                              WHERE m.trading_account_id = ta.trading_account_id
                                AND m.user_id = $1 AND m.can_view))
            ORDER BY ta.trading_account_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn upsert_membership(&self, membership: &TradingAccountMembership) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO trading_account_members
                (trading_account_id, user_id, role, can_view, can_trade, can_manage)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (trading_account_id, user_id) DO UPDATE
            SET role = EXCLUDED.role,
                can_view = EXCLUDED.can_view,
                can_trade = EXCLUDED.can_trade,
                can_manage = EXCLUDED.can_manage
            "#,
        )
        .bind(membership.trading_account_id)
        .bind(membership.user_id)
        .bind(&membership.role)
        .bind(membership.can_view)
        .bind(membership.can_trade)
        .bind(membership.can_manage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_membership(&self, trading_account_id: i64, user_id: i64) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            "DELETE FROM trading_account_members WHERE trading_account_id = $1 AND user_id = $2",
        )
        .bind(trading_account_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
struct MockAccount {
    owner_id: i64,
    is_active: bool,
}

#[derive(Default)]
pub struct MockTradingAccountStore {
    accounts: Mutex<HashMap<i64, MockAccount>>,
    memberships: Mutex<HashMap<(i64, i64), TradingAccountMembership>>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!("Mock trading account store mutex poisoned: {}", e))
}

impl MockTradingAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, trading_account_id: i64, owner_id: i64, is_active: bool) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(trading_account_id, MockAccount { owner_id, is_active });
        }
    }
}

#[async_trait]
impl TradingAccountStore for MockTradingAccountStore {
    async fn find_owner(&self, trading_account_id: i64) -> Result<Option<i64>, ServiceError> {
        Ok(self
            .accounts
            .lock()
            .map_err(poisoned)?
            .get(&trading_account_id)
            .map(|a| a.owner_id))
    }

    async fn find_membership(
        &self,
        trading_account_id: i64,
        user_id: i64,
    ) -> Result<Option<TradingAccountMembership>, ServiceError> {
        Ok(self
            .memberships
            .lock()
            .map_err(poisoned)?
            .get(&(trading_account_id, user_id))
            .cloned())
    }

    async fn active_account_ids(&self, user_id: i64) -> Result<Vec<i64>, ServiceError> {
        let accounts = self.accounts.lock().map_err(poisoned)?;
        let memberships = self.memberships.lock().map_err(poisoned)?;

        let ids: BTreeSet<i64> = accounts
            .iter()
            .filter(|(_, a)| a.is_active)
            .filter(|(id, a)| {
                a.owner_id == user_id
                    || memberships
                        .get(&(**id, user_id))
                        .map(|m| m.can_view)
                        .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn upsert_membership(&self, membership: &TradingAccountMembership) -> Result<(), ServiceError> {
        self.memberships.lock().map_err(poisoned)?.insert(
            (membership.trading_account_id, membership.user_id),
            membership.clone(),
        );
        Ok(())
    }

    async fn remove_membership(&self, trading_account_id: i64, user_id: i64) -> Result<bool, ServiceError> {
        Ok(self
            .memberships
            .lock()
            .map_err(poisoned)?
            .remove(&(trading_account_id, user_id))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_active_accounts_include_owned_and_viewable() {
        let store = MockTradingAccountStore::new();
        store.add_account(10, 1, true);
        store.add_account(11, 2, true);
        store.add_account(12, 1, false);
        store.add_account(13, 2, true);
        store
            .upsert_membership(&TradingAccountMembership {
                trading_account_id: 11,
                user_id: 1,
                role: Some("viewer".to_string()),
                can_view: true,
                can_trade: false,
                can_manage: false,
            })
            .await
            .unwrap();
        store
            .upsert_membership(&TradingAccountMembership {
                trading_account_id: 13,
                user_id: 1,
                role: None,
                can_view: false,
                can_trade: false,
                can_manage: false,
            })
            .await
            .unwrap();

        assert_eq!(store.active_account_ids(1).await.unwrap(), vec![10, 11]);
        assert!(store.remove_membership(11, 1).await.unwrap());
        assert_eq!(store.active_account_ids(1).await.unwrap(), vec![10]);
    }
}
