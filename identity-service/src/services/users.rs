//! User persistence: accounts, role assignments and MFA material.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::error::ServiceError;
use crate::models::{NewUser, User, UserState};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ServiceError>;

    async fn find_by_id(&self, user_id: i64) -> Result<Option<User>, ServiceError>;

    /// Insert a user holding `default_role`. Fails with `DuplicateEmail` if taken.
    async fn create_user(&self, new_user: &NewUser, default_role: &str) -> Result<User, ServiceError>;

    async fn roles_for_user(&self, user_id: i64) -> Result<Vec<String>, ServiceError>;

    /// Returns false when the user already held the role.
    async fn assign_role(&self, user_id: i64, role_name: &str) -> Result<bool, ServiceError>;

    /// Returns false when the user did not hold the role.
    async fn revoke_role(&self, user_id: i64, role_name: &str) -> Result<bool, ServiceError>;

    /// Stamp the login time and promote pending accounts to active.
    async fn record_login(&self, user_id: i64) -> Result<(), ServiceError>;

    /// Remove one backup code digest. Returns false if it was already used.
    async fn consume_backup_code(&self, user_id: i64, code_hash: &str) -> Result<bool, ServiceError>;

    async fn enable_mfa(
        &self,
        user_id: i64,
        totp_secret: &str,
        backup_code_hashes: &[String],
    ) -> Result<(), ServiceError>;
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// PostgreSQL user repository.
#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "user_id, email, password_hash, full_name, user_state_code, mfa_enabled, \
     totp_secret, backup_code_hashes, preferences, last_login_utc, created_utc";

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE email = $1",
            USER_COLUMNS
        ))
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, user_id: i64) -> Result<Option<User>, ServiceError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE user_id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_user(&self, new_user: &NewUser, default_role: &str) -> Result<User, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, full_name, user_state_code, preferences)
            VALUES ($1, $2, $3, $4, '{{}}'::jsonb)
            ON CONFLICT (email) DO NOTHING
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(normalize_email(&new_user.email))
        .bind(&new_user.password_hash)
        .bind(&new_user.full_name)
        .bind(new_user.state.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let user = inserted.ok_or(ServiceError::DuplicateEmail)?;

        let granted = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, role_id FROM roles WHERE role_name = $2
            "#,
        )
        .bind(user.user_id)
        .bind(default_role)
        .execute(&mut *tx)
        .await?;

        if granted.rows_affected() == 0 {
            return Err(ServiceError::Validation(format!(
                "Unknown default role: {}",
                default_role
            )));
        }

        tx.commit().await?;
        Ok(user)
    }

    async fn roles_for_user(&self, user_id: i64) -> Result<Vec<String>, ServiceError> {
        let roles: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT r.role_name
            FROM user_roles ur
            JOIN roles r ON r.role_id = ur.role_id
            WHERE ur.user_id = $1
            ORDER BY r.role_name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles.into_iter().map(|(name,)| name).collect())
    }

    async fn assign_role(&self, user_id: i64, role_name: &str) -> Result<bool, ServiceError> {
        let role_id: Option<(i64,)> = sqlx::query_as("SELECT role_id FROM roles WHERE role_name = $1")
            .bind(role_name)
            .fetch_optional(&self.pool)
            .await?;
        let Some((role_id,)) = role_id else {
            return Err(ServiceError::Validation(format!("Unknown role: {}", role_name)));
        };

        let result = sqlx::query(
            "INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_role(&self, user_id: i64, role_name: &str) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_roles
            WHERE user_id = $1
              AND role_id = (SELECT role_id FROM roles WHERE role_name = $2)
            "#,
        )
        .bind(user_id)
        .bind(role_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_login(&self, user_id: i64) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            UPDATE users
            SET last_login_utc = NOW(),
                user_state_code = CASE
                    WHEN user_state_code = 'pending_verification' THEN 'active'
                    ELSE user_state_code
                END
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_backup_code(&self, user_id: i64, code_hash: &str) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET backup_code_hashes = array_remove(backup_code_hashes, $2)
            WHERE user_id = $1 AND $2 = ANY(backup_code_hashes)
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn enable_mfa(
        &self,
        user_id: i64,
        totp_secret: &str,
        backup_code_hashes: &[String],
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            UPDATE users
            SET mfa_enabled = TRUE, totp_secret = $2, backup_code_hashes = $3
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(totp_secret)
        .bind(backup_code_hashes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory user repository with a fixed role catalogue.
pub struct MockUserRepository {
    pub users: Mutex<HashMap<i64, User>>,
    pub user_roles: Mutex<HashMap<i64, BTreeSet<String>>>,
    pub known_roles: BTreeSet<String>,
    next_id: AtomicI64,
}

impl Default for MockUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!("Mock user repository mutex poisoned: {}", e))
}

impl MockUserRepository {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            user_roles: Mutex::new(HashMap::new()),
            known_roles: ["user", "trader", "admin"].iter().map(|r| r.to_string()).collect(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Store a fully built user, e.g. one with MFA already enrolled.
    pub fn insert_user(&self, user: User, roles: &[&str]) {
        self.next_id.fetch_max(user.user_id + 1, Ordering::SeqCst);
        if let Ok(mut all) = self.user_roles.lock() {
            all.insert(user.user_id, roles.iter().map(|r| r.to_string()).collect());
        }
        if let Ok(mut users) = self.users.lock() {
            users.insert(user.user_id, user);
        }
    }

    pub fn set_state(&self, user_id: i64, state: UserState) {
        if let Ok(mut users) = self.users.lock() {
            if let Some(user) = users.get_mut(&user_id) {
                user.user_state_code = state.as_str().to_string();
            }
        }
    }

    pub fn get(&self, user_id: i64) -> Option<User> {
        self.users.lock().ok()?.get(&user_id).cloned()
    }
}

#[async_trait]
impl UserRepository for MockUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        let email = normalize_email(email);
        Ok(self
            .users
            .lock()
            .map_err(poisoned)?
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_by_id(&self, user_id: i64) -> Result<Option<User>, ServiceError> {
        Ok(self.users.lock().map_err(poisoned)?.get(&user_id).cloned())
    }

    async fn create_user(&self, new_user: &NewUser, default_role: &str) -> Result<User, ServiceError> {
        if !self.known_roles.contains(default_role) {
            return Err(ServiceError::Validation(format!(
                "Unknown default role: {}",
                default_role
            )));
        }

        let email = normalize_email(&new_user.email);
        let mut users = self.users.lock().map_err(poisoned)?;
        if users.values().any(|u| u.email == email) {
            return Err(ServiceError::DuplicateEmail);
        }

        let user = User {
            user_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            email,
            password_hash: new_user.password_hash.clone(),
            full_name: new_user.full_name.clone(),
            user_state_code: new_user.state.as_str().to_string(),
            mfa_enabled: false,
            totp_secret: None,
            backup_code_hashes: Vec::new(),
            preferences: serde_json::json!({}),
            last_login_utc: None,
            created_utc: Utc::now(),
        };
        users.insert(user.user_id, user.clone());
        self.user_roles
            .lock()
            .map_err(poisoned)?
            .insert(user.user_id, BTreeSet::from([default_role.to_string()]));
        Ok(user)
    }

    async fn roles_for_user(&self, user_id: i64) -> Result<Vec<String>, ServiceError> {
        Ok(self
            .user_roles
            .lock()
            .map_err(poisoned)?
            .get(&user_id)
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn assign_role(&self, user_id: i64, role_name: &str) -> Result<bool, ServiceError> {
        if !self.known_roles.contains(role_name) {
            return Err(ServiceError::Validation(format!("Unknown role: {}", role_name)));
        }
        Ok(self
            .user_roles
            .lock()
            .map_err(poisoned)?
            .entry(user_id)
            .or_default()
            .insert(role_name.to_string()))
    }

    async fn revoke_role(&self, user_id: i64, role_name: &str) -> Result<bool, ServiceError> {
        Ok(self
            .user_roles
            .lock()
            .map_err(poisoned)?
            .get_mut(&user_id)
            .map(|roles| roles.remove(role_name))
            .unwrap_or(false))
    }

    async fn record_login(&self, user_id: i64) -> Result<(), ServiceError> {
        if let Some(user) = self.users.lock().map_err(poisoned)?.get_mut(&user_id) {
            user.last_login_utc = Some(Utc::now());
            if user.state() == UserState::PendingVerification {
                user.user_state_code = UserState::Active.as_str().to_string();
            }
        }
        Ok(())
    }

    async fn consume_backup_code(&self, user_id: i64, code_hash: &str) -> Result<bool, ServiceError> {
        let mut users = self.users.lock().map_err(poisoned)?;
        let Some(user) = users.get_mut(&user_id) else {
            return Ok(false);
        };
        let before = user.backup_code_hashes.len();
        user.backup_code_hashes.retain(|h| h != code_hash);
        Ok(user.backup_code_hashes.len() < before)
    }

    async fn enable_mfa(
        &self,
        user_id: i64,
        totp_secret: &str,
        backup_code_hashes: &[String],
    ) -> Result<(), ServiceError> {
        if let Some(user) = self.users.lock().map_err(poisoned)?.get_mut(&user_id) {
            user.mfa_enabled = true;
            user.totp_secret = Some(totp_secret.to_string());
            user.backup_code_hashes = backup_code_hashes.to_vec();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            password_hash: Some("hash".to_string()),
            full_name: "Test Trader".to_string(),
            state: UserState::PendingVerification,
        }
    }

    #[tokio::test]
    async fn test_mock_create_is_case_insensitive_on_email() {
        let repo = MockUserRepository::new();
        let user = repo.create_user(&new_user("Trader@Example.com"), "user").await.unwrap();
        assert_eq!(user.email, "trader@example.com");
        assert_eq!(repo.roles_for_user(user.user_id).await.unwrap(), vec!["user"]);

        let dup = repo.create_user(&new_user("trader@example.com"), "user").await;
        assert!(matches!(dup, Err(ServiceError::DuplicateEmail)));
        assert!(repo.find_by_email("TRADER@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mock_record_login_activates_pending() {
        let repo = MockUserRepository::new();
        let user = repo.create_user(&new_user("a@example.com"), "user").await.unwrap();
        repo.record_login(user.user_id).await.unwrap();

        let user = repo.get(user.user_id).unwrap();
        assert_eq!(user.state(), UserState::Active);
        assert!(user.last_login_utc.is_some());
    }

    #[tokio::test]
    async fn test_mock_role_assignment() {
        let repo = MockUserRepository::new();
        assert!(repo.assign_role(1, "trader").await.unwrap());
        assert!(!repo.assign_role(1, "trader").await.unwrap());
        assert!(repo.assign_role(1, "wizard").await.is_err());
        assert!(repo.revoke_role(1, "trader").await.unwrap());
        assert!(!repo.revoke_role(1, "trader").await.unwrap());
    }
}
