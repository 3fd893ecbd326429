//! User model - platform accounts that own sessions and trading accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// User state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    PendingVerification,
    Active,
    Suspended,
    Deactivated,
}

impl UserState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserState::PendingVerification => "pending_verification",
            UserState::Active => "active",
            UserState::Suspended => "suspended",
            UserState::Deactivated => "deactivated",
        }
    }
}

impl std::str::FromStr for UserState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_verification" => Ok(UserState::PendingVerification),
            "active" => Ok(UserState::Active),
            "suspended" => Ok(UserState::Suspended),
            "deactivated" => Ok(UserState::Deactivated),
            _ => Err(format!("Invalid user state: {}", s)),
        }
    }
}

/// User entity.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: i64,
    pub email: String,
    /// Absent for accounts created through an external identity provider.
    pub password_hash: Option<String>,
    pub full_name: String,
    pub user_state_code: String,
    pub mfa_enabled: bool,
    pub totp_secret: Option<String>,
    /// SHA-256 hex digests of unused backup codes.
    pub backup_code_hashes: Vec<String>,
    pub preferences: serde_json::Value,
    pub last_login_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl User {
    /// Parsed state. Unknown codes are treated as deactivated.
    pub fn state(&self) -> UserState {
        self.user_state_code
            .parse()
            .unwrap_or(UserState::Deactivated)
    }

    /// Subject string the authorization layer evaluates, e.g. `user:42`.
    pub fn subject(&self) -> String {
        user_subject(self.user_id)
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary::from(self)
    }
}

pub fn user_subject(user_id: i64) -> String {
    format!("user:{}", user_id)
}

/// Fields required to insert a user row.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: Option<String>,
    pub full_name: String,
    pub state: UserState,
}

/// Request to register a new user.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterUserRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 128))]
    pub password: String,
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
}

/// User summary returned alongside tokens (no sensitive fields).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub user_id: i64,
    pub email: String,
    pub full_name: String,
    pub user_state_code: String,
    pub mfa_enabled: bool,
}

impl From<&User> for UserSummary {
    fn from(u: &User) -> Self {
        Self {
            user_id: u.user_id,
            email: u.email.clone(),
            full_name: u.full_name.clone(),
            user_state_code: u.user_state_code.clone(),
            mfa_enabled: u.mfa_enabled,
        }
    }
}
