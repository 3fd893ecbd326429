//! Authentication audit events.
//!
//! Rows are append-only. Every authentication state transition writes one
//! before the caller sees the result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audited authentication transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthEventType {
    #[serde(rename = "login.success")]
    LoginSuccess,
    #[serde(rename = "login.failed")]
    LoginFailed,
    #[serde(rename = "login.rate_limited")]
    LoginRateLimited,
    #[serde(rename = "mfa.challenge_issued")]
    MfaChallengeIssued,
    #[serde(rename = "mfa.failed")]
    MfaFailed,
    #[serde(rename = "mfa.rate_limited")]
    MfaRateLimited,
    #[serde(rename = "mfa.enrollment_started")]
    MfaEnrollmentStarted,
    #[serde(rename = "mfa.enabled")]
    MfaEnabled,
    #[serde(rename = "token.refreshed")]
    TokenRefreshed,
    #[serde(rename = "refresh.reuse_detected")]
    RefreshReuseDetected,
    #[serde(rename = "refresh.failed")]
    RefreshFailed,
    #[serde(rename = "logout")]
    Logout,
}

impl AuthEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventType::LoginSuccess => "login.success",
            AuthEventType::LoginFailed => "login.failed",
            AuthEventType::LoginRateLimited => "login.rate_limited",
            AuthEventType::MfaChallengeIssued => "mfa.challenge_issued",
            AuthEventType::MfaFailed => "mfa.failed",
            AuthEventType::MfaRateLimited => "mfa.rate_limited",
            AuthEventType::MfaEnrollmentStarted => "mfa.enrollment_started",
            AuthEventType::MfaEnabled => "mfa.enabled",
            AuthEventType::TokenRefreshed => "token.refreshed",
            AuthEventType::RefreshReuseDetected => "refresh.reuse_detected",
            AuthEventType::RefreshFailed => "refresh.failed",
            AuthEventType::Logout => "logout",
        }
    }
}

/// Risk attached to an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskScore {
    Low,
    Medium,
    High,
}

impl RiskScore {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskScore::Low => "low",
            RiskScore::Medium => "medium",
            RiskScore::High => "high",
        }
    }
}

/// Audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthEvent {
    /// Absent when the identity is unknown (rate limited, unknown email).
    pub user_id: Option<i64>,
    pub event_type: AuthEventType,
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
    pub metadata: serde_json::Value,
    pub risk_score: Option<RiskScore>,
    pub created_utc: DateTime<Utc>,
}

impl AuthEvent {
    pub fn new(event_type: AuthEventType) -> Self {
        Self {
            user_id: None,
            event_type,
            ip_address: None,
            session_id: None,
            metadata: serde_json::json!({}),
            risk_score: None,
            created_utc: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn ip(mut self, ip_address: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_string);
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn risk(mut self, risk_score: RiskScore) -> Self {
        self.risk_score = Some(risk_score);
        self
    }
}
