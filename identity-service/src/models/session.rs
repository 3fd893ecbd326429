//! Session model - ephemeral login sessions held in the session store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Login session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: i64,
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub mfa_verified: bool,
    /// Persistent sessions live as long as their refresh tokens;
    /// the others expire after inactivity.
    pub persistent: bool,
}

impl Session {
    pub fn new(
        user_id: i64,
        device_fingerprint: Option<String>,
        ip_address: Option<String>,
        mfa_verified: bool,
        persistent: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id,
            device_fingerprint,
            ip_address,
            created_at: now,
            last_active_at: now,
            mfa_verified,
            persistent,
        }
    }

    /// Flatten into hash fields for the session store.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("session_id", self.session_id.clone()),
            ("user_id", self.user_id.to_string()),
            (
                "device_fingerprint",
                self.device_fingerprint.clone().unwrap_or_default(),
            ),
            ("ip_address", self.ip_address.clone().unwrap_or_default()),
            ("created_at", self.created_at.to_rfc3339()),
            ("last_active_at", self.last_active_at.to_rfc3339()),
            ("mfa_verified", flag(self.mfa_verified)),
            ("persistent", flag(self.persistent)),
        ]
    }

    /// Rebuild from hash fields. Returns `None` for incomplete records.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            session_id: fields.get("session_id")?.clone(),
            user_id: fields.get("user_id")?.parse().ok()?,
            device_fingerprint: non_empty(fields.get("device_fingerprint")),
            ip_address: non_empty(fields.get("ip_address")),
            created_at: parse_time(fields.get("created_at")?)?,
            last_active_at: parse_time(fields.get("last_active_at")?)?,
            mfa_verified: fields.get("mfa_verified").map(|v| v == "1").unwrap_or(false),
            persistent: fields.get("persistent").map(|v| v == "1").unwrap_or(false),
        })
    }
}

/// TOTP material held between enrollment and its first verified code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMfaEnrollment {
    pub totp_secret: String,
    pub backup_code_hashes: Vec<String>,
}

pub(crate) fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

pub(crate) fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

pub(crate) fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_round_trip_keeps_optional_fields() {
        let session = Session::new(7, None, Some("10.0.0.1".to_string()), true, false);
        let fields: HashMap<String, String> = session
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let restored = Session::from_fields(&fields).expect("complete record");
        assert_eq!(restored.session_id, session.session_id);
        assert_eq!(restored.device_fingerprint, None);
        assert_eq!(restored.ip_address.as_deref(), Some("10.0.0.1"));
        assert!(restored.mfa_verified);
        assert!(!restored.persistent);
    }

    #[test]
    fn test_incomplete_record_is_rejected() {
        let mut fields = HashMap::new();
        fields.insert("session_id".to_string(), "abc".to_string());
        assert!(Session::from_fields(&fields).is_none());
    }
}
