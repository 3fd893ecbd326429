//! Refresh token family records.
//!
//! Every rotation creates a child record pointing back through `parent_jti`
//! and marks the consumed record with `rotated_to`. A consumed record can
//! never refresh again; presenting it is treated as token theft.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::session::{non_empty, parse_time};

/// Lifecycle of a single refresh token (jti).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTokenState {
    Active,
    RotatedTo(String),
    Expired,
}

/// Stored refresh token record, keyed by jti.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshTokenRecord {
    pub jti: String,
    pub user_id: i64,
    pub session_id: String,
    pub parent_jti: Option<String>,
    pub rotated_to: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    /// First token of a family, minted at login.
    pub fn new(user_id: i64, session_id: String, expires_in_days: i64) -> Self {
        let now = Utc::now();
        Self {
            jti: Uuid::new_v4().to_string(),
            user_id,
            session_id,
            parent_jti: None,
            rotated_to: None,
            issued_at: now,
            expires_at: now + Duration::days(expires_in_days),
        }
    }

    /// Successor of this record in the same family.
    pub fn successor(&self, expires_in_days: i64) -> Self {
        let mut next = Self::new(self.user_id, self.session_id.clone(), expires_in_days);
        next.parent_jti = Some(self.jti.clone());
        next
    }

    pub fn state(&self) -> RefreshTokenState {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> RefreshTokenState {
        if let Some(next) = self.rotated_to.as_ref().filter(|j| !j.is_empty()) {
            return RefreshTokenState::RotatedTo(next.clone());
        }
        if now >= self.expires_at {
            return RefreshTokenState::Expired;
        }
        RefreshTokenState::Active
    }

    /// Seconds until expiry, never below one so stores accept it as a TTL.
    pub fn ttl_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(1)
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("jti", self.jti.clone()),
            ("user_id", self.user_id.to_string()),
            ("session_id", self.session_id.clone()),
            ("parent_jti", self.parent_jti.clone().unwrap_or_default()),
            ("rotated_to", self.rotated_to.clone().unwrap_or_default()),
            ("issued_at", self.issued_at.to_rfc3339()),
            ("expires_at", self.expires_at.to_rfc3339()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            jti: fields.get("jti")?.clone(),
            user_id: fields.get("user_id")?.parse().ok()?,
            session_id: fields.get("session_id")?.clone(),
            parent_jti: non_empty(fields.get("parent_jti")),
            rotated_to: non_empty(fields.get("rotated_to")),
            issued_at: parse_time(fields.get("issued_at")?)?,
            expires_at: parse_time(fields.get("expires_at")?)?,
        })
    }
}

/// Result of the atomic compare-and-swap on a record's `rotated_to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The record was active and now points at the successor.
    Rotated,
    /// Another caller consumed the record first.
    AlreadyRotated(String),
    Missing,
}
