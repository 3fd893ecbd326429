//! Outbound domain events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "user.registered")]
    UserRegistered,
    #[serde(rename = "login.success")]
    LoginSuccess,
    #[serde(rename = "token.refreshed")]
    TokenRefreshed,
    #[serde(rename = "refresh.reuse_detected")]
    RefreshReuseDetected,
    #[serde(rename = "session.revoked")]
    SessionRevoked,
    #[serde(rename = "role.assigned")]
    RoleAssigned,
    #[serde(rename = "role.revoked")]
    RoleRevoked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserRegistered => "user.registered",
            EventType::LoginSuccess => "login.success",
            EventType::TokenRefreshed => "token.refreshed",
            EventType::RefreshReuseDetected => "refresh.reuse_detected",
            EventType::SessionRevoked => "session.revoked",
            EventType::RoleAssigned => "role.assigned",
            EventType::RoleRevoked => "role.revoked",
        }
    }
}

/// Event envelope published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub user_id: Option<i64>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: EventType, user_id: Option<i64>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            user_id,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Channel the event is published on, e.g. `identity.session.revoked`.
    pub fn channel(&self) -> String {
        format!("identity.{}", self.event_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_and_serialization() {
        let event = DomainEvent::new(
            EventType::SessionRevoked,
            Some(7),
            serde_json::json!({"reason": "logout"}),
        );
        assert_eq!(event.channel(), "identity.session.revoked");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "session.revoked");
        assert_eq!(json["payload"]["reason"], "logout");
    }
}
