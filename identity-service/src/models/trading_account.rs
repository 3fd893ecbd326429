//! Trading account ownership and membership.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Capability level required on a trading account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    View,
    Trade,
    Manage,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::View => "view",
            PermissionLevel::Trade => "trade",
            PermissionLevel::Manage => "manage",
        }
    }

    /// Classify an action string by substring, first match wins:
    /// view/read, then trade/order, then manage/admin/delete. Defaults to view.
    pub fn for_action(action: &str) -> Self {
        let action = action.to_lowercase();
        let contains_any = |needles: &[&str]| needles.iter().any(|n| action.contains(n));

        if contains_any(&["view", "read"]) {
            PermissionLevel::View
        } else if contains_any(&["trade", "order"]) {
            PermissionLevel::Trade
        } else if contains_any(&["manage", "admin", "delete"]) {
            PermissionLevel::Manage
        } else {
            PermissionLevel::View
        }
    }
}

impl std::str::FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "view" => Ok(PermissionLevel::View),
            "trade" => Ok(PermissionLevel::Trade),
            "manage" => Ok(PermissionLevel::Manage),
            _ => Err(format!("Invalid permission level: {}", s)),
        }
    }
}

/// Membership row granting a non-owner access to a trading account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TradingAccountMembership {
    pub trading_account_id: i64,
    pub user_id: i64,
    pub role: Option<String>,
    pub can_view: bool,
    pub can_trade: bool,
    pub can_manage: bool,
}

impl TradingAccountMembership {
    pub fn allows(&self, level: PermissionLevel) -> bool {
        match level {
            PermissionLevel::View => self.can_view,
            PermissionLevel::Trade => self.can_trade,
            PermissionLevel::Manage => self.can_manage,
        }
    }
}

/// Where a trading account permission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessSource {
    Owner,
    Membership,
}

/// Answer of an explicit trading account permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradingAccountAccess {
    pub has_permission: bool,
    pub source: Option<AccessSource>,
    pub role: Option<String>,
}

impl TradingAccountAccess {
    pub fn owner() -> Self {
        Self {
            has_permission: true,
            source: Some(AccessSource::Owner),
            role: Some("owner".to_string()),
        }
    }

    pub fn none() -> Self {
        Self {
            has_permission: false,
            source: None,
            role: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_classification() {
        assert_eq!(PermissionLevel::for_action("account:view"), PermissionLevel::View);
        assert_eq!(PermissionLevel::for_action("positions:read"), PermissionLevel::View);
        assert_eq!(PermissionLevel::for_action("trade:place_order"), PermissionLevel::Trade);
        assert_eq!(PermissionLevel::for_action("order:cancel"), PermissionLevel::Trade);
        assert_eq!(PermissionLevel::for_action("account:manage"), PermissionLevel::Manage);
        assert_eq!(PermissionLevel::for_action("account:delete"), PermissionLevel::Manage);
        assert_eq!(PermissionLevel::for_action("ADMIN:settings"), PermissionLevel::Manage);
        assert_eq!(PermissionLevel::for_action("export"), PermissionLevel::View);
    }

    #[test]
    fn test_view_wins_over_trade() {
        // "trade:view_orders" mentions both; view is checked first.
        assert_eq!(
            PermissionLevel::for_action("trade:view_orders"),
            PermissionLevel::View
        );
    }

    #[test]
    fn test_membership_flags() {
        let membership = TradingAccountMembership {
            trading_account_id: 99,
            user_id: 42,
            role: Some("viewer".to_string()),
            can_view: true,
            can_trade: false,
            can_manage: false,
        };
        assert!(membership.allows(PermissionLevel::View));
        assert!(!membership.allows(PermissionLevel::Trade));
        assert!(!membership.allows(PermissionLevel::Manage));
    }
}
