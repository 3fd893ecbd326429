//! Policy decision point.
//!
//! A check resolves, in order: the decision cache, trading account
//! ownership and membership, then the enabled policies. Deny overrides
//! allow among policies whose patterns and conditions match; nothing
//! matching is a `default_deny` decision, not an error.

pub mod cache;
pub mod conditions;
pub mod pattern;

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use self::cache::{cache_key, invalidation_pattern, DecisionCache};
use self::conditions::conditions_hold;
use self::pattern::PatternMatcher;
use super::error::ServiceError;
use super::metrics;
use super::policy_store::PolicyStore;
use super::trading_accounts::TradingAccountStore;
use crate::models::{
    AccessSource, PermissionLevel, Policy, PolicyContext, PolicyEffect, TradingAccountAccess,
};

pub const OWNER_POLICY: &str = "Trading Account Owner";
pub const MEMBERSHIP_POLICY: &str = "Trading Account Membership";
pub const INSUFFICIENT_MEMBERSHIP_POLICY: &str = "Insufficient Membership Permissions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    DefaultDeny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::DefaultDeny => "default_deny",
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Decision::Allow),
            "deny" => Ok(Decision::Deny),
            "default_deny" => Ok(Decision::DefaultDeny),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthzDecision {
    pub allowed: bool,
    pub decision: Decision,
    pub matched_policy: Option<String>,
}

impl AuthzDecision {
    pub fn allow(policy: impl Into<String>) -> Self {
        Self {
            allowed: true,
            decision: Decision::Allow,
            matched_policy: Some(policy.into()),
        }
    }

    pub fn deny(policy: Option<String>) -> Self {
        Self {
            allowed: false,
            decision: Decision::Deny,
            matched_policy: policy,
        }
    }

    pub fn default_deny() -> Self {
        Self {
            allowed: false,
            decision: Decision::DefaultDeny,
            matched_policy: None,
        }
    }

    /// Cache encoding: `"<decision>:<policy name or empty>"`.
    pub fn to_cache_value(&self) -> String {
        format!(
            "{}:{}",
            self.decision.as_str(),
            self.matched_policy.as_deref().unwrap_or("")
        )
    }

    pub fn from_cache_value(value: &str) -> Option<Self> {
        let mut parts = value.splitn(2, ':');
        let decision: Decision = parts.next()?.parse().ok()?;
        let matched_policy = parts.next().filter(|p| !p.is_empty()).map(str::to_string);
        Some(Self {
            allowed: decision == Decision::Allow,
            decision,
            matched_policy,
        })
    }
}

/// A `"<type>:<id>"` identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier<'a> {
    pub kind: &'a str,
    pub id: &'a str,
}

pub fn parse_identifier(value: &str) -> Result<Identifier<'_>, ServiceError> {
    match value.split_once(':') {
        Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(Identifier { kind, id }),
        _ => Err(ServiceError::MalformedIdentifier(format!(
            "expected <type>:<id>, got {:?}",
            value
        ))),
    }
}

fn numeric_id(identifier: &Identifier<'_>) -> Result<i64, ServiceError> {
    identifier.id.parse().map_err(|_| {
        ServiceError::MalformedIdentifier(format!(
            "{} id must be numeric, got {:?}",
            identifier.kind, identifier.id
        ))
    })
}

/// Evaluate policies already ordered by priority, highest first.
pub fn evaluate_policies(
    matcher: &PatternMatcher,
    policies: &[Policy],
    subject: &str,
    action: &str,
    resource: &str,
    context: Option<&PolicyContext>,
) -> AuthzDecision {
    let applicable: Vec<&Policy> = policies
        .iter()
        .filter(|p| {
            matcher.matches_any(&p.subjects, subject)
                && matcher.matches_any(&p.actions, action)
                && matcher.matches_any(&p.resources, resource)
        })
        .collect();

    if applicable.is_empty() {
        return AuthzDecision::default_deny();
    }

    let empty = PolicyContext::new();
    let context = context.unwrap_or(&empty);
    let mut first_allow: Option<&Policy> = None;

    for policy in applicable {
        if !conditions_hold(&policy.conditions, context) {
            continue;
        }
        match policy.effect {
            PolicyEffect::Deny => return AuthzDecision::deny(Some(policy.name.clone())),
            PolicyEffect::Allow => {
                first_allow.get_or_insert(policy);
            }
        }
    }

    match first_allow {
        Some(policy) => AuthzDecision::allow(policy.name.clone()),
        None => AuthzDecision::default_deny(),
    }
}

pub struct AuthorizationService {
    policies: Arc<dyn PolicyStore>,
    trading_accounts: Arc<dyn TradingAccountStore>,
    cache: Arc<dyn DecisionCache>,
    matcher: PatternMatcher,
    cache_ttl_seconds: u64,
}

impl AuthorizationService {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        trading_accounts: Arc<dyn TradingAccountStore>,
        cache: Arc<dyn DecisionCache>,
        cache_ttl_seconds: u64,
    ) -> Self {
        Self {
            policies,
            trading_accounts,
            cache,
            matcher: PatternMatcher::new(),
            cache_ttl_seconds,
        }
    }

    /// Decide whether `subject` may perform `action` on `resource`.
    ///
    /// Errors only for malformed identifiers and store failures.
    pub async fn check_permission(
        &self,
        subject: &str,
        action: &str,
        resource: &str,
        context: Option<&PolicyContext>,
        use_cache: bool,
    ) -> Result<AuthzDecision, ServiceError> {
        let started = Instant::now();
        let key = cache_key(subject, resource, action);

        if use_cache {
            if let Some(decision) = self.cached_decision(&key).await {
                metrics::record_authz(decision.decision.as_str(), true, started.elapsed().as_secs_f64());
                return Ok(decision);
            }
        }

        let subject_id = parse_identifier(subject)?;
        let resource_id = parse_identifier(resource)?;

        if subject_id.kind == "user" && resource_id.kind == "trading_account" {
            if let Some(decision) = self
                .trading_account_decision(numeric_id(&subject_id)?, numeric_id(&resource_id)?, action)
                .await?
            {
                metrics::record_authz(decision.decision.as_str(), false, started.elapsed().as_secs_f64());
                return Ok(decision);
            }
        }

        let policies = self.policies.list_enabled().await?;
        let decision = evaluate_policies(&self.matcher, &policies, subject, action, resource, context);

        tracing::debug!(
            subject,
            action,
            resource,
            decision = decision.decision.as_str(),
            policy = decision.matched_policy.as_deref().unwrap_or(""),
            "Permission evaluated"
        );

        if use_cache {
            self.store_decision(&key, &decision).await;
        }

        metrics::record_authz(decision.decision.as_str(), false, started.elapsed().as_secs_f64());
        Ok(decision)
    }

    /// `check_permission` that never fails: any error becomes a deny.
    pub async fn authorize(
        &self,
        subject: &str,
        action: &str,
        resource: &str,
        context: Option<&PolicyContext>,
    ) -> AuthzDecision {
        match self.check_permission(subject, action, resource, context, true).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(subject, action, resource, error = %e, "Permission check failed, denying");
                AuthzDecision::deny(None)
            }
        }
    }

    /// Drop cached decisions. No arguments flushes the whole cache.
    pub async fn invalidate_cache(
        &self,
        subject: Option<&str>,
        action: Option<&str>,
        resource: Option<&str>,
    ) -> Result<usize, ServiceError> {
        let pattern = invalidation_pattern(subject, action, resource);
        let removed = self
            .cache
            .delete_matching(&pattern)
            .await
            .map_err(ServiceError::SessionStore)?;
        tracing::info!(pattern = %pattern, removed, "Authorization cache invalidated");
        Ok(removed)
    }

    /// Ownership or membership answer for one account, bypassing the cache.
    pub async fn check_trading_account_permission(
        &self,
        user_id: i64,
        trading_account_id: i64,
        permission: PermissionLevel,
    ) -> Result<TradingAccountAccess, ServiceError> {
        if self.trading_accounts.find_owner(trading_account_id).await? == Some(user_id) {
            return Ok(TradingAccountAccess::owner());
        }

        let Some(membership) = self
            .trading_accounts
            .find_membership(trading_account_id, user_id)
            .await?
        else {
            return Ok(TradingAccountAccess::none());
        };

        Ok(TradingAccountAccess {
            has_permission: membership.allows(permission),
            source: Some(AccessSource::Membership),
            role: membership.role,
        })
    }

    async fn trading_account_decision(
        &self,
        user_id: i64,
        trading_account_id: i64,
        action: &str,
    ) -> Result<Option<AuthzDecision>, ServiceError> {
        if self.trading_accounts.find_owner(trading_account_id).await? == Some(user_id) {
            return Ok(Some(AuthzDecision::allow(OWNER_POLICY)));
        }

        let membership = self
            .trading_accounts
            .find_membership(trading_account_id, user_id)
            .await?;

        Ok(membership.map(|m| {
            if m.allows(PermissionLevel::for_action(action)) {
                AuthzDecision::allow(MEMBERSHIP_POLICY)
            } else {
                AuthzDecision::deny(Some(INSUFFICIENT_MEMBERSHIP_POLICY.to_string()))
            }
        }))
    }

    /// Read failures count as a miss.
    async fn cached_decision(&self, key: &str) -> Option<AuthzDecision> {
        match self.cache.get(key).await {
            Ok(Some(value)) => {
                let decision = AuthzDecision::from_cache_value(&value);
                if decision.is_none() {
                    tracing::warn!(key, value = %value, "Ignoring malformed cached decision");
                }
                decision
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Decision cache read failed");
                None
            }
        }
    }

    async fn store_decision(&self, key: &str, decision: &AuthzDecision) {
        if let Err(e) = self
            .cache
            .set(key, &decision.to_cache_value(), self.cache_ttl_seconds)
            .await
        {
            tracing::warn!(key, error = %e, "Decision cache write failed");
        }
    }
}
