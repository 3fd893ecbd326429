//! Services layer for the identity core.
//!
//! Store seams are traits with Postgres or Redis implementations and an
//! in-memory `Mock*` twin for tests. Services receive them as `Arc<dyn _>`.

pub mod access_admin;
pub mod audit;
pub mod auth;
pub mod authz;
pub mod error;
pub mod events;
pub mod jwt;
pub mod metrics;
pub mod mfa;
pub mod password_policy;
pub mod policy_store;
pub mod rate_limiter;
pub mod redis;
pub mod session_store;
pub mod trading_accounts;
pub mod users;

pub use access_admin::AccessAdminService;
pub use audit::{AuditLog, MockAuditLog, PgAuditLog};
pub use auth::{
    AuthService, AuthSession, AuthSettings, AuthenticatedPrincipal, LoginOutcome, LoginRequest,
    MfaLoginRequest, MfaSetup, TokenPair,
};
pub use authz::cache::{DecisionCache, MockDecisionCache};
pub use authz::{AuthorizationService, AuthzDecision, Decision};
pub use error::ServiceError;
pub use events::{EventPublisher, MockEventPublisher};
pub use jwt::{AccessGrant, AccessTokenClaims, JwtService, RefreshTokenClaims, SigningKey, TokenIssuer};
pub use mfa::{MfaMethod, MfaVerification, MfaVerifier, TotpMfaVerifier};
pub use password_policy::{PasswordPolicy, PasswordPolicyError};
pub use policy_store::{MockPolicyStore, PgPolicyStore, PolicyStore};
pub use rate_limiter::{LocalRateLimiter, RateLimitDecision, RateLimiter};
pub use redis::RedisService;
pub use session_store::{MockSessionStore, SessionStore};
pub use trading_accounts::{MockTradingAccountStore, PgTradingAccountStore, TradingAccountStore};
pub use users::{MockUserRepository, PgUserRepository, UserRepository};
