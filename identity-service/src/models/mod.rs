pub mod audit_event;
pub mod domain_event;
pub mod policy;
pub mod refresh_token;
pub mod session;
pub mod trading_account;
pub mod user;

pub use audit_event::{AuthEvent, AuthEventType, RiskScore};
pub use domain_event::{DomainEvent, EventType};
pub use policy::{
    Condition, ConditionOperator, Policy, PolicyContext, PolicyDocument, PolicyEffect, PolicyRow,
};
pub use refresh_token::{RefreshTokenRecord, RefreshTokenState, RotationOutcome};
pub use session::{PendingMfaEnrollment, Session};
pub use trading_account::{
    AccessSource, PermissionLevel, TradingAccountAccess, TradingAccountMembership,
};
pub use user::{user_subject, NewUser, RegisterUserRequest, User, UserState, UserSummary};
