//! Authentication orchestrator.
//!
//! Owns the login state machine: rate limiting, credential and status
//! checks, MFA enrollment and challenge, session creation, refresh token
//! rotation with reuse detection, and logout. Every authentication state
//! change, accepted or refused, is audited before the call returns; audit
//! failures are logged and dropped.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

use super::error::ServiceError;
use super::events::EventPublisher;
use super::jwt::{AccessGrant, TokenIssuer};
use super::metrics;
use super::mfa::{MfaVerifier, TotpMfaVerifier};
use super::password_policy::PasswordPolicy;
use super::rate_limiter::RateLimiter;
use super::session_store::SessionStore;
use super::trading_accounts::TradingAccountStore;
use super::audit::AuditLog;
use super::users::UserRepository;
use crate::config::IdentityConfig;
use crate::models::{
    user_subject, AuthEvent, AuthEventType, DomainEvent, EventType, NewUser,
    PendingMfaEnrollment, RefreshTokenRecord, RefreshTokenState, RegisterUserRequest, RiskScore,
    RotationOutcome, Session, User, UserState, UserSummary,
};
use crate::utils::{CredentialHasher, Password, PasswordHashString};

const BACKUP_CODE_COUNT: usize = 8;

/// Tunables the orchestrator reads from configuration.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub default_role: String,
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub inactivity_ttl_seconds: i64,
    pub mfa_pending_seconds: i64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            default_role: "user".to_string(),
            login_attempts: 5,
            login_window_seconds: 900,
            inactivity_ttl_seconds: 3600,
            mfa_pending_seconds: 600,
        }
    }
}

impl From<&IdentityConfig> for AuthSettings {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            default_role: config.registration.default_role.clone(),
            login_attempts: config.rate_limit.login_attempts,
            login_window_seconds: config.rate_limit.login_window_seconds,
            inactivity_ttl_seconds: config.inactivity_ttl_seconds(),
            mfa_pending_seconds: config.session.mfa_pending_seconds,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub persist_session: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MfaLoginRequest {
    pub session_token: String,
    pub code: String,
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub persist_session: bool,
}

/// Tokens and identity handed back after a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct AuthSession {
    pub access_token: String,
    /// Only issued for persistent sessions.
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
    pub session_id: String,
    pub user: UserSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    MfaRequired {
        session_token: String,
        methods: Vec<String>,
    },
    Authenticated(AuthSession),
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// TOTP material shown to the user once when enrollment starts.
#[derive(Debug, Clone, Serialize)]
pub struct MfaSetup {
    pub totp_secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

/// Caller identity resolved from a live access token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticatedPrincipal {
    pub user_id: i64,
    pub session_id: String,
    pub roles: Vec<String>,
    pub trading_account_ids: Vec<i64>,
    pub mfa_verified: bool,
}

impl AuthenticatedPrincipal {
    pub fn subject(&self) -> String {
        user_subject(self.user_id)
    }
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<dyn TokenIssuer>,
    hasher: Arc<dyn CredentialHasher>,
    rate_limiter: Arc<dyn RateLimiter>,
    mfa: Arc<dyn MfaVerifier>,
    trading_accounts: Arc<dyn TradingAccountStore>,
    audit: Arc<dyn AuditLog>,
    events: Arc<dyn EventPublisher>,
    settings: AuthSettings,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionStore>,
        tokens: Arc<dyn TokenIssuer>,
        hasher: Arc<dyn CredentialHasher>,
        rate_limiter: Arc<dyn RateLimiter>,
        mfa: Arc<dyn MfaVerifier>,
        trading_accounts: Arc<dyn TradingAccountStore>,
        audit: Arc<dyn AuditLog>,
        events: Arc<dyn EventPublisher>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            users,
            sessions,
            tokens,
            hasher,
            rate_limiter,
            mfa,
            trading_accounts,
            audit,
            events,
            settings,
        }
    }

    pub async fn register(&self, req: RegisterUserRequest) -> Result<UserSummary, ServiceError> {
        req.validate()?;

        let email = normalize_email(&req.email);
        let full_name = req.full_name.trim().to_string();

        PasswordPolicy::validate(&req.password, &email, &full_name)
            .map_err(|e| ServiceError::WeakPassword(e.to_string()))?;

        if self.users.find_by_email(&email).await?.is_some() {
            return Err(ServiceError::DuplicateEmail);
        }

        let password_hash = self
            .hasher
            .hash(&Password::new(req.password))
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e)))?;

        let user = self
            .users
            .create_user(
                &NewUser {
                    email,
                    password_hash: Some(password_hash.into_string()),
                    full_name,
                    state: UserState::PendingVerification,
                },
                &self.settings.default_role,
            )
            .await?;

        tracing::info!(user_id = user.user_id, "User registered");

        self.events
            .publish(DomainEvent::new(
                EventType::UserRegistered,
                Some(user.user_id),
                json!({ "email": user.email, "role": self.settings.default_role }),
            ))
            .await;

        Ok(user.summary())
    }

    pub async fn login(&self, req: LoginRequest) -> Result<LoginOutcome, ServiceError> {
        let email = normalize_email(&req.email);
        let ip = req.ip_address.as_deref();

        let limit = self
            .rate_limiter
            .check(
                &format!("login:{}", email),
                self.settings.login_attempts,
                self.settings.login_window_seconds,
            )
            .await
            .map_err(ServiceError::SessionStore)?;

        if !limit.allowed {
            tracing::warn!(ip = ip.unwrap_or("-"), "Login rate limit exceeded");
            self.audit_event(
                AuthEvent::new(AuthEventType::LoginRateLimited)
                    .ip(ip)
                    .metadata(json!({ "email": email })),
            )
            .await;
            metrics::record_login("rate_limited");
            return Err(ServiceError::RateLimited {
                retry_after_seconds: limit.retry_after_seconds,
            });
        }

        let Some(user) = self.users.find_by_email(&email).await? else {
            self.audit_event(
                AuthEvent::new(AuthEventType::LoginFailed)
                    .ip(ip)
                    .metadata(json!({ "email": email, "reason": "unknown_email" })),
            )
            .await;
            metrics::record_login("failed");
            return Err(ServiceError::InvalidCredentials);
        };

        if let Err(reason) = self.check_password(&user, &req.password) {
            self.audit_event(
                AuthEvent::new(AuthEventType::LoginFailed)
                    .user(user.user_id)
                    .ip(ip)
                    .metadata(json!({ "email": email, "reason": reason })),
            )
            .await;
            metrics::record_login("failed");
            return Err(ServiceError::InvalidCredentials);
        }

        if let Some((err, reason)) = login_block(&user) {
            self.audit_event(
                AuthEvent::new(AuthEventType::LoginFailed)
                    .user(user.user_id)
                    .ip(ip)
                    .metadata(json!({ "email": email, "reason": reason })),
            )
            .await;
            metrics::record_login("blocked");
            return Err(err);
        }

        if user.mfa_enabled {
            let session_token = uuid::Uuid::new_v4().to_string();
            self.sessions
                .put_mfa_pending(&session_token, user.user_id, self.settings.mfa_pending_seconds)
                .await
                .map_err(ServiceError::SessionStore)?;

            self.audit_event(
                AuthEvent::new(AuthEventType::MfaChallengeIssued)
                    .user(user.user_id)
                    .ip(ip),
            )
            .await;
            metrics::record_login("mfa_required");

            return Ok(LoginOutcome::MfaRequired {
                session_token,
                methods: vec!["totp".to_string()],
            });
        }

        let session = self
            .create_session(
                &user,
                req.device_fingerprint,
                req.ip_address,
                req.persist_session,
                false,
            )
            .await?;
        Ok(LoginOutcome::Authenticated(session))
    }

    /// Complete a login that was answered with an MFA challenge.
    pub async fn verify_mfa_and_login(&self, req: MfaLoginRequest) -> Result<AuthSession, ServiceError> {
        let ip = req.ip_address.as_deref();

        let Some(user_id) = self
            .sessions
            .get_mfa_pending(&req.session_token)
            .await
            .map_err(ServiceError::SessionStore)?
        else {
            self.audit_event(
                AuthEvent::new(AuthEventType::MfaFailed)
                    .ip(ip)
                    .metadata(json!({ "reason": "unknown_challenge" })),
            )
            .await;
            return Err(ServiceError::InvalidOrExpiredToken);
        };

        let Some(user) = self.users.find_by_id(user_id).await? else {
            self.audit_event(
                AuthEvent::new(AuthEventType::MfaFailed)
                    .user(user_id)
                    .ip(ip)
                    .metadata(json!({ "reason": "unknown_user" })),
            )
            .await;
            return Err(ServiceError::InvalidOrExpiredToken);
        };

        if let Some((err, reason)) = login_block(&user) {
            self.audit_event(
                AuthEvent::new(AuthEventType::MfaFailed)
                    .user(user_id)
                    .ip(ip)
                    .metadata(json!({ "reason": reason })),
            )
            .await;
            metrics::record_login("blocked");
            return Err(err);
        }

        // Six digit codes need their own attempt budget.
        let limit = self
            .rate_limiter
            .check(
                &format!("mfa:{}", req.session_token),
                self.settings.login_attempts,
                self.settings.login_window_seconds,
            )
            .await
            .map_err(ServiceError::SessionStore)?;
        if !limit.allowed {
            tracing::warn!(user_id, "MFA attempt limit exceeded");
            self.audit_event(
                AuthEvent::new(AuthEventType::MfaRateLimited)
                    .user(user_id)
                    .ip(ip),
            )
            .await;
            metrics::record_login("mfa_rate_limited");
            return Err(ServiceError::RateLimited {
                retry_after_seconds: limit.retry_after_seconds,
            });
        }

        let verification = self.mfa.verify_totp(&user, &req.code, true).await?;
        let Some(method) = verification.method.filter(|_| verification.ok) else {
            self.audit_event(
                AuthEvent::new(AuthEventType::MfaFailed)
                    .user(user_id)
                    .ip(ip)
                    .metadata(json!({ "reason": "invalid_code" })),
            )
            .await;
            metrics::record_login("mfa_failed");
            return Err(ServiceError::InvalidMfaCode);
        };

        self.sessions
            .delete_mfa_pending(&req.session_token)
            .await
            .map_err(ServiceError::SessionStore)?;

        tracing::info!(user_id, method = method.as_str(), "MFA verified");

        self.create_session(
            &user,
            req.device_fingerprint,
            req.ip_address,
            req.persist_session,
            true,
        )
        .await
    }

    /// Start TOTP enrollment. The new secret and backup codes stay pending
    /// until `confirm_mfa_enrollment` sees a valid code from them; starting
    /// again replaces the pending material.
    pub async fn begin_mfa_enrollment(&self, user_id: i64) -> Result<MfaSetup, ServiceError> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(ServiceError::InvalidOrExpiredToken)?;
        if let Some((err, _)) = login_block(&user) {
            return Err(err);
        }
        if user.mfa_enabled {
            return Err(ServiceError::MfaAlreadyEnabled);
        }

        let enrollment = TotpMfaVerifier::enroll(&user.email, BACKUP_CODE_COUNT)?;
        self.sessions
            .put_mfa_enrollment(
                user_id,
                &PendingMfaEnrollment {
                    totp_secret: enrollment.totp_secret.clone(),
                    backup_code_hashes: enrollment.backup_code_hashes,
                },
                self.settings.mfa_pending_seconds,
            )
            .await
            .map_err(ServiceError::SessionStore)?;

        self.audit_event(AuthEvent::new(AuthEventType::MfaEnrollmentStarted).user(user_id))
            .await;

        Ok(MfaSetup {
            totp_secret: enrollment.totp_secret,
            provisioning_uri: enrollment.provisioning_uri,
            backup_codes: enrollment.backup_codes,
        })
    }

    /// Turn MFA on once the user proves their authenticator holds the
    /// pending secret.
    pub async fn confirm_mfa_enrollment(&self, user_id: i64, code: &str) -> Result<(), ServiceError> {
        let pending = self
            .sessions
            .get_mfa_enrollment(user_id)
            .await
            .map_err(ServiceError::SessionStore)?
            .ok_or(ServiceError::InvalidOrExpiredToken)?;
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(ServiceError::InvalidOrExpiredToken)?;

        let limit = self
            .rate_limiter
            .check(
                &format!("mfa_enroll:{}", user_id),
                self.settings.login_attempts,
                self.settings.login_window_seconds,
            )
            .await
            .map_err(ServiceError::SessionStore)?;
        if !limit.allowed {
            self.audit_event(AuthEvent::new(AuthEventType::MfaRateLimited).user(user_id))
                .await;
            return Err(ServiceError::RateLimited {
                retry_after_seconds: limit.retry_after_seconds,
            });
        }

        // Backup codes are not accepted until enrollment completes.
        let mut candidate = user.clone();
        candidate.totp_secret = Some(pending.totp_secret.clone());
        let verification = self.mfa.verify_totp(&candidate, code, false).await?;
        if !verification.ok {
            self.audit_event(
                AuthEvent::new(AuthEventType::MfaFailed)
                    .user(user_id)
                    .metadata(json!({ "reason": "enrollment_code_invalid" })),
            )
            .await;
            return Err(ServiceError::InvalidMfaCode);
        }

        self.users
            .enable_mfa(user_id, &pending.totp_secret, &pending.backup_code_hashes)
            .await?;
        self.sessions
            .delete_mfa_enrollment(user_id)
            .await
            .map_err(ServiceError::SessionStore)?;

        tracing::info!(user_id, "MFA enabled");
        self.audit_event(AuthEvent::new(AuthEventType::MfaEnabled).user(user_id))
            .await;

        Ok(())
    }

    /// Store a session and mint its tokens. Persistent sessions also get a
    /// refresh token and live as long as it does.
    pub async fn create_session(
        &self,
        user: &User,
        device_fingerprint: Option<String>,
        ip_address: Option<String>,
        persist: bool,
        mfa_verified: bool,
    ) -> Result<AuthSession, ServiceError> {
        let roles = self.users.roles_for_user(user.user_id).await?;
        let trading_account_ids = self.trading_accounts.active_account_ids(user.user_id).await?;

        let session = Session::new(user.user_id, device_fingerprint, ip_address, mfa_verified, persist);
        self.sessions
            .put_session(&session, self.session_ttl_seconds(persist))
            .await
            .map_err(ServiceError::SessionStore)?;

        let access_token = self
            .tokens
            .issue_access_token(&AccessGrant {
                user_id: user.user_id,
                session_id: session.session_id.clone(),
                roles,
                trading_account_ids,
                mfa_verified,
            })
            .map_err(ServiceError::Internal)?;

        let refresh_token = if persist {
            let record = RefreshTokenRecord::new(
                user.user_id,
                session.session_id.clone(),
                self.tokens.refresh_token_expiry_days(),
            );
            self.sessions
                .put_refresh_record(&record)
                .await
                .map_err(ServiceError::SessionStore)?;
            Some(self.tokens.issue_refresh_token(&record).map_err(ServiceError::Internal)?)
        } else {
            None
        };

        self.users.record_login(user.user_id).await?;

        tracing::info!(
            user_id = user.user_id,
            session_id = %session.session_id,
            persistent = persist,
            mfa_verified,
            "Session created"
        );

        self.events
            .publish(DomainEvent::new(
                EventType::LoginSuccess,
                Some(user.user_id),
                json!({ "session_id": session.session_id, "mfa_verified": mfa_verified }),
            ))
            .await;
        self.audit_event(
            AuthEvent::new(AuthEventType::LoginSuccess)
                .user(user.user_id)
                .ip(session.ip_address.as_deref())
                .session(&session.session_id)
                .metadata(json!({ "persistent": persist, "mfa_verified": mfa_verified })),
        )
        .await;
        metrics::record_login("success");

        let mut summary = user.summary();
        if user.state() == UserState::PendingVerification {
            summary.user_state_code = UserState::Active.as_str().to_string();
        }

        Ok(AuthSession {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.tokens.access_token_expiry_seconds(),
            session_id: session.session_id,
            user: summary,
        })
    }

    /// Rotate a refresh token. Presenting an already rotated token revokes
    /// its session and fails with `ReuseDetected`.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenPair, ServiceError> {
        let claims = match self.tokens.validate_refresh_token(refresh_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "Refresh token failed validation");
                return Err(self.reject_refresh("invalid_token", None).await);
            }
        };

        let Some(record) = self
            .sessions
            .get_refresh_record(&claims.jti)
            .await
            .map_err(ServiceError::SessionStore)?
            .filter(|r| claims.user_id() == Some(r.user_id) && r.session_id == claims.sid)
        else {
            return Err(self.reject_refresh("unknown_token", None).await);
        };

        match record.state() {
            RefreshTokenState::Active => {}
            RefreshTokenState::RotatedTo(next) => return Err(self.revoke_reused_family(&record, &next).await),
            RefreshTokenState::Expired => return Err(self.reject_refresh("expired", Some(&record)).await),
        }

        let Some(session) = self
            .sessions
            .get_session(&record.session_id)
            .await
            .map_err(ServiceError::SessionStore)?
        else {
            // Session ended (logout or revocation): the family is dead.
            self.sessions
                .delete_refresh_record(&record.jti)
                .await
                .map_err(ServiceError::SessionStore)?;
            return Err(self.reject_refresh("session_ended", Some(&record)).await);
        };

        let Some(user) = self.users.find_by_id(record.user_id).await? else {
            return Err(self.reject_refresh("unknown_user", Some(&record)).await);
        };
        if let Some((err, reason)) = login_block(&user) {
            self.reject_refresh(reason, Some(&record)).await;
            return Err(err);
        }

        let roles = self.users.roles_for_user(user.user_id).await?;
        let trading_account_ids = self.trading_accounts.active_account_ids(user.user_id).await?;

        let successor = record.successor(self.tokens.refresh_token_expiry_days());
        let access_token = self
            .tokens
            .issue_access_token(&AccessGrant {
                user_id: user.user_id,
                session_id: session.session_id.clone(),
                roles,
                trading_account_ids,
                mfa_verified: session.mfa_verified,
            })
            .map_err(ServiceError::Internal)?;
        let new_refresh_token = self
            .tokens
            .issue_refresh_token(&successor)
            .map_err(ServiceError::Internal)?;

        match self
            .sessions
            .rotate_refresh_record(&record.jti, &successor)
            .await
            .map_err(ServiceError::SessionStore)?
        {
            RotationOutcome::Rotated => {}
            RotationOutcome::AlreadyRotated(next) => {
                return Err(self.revoke_reused_family(&record, &next).await)
            }
            RotationOutcome::Missing => {
                return Err(self.reject_refresh("rotation_missing", Some(&record)).await)
            }
        }

        let touched = self
            .sessions
            .touch_session(&session, self.session_ttl_seconds(session.persistent))
            .await
            .map_err(ServiceError::SessionStore)?;
        if !touched {
            tracing::warn!(session_id = %session.session_id, "Session vanished during refresh");
        }

        tracing::info!(user_id = user.user_id, session_id = %session.session_id, "Refresh token rotated");

        self.audit_event(
            AuthEvent::new(AuthEventType::TokenRefreshed)
                .user(user.user_id)
                .ip(session.ip_address.as_deref())
                .session(&session.session_id)
                .metadata(json!({ "parent_jti": record.jti, "jti": successor.jti })),
        )
        .await;
        self.events
            .publish(DomainEvent::new(
                EventType::TokenRefreshed,
                Some(user.user_id),
                json!({ "session_id": session.session_id }),
            ))
            .await;
        metrics::record_refresh("rotated");

        Ok(TokenPair {
            access_token,
            refresh_token: new_refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.tokens.access_token_expiry_seconds(),
        })
    }

    /// End one session, or every session of the user when `all_devices`.
    /// Returns the number of sessions removed.
    pub async fn logout(
        &self,
        session_id: &str,
        user_id: i64,
        all_devices: bool,
    ) -> Result<usize, ServiceError> {
        let removed = if all_devices {
            self.sessions
                .delete_user_sessions(user_id)
                .await
                .map_err(ServiceError::SessionStore)?
        } else {
            let owned = self
                .sessions
                .get_session(session_id)
                .await
                .map_err(ServiceError::SessionStore)?
                .is_some_and(|s| s.user_id == user_id);
            if owned {
                usize::from(
                    self.sessions
                        .delete_session(user_id, session_id)
                        .await
                        .map_err(ServiceError::SessionStore)?,
                )
            } else {
                0
            }
        };

        tracing::info!(user_id, session_id, all_devices, removed, "User logged out");

        self.events
            .publish(DomainEvent::new(
                EventType::SessionRevoked,
                Some(user_id),
                json!({
                    "reason": "logout",
                    "session_id": session_id,
                    "all_devices": all_devices,
                }),
            ))
            .await;
        self.audit_event(
            AuthEvent::new(AuthEventType::Logout)
                .user(user_id)
                .session(session_id)
                .metadata(json!({ "all_devices": all_devices, "removed": removed })),
        )
        .await;

        Ok(removed)
    }

    /// Resolve an access token to its caller. The token's session must
    /// still exist, so logout and revocation cut outstanding tokens off.
    pub async fn authenticate(&self, access_token: &str) -> Result<AuthenticatedPrincipal, ServiceError> {
        let claims = self
            .tokens
            .validate_access_token(access_token)
            .map_err(|_| ServiceError::InvalidOrExpiredToken)?;
        let user_id = claims.user_id().ok_or(ServiceError::InvalidOrExpiredToken)?;

        let session = self
            .sessions
            .get_session(&claims.sid)
            .await
            .map_err(ServiceError::SessionStore)?
            .filter(|s| s.user_id == user_id)
            .ok_or(ServiceError::InvalidOrExpiredToken)?;

        Ok(AuthenticatedPrincipal {
            user_id,
            session_id: session.session_id,
            roles: claims.roles,
            trading_account_ids: claims.trading_account_ids,
            mfa_verified: claims.mfa_verified,
        })
    }

    pub async fn list_sessions(&self, user_id: i64) -> Result<Vec<Session>, ServiceError> {
        self.sessions
            .list_user_sessions(user_id)
            .await
            .map_err(ServiceError::SessionStore)
    }

    fn session_ttl_seconds(&self, persistent: bool) -> i64 {
        if persistent {
            self.tokens.refresh_token_expiry_days() * 86_400
        } else {
            self.settings.inactivity_ttl_seconds
        }
    }

    /// Err carries the audit reason.
    fn check_password(&self, user: &User, password: &str) -> Result<(), &'static str> {
        let Some(hash) = user.password_hash.as_deref() else {
            return Err("no_password");
        };
        self.hasher
            .verify(
                &Password::new(password.to_string()),
                &PasswordHashString::new(hash.to_string()),
            )
            .map_err(|_| "invalid_password")
    }

    /// Audit a refused refresh and return the error the caller sees.
    async fn reject_refresh(&self, reason: &'static str, record: Option<&RefreshTokenRecord>) -> ServiceError {
        let event = match record {
            Some(record) => AuthEvent::new(AuthEventType::RefreshFailed)
                .user(record.user_id)
                .session(&record.session_id)
                .metadata(json!({ "reason": reason, "jti": record.jti })),
            None => AuthEvent::new(AuthEventType::RefreshFailed).metadata(json!({ "reason": reason })),
        };
        self.audit_event(event).await;
        metrics::record_refresh("invalid");
        ServiceError::InvalidRefreshToken
    }

    async fn revoke_reused_family(&self, record: &RefreshTokenRecord, rotated_to: &str) -> ServiceError {
        tracing::warn!(
            user_id = record.user_id,
            session_id = %record.session_id,
            jti = %record.jti,
            "Refresh token reuse detected, revoking session"
        );

        if let Err(e) = self.sessions.delete_session(record.user_id, &record.session_id).await {
            tracing::error!(session_id = %record.session_id, error = %e, "Failed to revoke session after reuse");
        }
        if let Err(e) = self.sessions.delete_refresh_record(&record.jti).await {
            tracing::error!(jti = %record.jti, error = %e, "Failed to delete reused refresh token");
        }

        self.audit_event(
            AuthEvent::new(AuthEventType::RefreshReuseDetected)
                .user(record.user_id)
                .session(&record.session_id)
                .risk(RiskScore::High)
                .metadata(json!({ "jti": record.jti, "rotated_to": rotated_to })),
        )
        .await;
        self.events
            .publish(DomainEvent::new(
                EventType::RefreshReuseDetected,
                Some(record.user_id),
                json!({ "session_id": record.session_id, "jti": record.jti }),
            ))
            .await;
        metrics::record_refresh("reuse_detected");

        ServiceError::ReuseDetected
    }

    async fn audit_event(&self, event: AuthEvent) {
        if let Err(e) = self.audit.record(&event).await {
            tracing::warn!(event_type = event.event_type.as_str(), error = %e, "Failed to record audit event");
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Error and audit reason when the account may not sign in.
fn login_block(user: &User) -> Option<(ServiceError, &'static str)> {
    match user.state() {
        UserState::Deactivated => Some((ServiceError::AccountDeactivated, "account_deactivated")),
        UserState::Suspended => Some((ServiceError::AccountSuspended, "account_suspended")),
        UserState::PendingVerification | UserState::Active => None,
    }
}
