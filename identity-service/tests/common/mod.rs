//! Shared setup for identity-service integration tests.
//!
//! Every store is an in-memory mock and tokens are HS256, so no Postgres or
//! Redis is needed.

#![allow(dead_code)]

use chrono::Utc;
use identity_service::{
    models::{User, UserState},
    services::{
        AccessAdminService, AuthService, AuthSettings, AuthorizationService, JwtService,
        LocalRateLimiter, MockAuditLog, MockDecisionCache, MockEventPublisher, MockPolicyStore,
        MockSessionStore, MockTradingAccountStore, MockUserRepository, SessionStore,
        TotpMfaVerifier,
    },
    utils::{Argon2Hasher, CredentialHasher, Password},
};
use std::sync::Arc;

pub const TEST_JWT_SECRET: &[u8] = b"integration-test-secret-0123456789";
pub const TEST_PASSWORD: &str = "Correct-Horse-42";

pub struct TestApp {
    pub users: Arc<MockUserRepository>,
    pub sessions: Arc<MockSessionStore>,
    pub jwt: Arc<JwtService>,
    pub hasher: Arc<Argon2Hasher>,
    pub accounts: Arc<MockTradingAccountStore>,
    pub policies: Arc<MockPolicyStore>,
    pub cache: Arc<MockDecisionCache>,
    pub audit: Arc<MockAuditLog>,
    pub events: Arc<MockEventPublisher>,
    pub auth: AuthService,
    pub authz: Arc<AuthorizationService>,
    pub admin: AccessAdminService,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_settings(AuthSettings::default())
    }

    pub fn with_settings(settings: AuthSettings) -> Self {
        Self::build(settings, |sessions| sessions as Arc<dyn SessionStore>)
    }

    /// Services see `wrap(sessions)`; `app.sessions` stays the bare mock
    /// for assertions.
    pub fn with_session_store<F>(wrap: F) -> Self
    where
        F: FnOnce(Arc<MockSessionStore>) -> Arc<dyn SessionStore>,
    {
        Self::build(AuthSettings::default(), wrap)
    }

    fn build<F>(settings: AuthSettings, wrap: F) -> Self
    where
        F: FnOnce(Arc<MockSessionStore>) -> Arc<dyn SessionStore>,
    {
        let users = Arc::new(MockUserRepository::new());
        let sessions = Arc::new(MockSessionStore::new());
        let session_store = wrap(sessions.clone());
        let jwt = Arc::new(JwtService::from_secret(TEST_JWT_SECRET, 15, 7));
        // Minimum Argon2 cost keeps the suite fast.
        let hasher = Arc::new(Argon2Hasher::with_params(8, 1, 1).expect("argon2 params"));
        let accounts = Arc::new(MockTradingAccountStore::new());
        let policies = Arc::new(MockPolicyStore::new());
        let cache = Arc::new(MockDecisionCache::new());
        let audit = Arc::new(MockAuditLog::new());
        let events = Arc::new(MockEventPublisher::new());

        let authz = Arc::new(AuthorizationService::new(
            policies.clone(),
            accounts.clone(),
            cache.clone(),
            300,
        ));

        let auth = AuthService::new(
            users.clone(),
            session_store.clone(),
            jwt.clone(),
            hasher.clone(),
            Arc::new(LocalRateLimiter::new()),
            Arc::new(TotpMfaVerifier::new(users.clone())),
            accounts.clone(),
            audit.clone(),
            events.clone(),
            settings,
        );

        let admin = AccessAdminService::new(
            users.clone(),
            accounts.clone(),
            session_store,
            authz.clone(),
            events.clone(),
        );

        Self {
            users,
            sessions,
            jwt,
            hasher,
            accounts,
            policies,
            cache,
            audit,
            events,
            auth,
            authz,
            admin,
        }
    }

    /// Insert a user whose password is `TEST_PASSWORD`.
    pub fn seed_user(&self, user_id: i64, email: &str, state: UserState) -> User {
        let hash = self
            .hasher
            .hash(&Password::new(TEST_PASSWORD.to_string()))
            .expect("hash test password");
        let user = User {
            user_id,
            email: email.to_string(),
            password_hash: Some(hash.into_string()),
            full_name: "Test Trader".to_string(),
            user_state_code: state.as_str().to_string(),
            mfa_enabled: false,
            totp_secret: None,
            backup_code_hashes: Vec::new(),
            preferences: serde_json::json!({}),
            last_login_utc: None,
            created_utc: Utc::now(),
        };
        self.users.insert_user(user.clone(), &["user"]);
        user
    }

    /// Insert a user with TOTP enrolled. Returns the user and the plain
    /// backup codes.
    pub fn seed_mfa_user(&self, user_id: i64, email: &str) -> (User, Vec<String>) {
        let enrollment = TotpMfaVerifier::enroll(email, 4).expect("enroll totp");
        let mut user = self.seed_user(user_id, email, UserState::Active);
        user.mfa_enabled = true;
        user.totp_secret = Some(enrollment.totp_secret);
        user.backup_code_hashes = enrollment.backup_code_hashes;
        self.users.insert_user(user.clone(), &["user"]);
        (user, enrollment.backup_codes)
    }
}
