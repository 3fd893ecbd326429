mod common;

use async_trait::async_trait;
use common::{TestApp, TEST_PASSWORD};
use identity_service::models::{
    AuthEventType, EventType, PendingMfaEnrollment, RefreshTokenRecord, RiskScore,
    RotationOutcome, Session, UserState,
};
use identity_service::services::{
    AuthSession, LoginOutcome, LoginRequest, MockSessionStore, ServiceError, SessionStore,
    TokenIssuer,
};
use std::sync::Arc;

/// Yields to the scheduler right after reading a refresh record, so two
/// refreshes joined on one task both read it before either rotates.
struct InterleavingStore {
    inner: Arc<MockSessionStore>,
}

#[async_trait]
impl SessionStore for InterleavingStore {
    async fn put_session(&self, session: &Session, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        self.inner.put_session(session, ttl_seconds).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, anyhow::Error> {
        self.inner.get_session(session_id).await
    }

    async fn touch_session(&self, session: &Session, ttl_seconds: i64) -> Result<bool, anyhow::Error> {
        self.inner.touch_session(session, ttl_seconds).await
    }

    async fn delete_session(&self, user_id: i64, session_id: &str) -> Result<bool, anyhow::Error> {
        self.inner.delete_session(user_id, session_id).await
    }

    async fn list_user_sessions(&self, user_id: i64) -> Result<Vec<Session>, anyhow::Error> {
        self.inner.list_user_sessions(user_id).await
    }

    async fn delete_user_sessions(&self, user_id: i64) -> Result<usize, anyhow::Error> {
        self.inner.delete_user_sessions(user_id).await
    }

    async fn put_refresh_record(&self, record: &RefreshTokenRecord) -> Result<(), anyhow::Error> {
        self.inner.put_refresh_record(record).await
    }

    async fn get_refresh_record(
        &self,
        jti: &str,
    ) -> Result<Option<RefreshTokenRecord>, anyhow::Error> {
        let record = self.inner.get_refresh_record(jti).await;
        tokio::task::yield_now().await;
        record
    }

    async fn delete_refresh_record(&self, jti: &str) -> Result<(), anyhow::Error> {
        self.inner.delete_refresh_record(jti).await
    }

    async fn rotate_refresh_record(
        &self,
        old_jti: &str,
        successor: &RefreshTokenRecord,
    ) -> Result<RotationOutcome, anyhow::Error> {
        self.inner.rotate_refresh_record(old_jti, successor).await
    }

    async fn put_mfa_pending(&self, token: &str, user_id: i64, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        self.inner.put_mfa_pending(token, user_id, ttl_seconds).await
    }

    async fn get_mfa_pending(&self, token: &str) -> Result<Option<i64>, anyhow::Error> {
        self.inner.get_mfa_pending(token).await
    }

    async fn delete_mfa_pending(&self, token: &str) -> Result<(), anyhow::Error> {
        self.inner.delete_mfa_pending(token).await
    }

    async fn put_mfa_enrollment(
        &self,
        user_id: i64,
        enrollment: &PendingMfaEnrollment,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        self.inner.put_mfa_enrollment(user_id, enrollment, ttl_seconds).await
    }

    async fn get_mfa_enrollment(&self, user_id: i64) -> Result<Option<PendingMfaEnrollment>, anyhow::Error> {
        self.inner.get_mfa_enrollment(user_id).await
    }

    async fn delete_mfa_enrollment(&self, user_id: i64) -> Result<(), anyhow::Error> {
        self.inner.delete_mfa_enrollment(user_id).await
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.inner.health_check().await
    }
}

async fn persistent_login(app: &TestApp) -> AuthSession {
    app.seed_user(42, "trader@example.com", UserState::Active);
    let outcome = app
        .auth
        .login(LoginRequest {
            email: "trader@example.com".to_string(),
            password: TEST_PASSWORD.to_string(),
            persist_session: true,
            ..LoginRequest::default()
        })
        .await
        .unwrap();
    match outcome {
        LoginOutcome::Authenticated(session) => session,
        LoginOutcome::MfaRequired { .. } => panic!("unexpected MFA challenge"),
    }
}

#[tokio::test]
async fn test_refresh_rotates_token_family() {
    let app = TestApp::new();
    let session = persistent_login(&app).await;
    let first = session.refresh_token.unwrap();

    let pair = app.auth.refresh_access_token(&first).await.unwrap();
    assert_ne!(pair.refresh_token, first);

    let old = app.jwt.validate_refresh_token(&first).unwrap();
    let new = app.jwt.validate_refresh_token(&pair.refresh_token).unwrap();
    assert_eq!(new.sid, session.session_id);

    let old_record = app.sessions.get_refresh_record(&old.jti).await.unwrap().unwrap();
    let new_record = app.sessions.get_refresh_record(&new.jti).await.unwrap().unwrap();
    assert_eq!(old_record.rotated_to.as_deref(), Some(new.jti.as_str()));
    assert_eq!(new_record.parent_jti.as_deref(), Some(old.jti.as_str()));
    assert!(new_record.rotated_to.is_none());

    let claims = app.jwt.validate_access_token(&pair.access_token).unwrap();
    assert_eq!(claims.sid, session.session_id);

    // The successor keeps working.
    assert!(app.auth.refresh_access_token(&pair.refresh_token).await.is_ok());
    assert_eq!(app.audit.of_type(AuthEventType::TokenRefreshed).len(), 2);
    assert_eq!(app.events.count(EventType::TokenRefreshed), 2);
}

#[tokio::test]
async fn test_refresh_picks_up_new_roles_and_accounts() {
    let app = TestApp::new();
    let session = persistent_login(&app).await;

    app.admin.assign_role(42, "trader").await.unwrap();
    app.accounts.add_account(99, 42, true);

    let pair = app
        .auth
        .refresh_access_token(session.refresh_token.as_deref().unwrap())
        .await
        .unwrap();
    let claims = app.jwt.validate_access_token(&pair.access_token).unwrap();
    assert_eq!(claims.roles, vec!["trader".to_string(), "user".to_string()]);
    assert_eq!(claims.trading_account_ids, vec![99]);
}

#[tokio::test]
async fn test_replayed_refresh_token_revokes_session() {
    let app = TestApp::new();
    let session = persistent_login(&app).await;
    let first = session.refresh_token.unwrap();

    let pair = app.auth.refresh_access_token(&first).await.unwrap();

    let err = app.auth.refresh_access_token(&first).await.unwrap_err();
    assert!(matches!(err, ServiceError::ReuseDetected));

    // The session is gone, so the legitimate successor dies with it.
    assert!(app.sessions.get_session(&session.session_id).await.unwrap().is_none());
    let err = app.auth.refresh_access_token(&pair.refresh_token).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));
    assert!(app.auth.authenticate(&pair.access_token).await.is_err());

    let reuse = app.audit.of_type(AuthEventType::RefreshReuseDetected);
    assert_eq!(reuse.len(), 1);
    assert_eq!(reuse[0].risk_score, Some(RiskScore::High));
    assert_eq!(reuse[0].user_id, Some(42));
    assert_eq!(app.events.count(EventType::RefreshReuseDetected), 1);
}

#[tokio::test]
async fn test_concurrent_refresh_has_one_winner() {
    let app = TestApp::with_session_store(|inner| Arc::new(InterleavingStore { inner }));
    let session = persistent_login(&app).await;
    let token = session.refresh_token.unwrap();
    let jti = app.jwt.validate_refresh_token(&token).unwrap().jti;

    // Both calls see the record active; the compare-and-set picks the winner.
    let (a, b) = tokio::join!(
        app.auth.refresh_access_token(&token),
        app.auth.refresh_access_token(&token)
    );

    let (winner, loser) = match (a, b) {
        (Ok(pair), Err(err)) | (Err(err), Ok(pair)) => (pair, err),
        (a, b) => panic!("expected exactly one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(matches!(loser, ServiceError::ReuseDetected));

    // The loser detected reuse at rotation time and revoked the session.
    let reuse = app.audit.of_type(AuthEventType::RefreshReuseDetected);
    assert_eq!(reuse.len(), 1);
    let winner_jti = app.jwt.validate_refresh_token(&winner.refresh_token).unwrap().jti;
    assert_eq!(reuse[0].metadata["jti"], jti.as_str());
    assert_eq!(reuse[0].metadata["rotated_to"], winner_jti.as_str());

    assert!(app.sessions.get_session(&session.session_id).await.unwrap().is_none());
    let err = app.auth.refresh_access_token(&winner.refresh_token).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));
}

#[tokio::test]
async fn test_garbage_and_access_tokens_are_not_refresh_tokens() {
    let app = TestApp::new();
    let session = persistent_login(&app).await;

    let err = app.auth.refresh_access_token("not-a-jwt").await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));

    let err = app.auth.refresh_access_token(&session.access_token).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));

    let failures = app.audit.of_type(AuthEventType::RefreshFailed);
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|e| e.metadata["reason"] == "invalid_token"));
    assert!(failures.iter().all(|e| e.user_id.is_none()));
}

#[tokio::test]
async fn test_refresh_after_logout_fails() {
    let app = TestApp::new();
    let session = persistent_login(&app).await;

    app.auth.logout(&session.session_id, 42, false).await.unwrap();

    let err = app
        .auth
        .refresh_access_token(session.refresh_token.as_deref().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRefreshToken));

    let failures = app.audit.of_type(AuthEventType::RefreshFailed);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].metadata["reason"], "session_ended");
    assert_eq!(failures[0].session_id.as_deref(), Some(session.session_id.as_str()));

    // The dead family's record is gone, so a retry is an unknown token.
    app.auth
        .refresh_access_token(session.refresh_token.as_deref().unwrap())
        .await
        .unwrap_err();
    let failures = app.audit.of_type(AuthEventType::RefreshFailed);
    assert_eq!(failures[1].metadata["reason"], "unknown_token");
}

#[tokio::test]
async fn test_refresh_rejected_for_suspended_user() {
    let app = TestApp::new();
    let session = persistent_login(&app).await;
    app.users.set_state(42, UserState::Suspended);

    let err = app
        .auth
        .refresh_access_token(session.refresh_token.as_deref().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AccountSuspended));

    let failures = app.audit.of_type(AuthEventType::RefreshFailed);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].user_id, Some(42));
    assert_eq!(failures[0].metadata["reason"], "account_suspended");
}

#[tokio::test]
async fn test_refresh_extends_persistent_session_ttl() {
    let app = TestApp::new();
    let session = persistent_login(&app).await;

    app.auth
        .refresh_access_token(session.refresh_token.as_deref().unwrap())
        .await
        .unwrap();

    assert_eq!(app.sessions.session_ttl(&session.session_id), Some(7 * 86_400));
    let stored = app.sessions.get_session(&session.session_id).await.unwrap().unwrap();
    assert!(stored.last_active_at >= stored.created_at);
}
