mod common;

use common::{TestApp, TEST_PASSWORD};
use identity_service::models::{AuthEventType, EventType, UserState};
use identity_service::services::{
    AuthSettings, LoginOutcome, LoginRequest, MfaLoginRequest, ServiceError, SessionStore,
    TokenIssuer, TotpMfaVerifier,
};

fn login(email: &str, password: &str, persist: bool) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
        device_fingerprint: Some("device-1".to_string()),
        ip_address: Some("203.0.113.7".to_string()),
        persist_session: persist,
    }
}

#[tokio::test]
async fn test_login_creates_session_and_tokens() {
    let app = TestApp::new();
    app.seed_user(42, "trader@example.com", UserState::Active);
    app.accounts.add_account(99, 42, true);
    app.accounts.add_account(100, 42, false);

    let outcome = app
        .auth
        .login(login("Trader@Example.com", TEST_PASSWORD, true))
        .await
        .unwrap();
    let LoginOutcome::Authenticated(session) = outcome else {
        panic!("expected an authenticated session");
    };

    assert_eq!(session.token_type, "Bearer");
    assert_eq!(session.expires_in, 15 * 60);
    assert!(session.refresh_token.is_some());

    let claims = app.jwt.validate_access_token(&session.access_token).unwrap();
    assert_eq!(claims.sub, "user:42");
    assert_eq!(claims.sid, session.session_id);
    assert_eq!(claims.roles, vec!["user".to_string()]);
    assert_eq!(claims.trading_account_ids, vec![99]);
    assert!(!claims.mfa_verified);

    let stored = app.sessions.get_session(&session.session_id).await.unwrap().unwrap();
    assert!(stored.persistent);
    assert_eq!(stored.ip_address.as_deref(), Some("203.0.113.7"));
    assert_eq!(app.sessions.session_ttl(&session.session_id), Some(7 * 86_400));

    assert_eq!(app.audit.of_type(AuthEventType::LoginSuccess).len(), 1);
    assert_eq!(app.events.count(EventType::LoginSuccess), 1);
}

#[tokio::test]
async fn test_non_persistent_login_has_no_refresh_token() {
    let app = TestApp::new();
    app.seed_user(1, "a@example.com", UserState::Active);

    let LoginOutcome::Authenticated(session) = app
        .auth
        .login(login("a@example.com", TEST_PASSWORD, false))
        .await
        .unwrap()
    else {
        panic!("expected an authenticated session");
    };

    assert!(session.refresh_token.is_none());
    assert_eq!(app.sessions.session_ttl(&session.session_id), Some(3600));
}

#[tokio::test]
async fn test_login_activates_pending_user() {
    let app = TestApp::new();
    app.seed_user(5, "new@example.com", UserState::PendingVerification);

    let LoginOutcome::Authenticated(session) = app
        .auth
        .login(login("new@example.com", TEST_PASSWORD, false))
        .await
        .unwrap()
    else {
        panic!("expected an authenticated session");
    };

    assert_eq!(session.user.user_state_code, "active");
    let user = app.users.get(5).unwrap();
    assert_eq!(user.state(), UserState::Active);
    assert!(user.last_login_utc.is_some());
}

#[tokio::test]
async fn test_wrong_password_and_unknown_email_fail_identically() {
    let app = TestApp::new();
    app.seed_user(42, "trader@example.com", UserState::Active);

    let wrong_password = app
        .auth
        .login(login("trader@example.com", "Wrong-Password-1", false))
        .await
        .unwrap_err();
    let unknown_email = app
        .auth
        .login(login("nobody@example.com", TEST_PASSWORD, false))
        .await
        .unwrap_err();

    assert!(matches!(wrong_password, ServiceError::InvalidCredentials));
    assert!(matches!(unknown_email, ServiceError::InvalidCredentials));
    assert_eq!(wrong_password.to_string(), unknown_email.to_string());

    let failures = app.audit.of_type(AuthEventType::LoginFailed);
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].user_id, Some(42));
    assert_eq!(failures[0].metadata["reason"], "invalid_password");
    assert_eq!(failures[1].user_id, None);
    assert_eq!(failures[1].metadata["reason"], "unknown_email");
}

#[tokio::test]
async fn test_blocked_accounts_cannot_login() {
    let app = TestApp::new();
    app.seed_user(1, "gone@example.com", UserState::Deactivated);
    app.seed_user(2, "paused@example.com", UserState::Suspended);

    let err = app
        .auth
        .login(login("gone@example.com", TEST_PASSWORD, false))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AccountDeactivated));

    let err = app
        .auth
        .login(login("paused@example.com", TEST_PASSWORD, false))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AccountSuspended));
    assert_eq!(app.sessions.session_count(), 0);

    let failures = app.audit.of_type(AuthEventType::LoginFailed);
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].user_id, Some(1));
    assert_eq!(failures[0].metadata["reason"], "account_deactivated");
    assert_eq!(failures[1].user_id, Some(2));
    assert_eq!(failures[1].metadata["reason"], "account_suspended");
}

#[tokio::test]
async fn test_account_blocked_between_challenge_and_code() {
    let app = TestApp::new();
    let (user, _) = app.seed_mfa_user(7, "mfa@example.com");

    let LoginOutcome::MfaRequired { session_token, .. } = app
        .auth
        .login(login("mfa@example.com", TEST_PASSWORD, false))
        .await
        .unwrap()
    else {
        panic!("expected an MFA challenge");
    };
    app.users.set_state(7, UserState::Suspended);

    let code = TotpMfaVerifier::current_code(user.totp_secret.as_deref().unwrap(), &user.email).unwrap();
    let err = app
        .auth
        .verify_mfa_and_login(MfaLoginRequest {
            session_token,
            code,
            ..MfaLoginRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AccountSuspended));

    let failures = app.audit.of_type(AuthEventType::MfaFailed);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].metadata["reason"], "account_suspended");
    assert_eq!(app.sessions.session_count(), 0);
}

#[tokio::test]
async fn test_mfa_attempt_budget_is_audited() {
    let app = TestApp::with_settings(AuthSettings {
        login_attempts: 2,
        ..AuthSettings::default()
    });
    app.seed_mfa_user(7, "mfa@example.com");

    let LoginOutcome::MfaRequired { session_token, .. } = app
        .auth
        .login(login("mfa@example.com", TEST_PASSWORD, false))
        .await
        .unwrap()
    else {
        panic!("expected an MFA challenge");
    };

    for _ in 0..2 {
        let err = app
            .auth
            .verify_mfa_and_login(MfaLoginRequest {
                session_token: session_token.clone(),
                code: "000000".to_string(),
                ..MfaLoginRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidMfaCode));
    }

    let err = app
        .auth
        .verify_mfa_and_login(MfaLoginRequest {
            session_token,
            code: "000000".to_string(),
            ..MfaLoginRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::RateLimited { .. }));

    let limited = app.audit.of_type(AuthEventType::MfaRateLimited);
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].user_id, Some(7));
    assert_eq!(app.audit.of_type(AuthEventType::MfaFailed).len(), 2);
}

#[tokio::test]
async fn test_login_rate_limit() {
    let app = TestApp::with_settings(AuthSettings {
        login_attempts: 3,
        ..AuthSettings::default()
    });
    app.seed_user(42, "trader@example.com", UserState::Active);

    for _ in 0..3 {
        let err = app
            .auth
            .login(login("trader@example.com", "Wrong-Password-1", false))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredentials));
    }

    // Correct credentials do not bypass an exhausted window.
    let err = app
        .auth
        .login(login("TRADER@example.com", TEST_PASSWORD, false))
        .await
        .unwrap_err();
    match err {
        ServiceError::RateLimited { retry_after_seconds } => {
            assert!(retry_after_seconds > 0 && retry_after_seconds <= 900)
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }

    let limited = app.audit.of_type(AuthEventType::LoginRateLimited);
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].user_id, None);
}

#[tokio::test]
async fn test_mfa_challenge_then_totp_login() {
    let app = TestApp::new();
    let (user, _) = app.seed_mfa_user(7, "mfa@example.com");

    let outcome = app
        .auth
        .login(login("mfa@example.com", TEST_PASSWORD, true))
        .await
        .unwrap();
    let LoginOutcome::MfaRequired { session_token, methods } = outcome else {
        panic!("expected an MFA challenge");
    };
    assert_eq!(methods, vec!["totp".to_string()]);
    assert_eq!(app.sessions.session_count(), 0);

    let code = TotpMfaVerifier::current_code(user.totp_secret.as_deref().unwrap(), &user.email).unwrap();
    let session = app
        .auth
        .verify_mfa_and_login(MfaLoginRequest {
            session_token: session_token.clone(),
            code,
            persist_session: true,
            ..MfaLoginRequest::default()
        })
        .await
        .unwrap();

    let claims = app.jwt.validate_access_token(&session.access_token).unwrap();
    assert!(claims.mfa_verified);
    assert!(app.sessions.get_session(&session.session_id).await.unwrap().unwrap().mfa_verified);

    // The challenge token is single use.
    let err = app
        .auth
        .verify_mfa_and_login(MfaLoginRequest {
            session_token,
            code: "000000".to_string(),
            ..MfaLoginRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOrExpiredToken));
}

#[tokio::test]
async fn test_wrong_mfa_code_is_audited() {
    let app = TestApp::new();
    app.seed_mfa_user(7, "mfa@example.com");

    let LoginOutcome::MfaRequired { session_token, .. } = app
        .auth
        .login(login("mfa@example.com", TEST_PASSWORD, false))
        .await
        .unwrap()
    else {
        panic!("expected an MFA challenge");
    };

    let err = app
        .auth
        .verify_mfa_and_login(MfaLoginRequest {
            session_token,
            code: "not-a-code".to_string(),
            ..MfaLoginRequest::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::InvalidMfaCode));
    let failures = app.audit.of_type(AuthEventType::MfaFailed);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].user_id, Some(7));
}

#[tokio::test]
async fn test_backup_code_login_is_single_use() {
    let app = TestApp::new();
    let (_, backup_codes) = app.seed_mfa_user(7, "mfa@example.com");

    for expect_ok in [true, false] {
        let LoginOutcome::MfaRequired { session_token, .. } = app
            .auth
            .login(login("mfa@example.com", TEST_PASSWORD, false))
            .await
            .unwrap()
        else {
            panic!("expected an MFA challenge");
        };

        let result = app
            .auth
            .verify_mfa_and_login(MfaLoginRequest {
                session_token,
                code: backup_codes[0].clone(),
                ..MfaLoginRequest::default()
            })
            .await;
        assert_eq!(result.is_ok(), expect_ok);
    }

    assert_eq!(app.users.get(7).unwrap().backup_code_hashes.len(), 3);
}

#[tokio::test]
async fn test_unknown_mfa_token_is_rejected() {
    let app = TestApp::new();
    let err = app
        .auth
        .verify_mfa_and_login(MfaLoginRequest {
            session_token: "missing".to_string(),
            code: "123456".to_string(),
            ..MfaLoginRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOrExpiredToken));

    let failures = app.audit.of_type(AuthEventType::MfaFailed);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].user_id, None);
    assert_eq!(failures[0].metadata["reason"], "unknown_challenge");
}

#[tokio::test]
async fn test_audit_failures_do_not_block_login() {
    let app = TestApp::new();
    app.seed_user(1, "a@example.com", UserState::Active);
    app.audit.set_failing(true);

    let outcome = app.auth.login(login("a@example.com", TEST_PASSWORD, false)).await;
    assert!(matches!(outcome, Ok(LoginOutcome::Authenticated(_))));
}

#[tokio::test]
async fn test_logout_and_authenticate() {
    let app = TestApp::new();
    app.seed_user(42, "trader@example.com", UserState::Active);

    let mut sessions = Vec::new();
    for _ in 0..2 {
        let LoginOutcome::Authenticated(session) = app
            .auth
            .login(login("trader@example.com", TEST_PASSWORD, false))
            .await
            .unwrap()
        else {
            panic!("expected an authenticated session");
        };
        sessions.push(session);
    }

    let principal = app.auth.authenticate(&sessions[0].access_token).await.unwrap();
    assert_eq!(principal.subject(), "user:42");
    assert_eq!(app.auth.list_sessions(42).await.unwrap().len(), 2);

    // Another user's id cannot end this session.
    assert_eq!(app.auth.logout(&sessions[0].session_id, 7, false).await.unwrap(), 0);

    assert_eq!(app.auth.logout(&sessions[0].session_id, 42, false).await.unwrap(), 1);
    let err = app.auth.authenticate(&sessions[0].access_token).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOrExpiredToken));
    assert!(app.auth.authenticate(&sessions[1].access_token).await.is_ok());

    assert_eq!(app.auth.logout(&sessions[1].session_id, 42, true).await.unwrap(), 1);
    assert!(app.auth.list_sessions(42).await.unwrap().is_empty());
    assert_eq!(app.audit.of_type(AuthEventType::Logout).len(), 3);
    assert_eq!(app.events.count(EventType::SessionRevoked), 3);
}
