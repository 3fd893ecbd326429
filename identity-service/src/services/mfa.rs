//! Second-factor verification: TOTP codes and single-use backup codes.

use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};

use super::error::ServiceError;
use super::users::UserRepository;
use crate::models::User;

const TOTP_DIGITS: usize = 6;
const TOTP_STEP: u64 = 30;
const TOTP_SKEW: u8 = 1;
const TOTP_ISSUER: &str = "Identity Core";

const BACKUP_CODE_LENGTH: usize = 10;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaMethod {
    Totp,
    BackupCode,
}

impl MfaMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaMethod::Totp => "totp",
            MfaMethod::BackupCode => "backup_code",
        }
    }
}

/// Outcome of a second-factor check. `method` is set only when `ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfaVerification {
    pub ok: bool,
    pub method: Option<MfaMethod>,
}

impl MfaVerification {
    fn passed(method: MfaMethod) -> Self {
        Self {
            ok: true,
            method: Some(method),
        }
    }

    fn failed() -> Self {
        Self {
            ok: false,
            method: None,
        }
    }
}

#[async_trait]
pub trait MfaVerifier: Send + Sync {
    /// Check `code` as a TOTP code, then as a backup code if `allow_backup`.
    /// A matching backup code is consumed.
    async fn verify_totp(
        &self,
        user: &User,
        code: &str,
        allow_backup: bool,
    ) -> Result<MfaVerification, ServiceError>;
}

/// Enrollment material handed to the user once.
#[derive(Debug, Clone)]
pub struct MfaEnrollment {
    pub totp_secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
    pub backup_code_hashes: Vec<String>,
}

/// RFC 6238 verifier (SHA1, 6 digits, 30 s step, one step of skew).
pub struct TotpMfaVerifier {
    users: Arc<dyn UserRepository>,
}

impl TotpMfaVerifier {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    fn totp(secret_base32: &str, account_name: &str) -> Result<TOTP, ServiceError> {
        let secret = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Invalid TOTP secret: {:?}", e)))?;

        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret,
            Some(TOTP_ISSUER.to_string()),
            account_name.to_string(),
        )
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to create TOTP: {}", e)))
    }

    /// New secret, provisioning URI and backup codes for `account_name`.
    pub fn enroll(account_name: &str, backup_code_count: usize) -> Result<MfaEnrollment, ServiceError> {
        let totp_secret = Secret::generate_secret().to_encoded().to_string();
        let provisioning_uri = Self::totp(&totp_secret, account_name)?.get_url();
        let backup_codes = generate_backup_codes(backup_code_count);
        let backup_code_hashes = backup_codes.iter().map(|c| hash_backup_code(c)).collect();

        Ok(MfaEnrollment {
            totp_secret,
            provisioning_uri,
            backup_codes,
            backup_code_hashes,
        })
    }

    /// Current code for a secret. Used by enrollment confirmation and tests.
    pub fn current_code(secret_base32: &str, account_name: &str) -> Result<String, ServiceError> {
        Self::totp(secret_base32, account_name)?
            .generate_current()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to generate TOTP: {}", e)))
    }
}

#[async_trait]
impl MfaVerifier for TotpMfaVerifier {
    async fn verify_totp(
        &self,
        user: &User,
        code: &str,
        allow_backup: bool,
    ) -> Result<MfaVerification, ServiceError> {
        let code = code.trim();

        if let Some(secret) = user.totp_secret.as_deref() {
            let totp = Self::totp(secret, &user.email)?;
            if totp.check_current(code).unwrap_or(false) {
                return Ok(MfaVerification::passed(MfaMethod::Totp));
            }
        }

        if !allow_backup {
            return Ok(MfaVerification::failed());
        }

        let candidate = hash_backup_code(code);
        let matched = user
            .backup_code_hashes
            .iter()
            .any(|stored| bool::from(stored.as_bytes().ct_eq(candidate.as_bytes())));

        // The conditional delete is what makes the code single-use.
        if matched && self.users.consume_backup_code(user.user_id, &candidate).await? {
            tracing::info!(user_id = user.user_id, "Backup code consumed");
            return Ok(MfaVerification::passed(MfaMethod::BackupCode));
        }

        Ok(MfaVerification::failed())
    }
}

/// SHA-256 hex digest of a normalized backup code.
pub fn hash_backup_code(code: &str) -> String {
    let normalized: String = code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

fn generate_backup_codes(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let raw: String = (0..BACKUP_CODE_LENGTH)
                .map(|_| BACKUP_CODE_ALPHABET[rng.gen_range(0..BACKUP_CODE_ALPHABET.len())] as char)
                .collect();
            format!("{}-{}", &raw[..5], &raw[5..])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::users::MockUserRepository;
    use chrono::Utc;

    fn enrolled_user(enrollment: &MfaEnrollment) -> User {
        User {
            user_id: 7,
            email: "mfa@example.com".to_string(),
            password_hash: None,
            full_name: "Mfa User".to_string(),
            user_state_code: "active".to_string(),
            mfa_enabled: true,
            totp_secret: Some(enrollment.totp_secret.clone()),
            backup_code_hashes: enrollment.backup_code_hashes.clone(),
            preferences: serde_json::json!({}),
            last_login_utc: None,
            created_utc: Utc::now(),
        }
    }

    fn setup() -> (Arc<MockUserRepository>, TotpMfaVerifier, User, MfaEnrollment) {
        let enrollment = TotpMfaVerifier::enroll("mfa@example.com", 3).unwrap();
        let user = enrolled_user(&enrollment);
        let repo = Arc::new(MockUserRepository::new());
        repo.insert_user(user.clone(), &["user"]);
        let verifier = TotpMfaVerifier::new(repo.clone());
        (repo, verifier, user, enrollment)
    }

    #[tokio::test]
    async fn test_current_totp_code_passes() {
        let (_, verifier, user, enrollment) = setup();
        let code = TotpMfaVerifier::current_code(&enrollment.totp_secret, &user.email).unwrap();

        let result = verifier.verify_totp(&user, &code, false).await.unwrap();
        assert_eq!(result, MfaVerification::passed(MfaMethod::Totp));
    }

    #[tokio::test]
    async fn test_backup_code_is_single_use() {
        let (repo, verifier, user, enrollment) = setup();
        let code = enrollment.backup_codes[0].to_lowercase();

        let first = verifier.verify_totp(&user, &code, true).await.unwrap();
        assert_eq!(first.method, Some(MfaMethod::BackupCode));

        let reloaded = repo.get(user.user_id).unwrap();
        assert_eq!(reloaded.backup_code_hashes.len(), 2);
        let second = verifier.verify_totp(&reloaded, &code, true).await.unwrap();
        assert!(!second.ok);

        // A stale user snapshot still listing the code cannot reuse it either.
        let stale = verifier.verify_totp(&user, &code, true).await.unwrap();
        assert!(!stale.ok);
    }

    #[tokio::test]
    async fn test_backup_code_rejected_when_not_allowed() {
        let (_, verifier, user, enrollment) = setup();
        let result = verifier
            .verify_totp(&user, &enrollment.backup_codes[1], false)
            .await
            .unwrap();
        assert_eq!(result, MfaVerification::failed());
    }

    #[tokio::test]
    async fn test_wrong_code_fails() {
        let (_, verifier, user, _) = setup();
        let result = verifier.verify_totp(&user, "not-a-code", true).await.unwrap();
        assert!(!result.ok);
    }

    #[test]
    fn test_enrollment_material() {
        let enrollment = TotpMfaVerifier::enroll("mfa@example.com", 8).unwrap();
        assert_eq!(enrollment.backup_codes.len(), 8);
        assert!(enrollment.provisioning_uri.starts_with("otpauth://totp/"));
        assert_eq!(
            enrollment.backup_code_hashes[0],
            hash_backup_code(&enrollment.backup_codes[0])
        );
        assert_eq!(hash_backup_code("abcde-12345"), hash_backup_code("ABCDE12345"));
    }
}
