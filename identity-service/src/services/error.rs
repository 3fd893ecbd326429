use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Email already registered")]
    DuplicateEmail,

    #[error("Weak password: {0}")]
    WeakPassword(String),

    #[error("Too many attempts, retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Account deactivated")]
    AccountDeactivated,

    #[error("Account suspended")]
    AccountSuspended,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or expired token")]
    InvalidOrExpiredToken,

    #[error("Invalid MFA code")]
    InvalidMfaCode,

    #[error("MFA is already enabled")]
    MfaAlreadyEnabled,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Refresh token reuse detected")]
    ReuseDetected,

    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Session store error: {0}")]
    SessionStore(anyhow::Error),

    #[error("Policy store error: {0}")]
    PolicyStore(anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::SessionStore(anyhow::Error::new(err))
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::DuplicateEmail => {
                AppError::Conflict(anyhow::anyhow!("Email already registered"))
            }
            ServiceError::WeakPassword(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::RateLimited {
                retry_after_seconds,
            } => AppError::TooManyRequests(
                "Too many login attempts".to_string(),
                Some(retry_after_seconds),
            ),
            ServiceError::AccountDeactivated => {
                AppError::Forbidden(anyhow::anyhow!("Account deactivated"))
            }
            ServiceError::AccountSuspended => {
                AppError::Forbidden(anyhow::anyhow!("Account suspended"))
            }
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::InvalidOrExpiredToken => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
            }
            ServiceError::InvalidMfaCode => {
                AppError::AuthError(anyhow::anyhow!("Invalid MFA code"))
            }
            ServiceError::MfaAlreadyEnabled => {
                AppError::Conflict(anyhow::anyhow!("MFA is already enabled"))
            }
            ServiceError::InvalidRefreshToken => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid refresh token"))
            }
            // Reuse is reported like any other dead token.
            ServiceError::ReuseDetected => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid refresh token"))
            }
            ServiceError::MalformedIdentifier(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::SessionStore(e) => AppError::InternalError(e),
            ServiceError::PolicyStore(e) => AppError::DatabaseError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_is_indistinguishable_from_invalid_refresh() {
        let reuse: AppError = ServiceError::ReuseDetected.into();
        let invalid: AppError = ServiceError::InvalidRefreshToken.into();
        assert_eq!(reuse.to_string(), invalid.to_string());
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let err: AppError = ServiceError::RateLimited {
            retry_after_seconds: 900,
        }
        .into();
        assert!(matches!(err, AppError::TooManyRequests(_, Some(900))));
    }
}
