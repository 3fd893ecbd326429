//! Identity and access core: registration, login with MFA, session and
//! refresh token rotation, and attribute-based permission decisions.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

use service_core::error::AppError;
use sqlx::postgres::PgPool;
use std::sync::Arc;

use crate::config::IdentityConfig;
use crate::services::{
    AccessAdminService, AuthService, AuthSettings, AuthorizationService, JwtService, PgAuditLog,
    PgPolicyStore, PgTradingAccountStore, PgUserRepository, PolicyStore, RedisService,
    TotpMfaVerifier,
};
use crate::utils::Argon2Hasher;

/// Dependency graph, built once at startup and shared.
#[derive(Clone)]
pub struct IdentityCore {
    pub config: IdentityConfig,
    pub pool: PgPool,
    pub redis: Arc<RedisService>,
    pub jwt: Arc<JwtService>,
    pub auth: AuthService,
    pub authz: Arc<AuthorizationService>,
    pub admin: AccessAdminService,
    pub policies: Arc<dyn PolicyStore>,
}

impl IdentityCore {
    pub async fn connect(config: IdentityConfig) -> Result<Self, AppError> {
        let pool = db::create_pool(&config.database).await?;
        tracing::info!("Database pool initialized");

        let redis = Arc::new(RedisService::new(&config.redis).await?);
        tracing::info!("Redis service initialized");

        let jwt = Arc::new(JwtService::new(&config.jwt).map_err(AppError::ConfigError)?);
        tracing::info!("JWT service initialized");

        let users = Arc::new(PgUserRepository::new(pool.clone()));
        let trading_accounts = Arc::new(PgTradingAccountStore::new(pool.clone()));
        let policies: Arc<dyn PolicyStore> = Arc::new(PgPolicyStore::new(pool.clone()));

        let authz = Arc::new(AuthorizationService::new(
            policies.clone(),
            trading_accounts.clone(),
            redis.clone(),
            config.authz.cache_ttl_seconds,
        ));

        let auth = AuthService::new(
            users.clone(),
            redis.clone(),
            jwt.clone(),
            Arc::new(Argon2Hasher::new()),
            redis.clone(),
            Arc::new(TotpMfaVerifier::new(users.clone())),
            trading_accounts.clone(),
            Arc::new(PgAuditLog::new(pool.clone())),
            redis.clone(),
            AuthSettings::from(&config),
        );

        let admin = AccessAdminService::new(
            users,
            trading_accounts,
            redis.clone(),
            authz.clone(),
            redis.clone(),
        );

        Ok(Self {
            config,
            pool,
            redis,
            jwt,
            auth,
            authz,
            admin,
            policies,
        })
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        db::health_check(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, "PostgreSQL health check failed");
            AppError::from(e)
        })?;

        let role = &self.config.registration.default_role;
        if !db::role_exists(&self.pool, role).await? {
            tracing::error!(role = %role, "Default role is not seeded");
            return Err(AppError::ServiceUnavailable);
        }

        self.redis.ping().await.map_err(|e| {
            tracing::error!(error = %e, "Redis health check failed");
            AppError::InternalError(e)
        })?;

        Ok(())
    }
}
