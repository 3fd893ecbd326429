use chrono::{Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::{user_subject, RefreshTokenRecord};

const ACCESS_TOKEN_TYPE: &str = "access";
const REFRESH_TOKEN_TYPE: &str = "refresh";

/// Signs and validates session tokens.
pub trait TokenIssuer: Send + Sync {
    fn issue_access_token(&self, grant: &AccessGrant) -> Result<String, anyhow::Error>;

    /// Sign a refresh token for a stored record; `jti` and `exp` come from the record.
    fn issue_refresh_token(&self, record: &RefreshTokenRecord) -> Result<String, anyhow::Error>;

    fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, anyhow::Error>;

    fn validate_refresh_token(&self, token: &str) -> Result<RefreshTokenClaims, anyhow::Error>;

    fn access_token_expiry_seconds(&self) -> i64;

    fn refresh_token_expiry_days(&self) -> i64;
}

/// Identity carried by an access token.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessGrant {
    pub user_id: i64,
    pub session_id: String,
    pub roles: Vec<String>,
    pub trading_account_ids: Vec<i64>,
    pub mfa_verified: bool,
}

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject, `user:<id>`
    pub sub: String,
    /// Session ID
    pub sid: String,
    pub roles: Vec<String>,
    pub trading_account_ids: Vec<i64>,
    pub mfa_verified: bool,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(rename = "type")]
    pub token_type: String,
}

/// Claims for refresh tokens (long-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    /// Subject, `user:<id>`
    pub sub: String,
    pub sid: String,
    /// Token ID (matches the stored refresh record)
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

impl AccessTokenClaims {
    pub fn user_id(&self) -> Option<i64> {
        parse_subject(&self.sub)
    }
}

impl RefreshTokenClaims {
    pub fn user_id(&self) -> Option<i64> {
        parse_subject(&self.sub)
    }
}

fn parse_subject(sub: &str) -> Option<i64> {
    sub.strip_prefix("user:")?.parse().ok()
}

/// A signing key and the matching verification key, identified by `kid`.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SigningKey {
    /// RS256 key pair from PEM text.
    pub fn rsa_from_pem(
        kid: impl Into<String>,
        private_key_pem: &[u8],
        public_key_pem: &[u8],
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        Ok(Self {
            kid: kid.into(),
            algorithm: Algorithm::RS256,
            encoding_key,
            decoding_key,
        })
    }

    /// RS256 key pair loaded from PEM files.
    pub fn rsa_from_files(
        kid: impl Into<String>,
        private_key_path: &str,
        public_key_path: &str,
    ) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
            anyhow::anyhow!("Failed to read private key from {}: {}", private_key_path, e)
        })?;
        let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
            anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
        })?;

        Self::rsa_from_pem(kid, private_key_pem.as_bytes(), public_key_pem.as_bytes())
    }

    /// HS256 shared secret.
    pub fn hmac(kid: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            kid: kid.into(),
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }
}

struct KeyRing {
    current: Arc<SigningKey>,
    /// Keys that no longer sign but still verify outstanding tokens.
    retired: Vec<Arc<SigningKey>>,
}

impl KeyRing {
    fn find(&self, kid: Option<&str>) -> Option<Arc<SigningKey>> {
        match kid {
            None => Some(self.current.clone()),
            Some(kid) if kid == self.current.kid => Some(self.current.clone()),
            Some(kid) => self.retired.iter().find(|k| k.kid == kid).cloned(),
        }
    }
}

/// JWT service for token generation and validation
pub struct JwtService {
    keys: RwLock<KeyRing>,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
}

impl JwtService {
    /// Build from configuration: HS256 when a secret is set, RS256 key files otherwise.
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let key = match (&config.hmac_secret, &config.private_key_path, &config.public_key_path) {
            (Some(secret), _, _) => {
                tracing::info!(kid = %config.key_id, "JWT service initialized with HS256 secret");
                SigningKey::hmac(config.key_id.clone(), secret.as_bytes())
            }
            (None, Some(private_path), Some(public_path)) => {
                let key = SigningKey::rsa_from_files(config.key_id.clone(), private_path, public_path)?;
                tracing::info!(kid = %config.key_id, "JWT service initialized with RS256 keys");
                key
            }
            _ => anyhow::bail!("JWT key material missing: set a key pair or an HMAC secret"),
        };

        Ok(Self::with_key(
            key,
            config.access_token_expiry_minutes,
            config.refresh_token_expiry_days,
        ))
    }

    pub fn with_key(
        key: SigningKey,
        access_token_expiry_minutes: i64,
        refresh_token_expiry_days: i64,
    ) -> Self {
        Self {
            keys: RwLock::new(KeyRing {
                current: Arc::new(key),
                retired: Vec::new(),
            }),
            access_token_expiry_minutes,
            refresh_token_expiry_days,
        }
    }

    /// HS256 issuer, mostly for tests and local tooling.
    pub fn from_secret(secret: &[u8], access_token_expiry_minutes: i64, refresh_token_expiry_days: i64) -> Self {
        Self::with_key(
            SigningKey::hmac("default", secret),
            access_token_expiry_minutes,
            refresh_token_expiry_days,
        )
    }

    /// Start signing with `key`. The previous key keeps verifying tokens it signed.
    pub fn rotate_signing_key(&self, key: SigningKey) -> Result<(), anyhow::Error> {
        let mut ring = self
            .keys
            .write()
            .map_err(|_| anyhow::anyhow!("JWT key ring lock poisoned"))?;

        if ring.current.kid == key.kid || ring.retired.iter().any(|k| k.kid == key.kid) {
            anyhow::bail!("Signing key id {} already used", key.kid);
        }

        let previous = std::mem::replace(&mut ring.current, Arc::new(key));
        tracing::info!(
            retired_kid = %previous.kid,
            current_kid = %ring.current.kid,
            "JWT signing key rotated"
        );
        ring.retired.push(previous);
        Ok(())
    }

    pub fn current_kid(&self) -> Result<String, anyhow::Error> {
        let ring = self
            .keys
            .read()
            .map_err(|_| anyhow::anyhow!("JWT key ring lock poisoned"))?;
        Ok(ring.current.kid.clone())
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String, anyhow::Error> {
        let key = self
            .keys
            .read()
            .map_err(|_| anyhow::anyhow!("JWT key ring lock poisoned"))?
            .current
            .clone();

        let mut header = Header::new(key.algorithm);
        header.kid = Some(key.kid.clone());

        encode(&header, claims, &key.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode token: {}", e))
    }

    fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, anyhow::Error> {
        let header = decode_header(token).map_err(|e| anyhow::anyhow!("Malformed token: {}", e))?;

        let key = self
            .keys
            .read()
            .map_err(|_| anyhow::anyhow!("JWT key ring lock poisoned"))?
            .find(header.kid.as_deref())
            .ok_or_else(|| anyhow::anyhow!("Unknown signing key"))?;

        let mut validation = Validation::new(key.algorithm);
        validation.validate_exp = true;

        let token_data = decode::<T>(token, &key.decoding_key, &validation)
            .map_err(|e| anyhow::anyhow!("Invalid token: {}", e))?;

        Ok(token_data.claims)
    }
}

impl TokenIssuer for JwtService {
    fn issue_access_token(&self, grant: &AccessGrant) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let exp = now + Duration::minutes(self.access_token_expiry_minutes);

        let claims = AccessTokenClaims {
            sub: user_subject(grant.user_id),
            sid: grant.session_id.clone(),
            roles: grant.roles.clone(),
            trading_account_ids: grant.trading_account_ids.clone(),
            mfa_verified: grant.mfa_verified,
            exp: exp.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type: ACCESS_TOKEN_TYPE.to_string(),
        };

        self.sign(&claims)
    }

    fn issue_refresh_token(&self, record: &RefreshTokenRecord) -> Result<String, anyhow::Error> {
        let claims = RefreshTokenClaims {
            sub: user_subject(record.user_id),
            sid: record.session_id.clone(),
            jti: record.jti.clone(),
            exp: record.expires_at.timestamp(),
            iat: record.issued_at.timestamp(),
            token_type: REFRESH_TOKEN_TYPE.to_string(),
        };

        self.sign(&claims)
    }

    fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, anyhow::Error> {
        let claims: AccessTokenClaims = self.verify(token)?;
        if claims.token_type != ACCESS_TOKEN_TYPE {
            anyhow::bail!("Expected an access token, got {}", claims.token_type);
        }
        Ok(claims)
    }

    fn validate_refresh_token(&self, token: &str) -> Result<RefreshTokenClaims, anyhow::Error> {
        let claims: RefreshTokenClaims = self.verify(token)?;
        if claims.token_type != REFRESH_TOKEN_TYPE {
            anyhow::bail!("Expected a refresh token, got {}", claims.token_type);
        }
        Ok(claims)
    }

    fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    fn refresh_token_expiry_days(&self) -> i64 {
        self.refresh_token_expiry_days
    }
}
