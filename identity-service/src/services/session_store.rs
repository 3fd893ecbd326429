//! Session store: login sessions, refresh token records, pending MFA
//! challenges and enrollments, all TTL-bound.
//!
//! Keys:
//! - `session:<session_id>` hash
//! - `user_sessions:<user_id>` set of session ids
//! - `refresh:<jti>` hash
//! - `mfa_pending:<token>` user id
//! - `mfa_enrollment:<user_id>` pending TOTP material as JSON

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

use super::redis::RedisService;
use crate::models::{PendingMfaEnrollment, RefreshTokenRecord, RotationOutcome, Session};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put_session(&self, session: &Session, ttl_seconds: i64) -> Result<(), anyhow::Error>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, anyhow::Error>;

    /// Bump `last_active_at` and the TTL. Returns false when the session is gone.
    async fn touch_session(&self, session: &Session, ttl_seconds: i64) -> Result<bool, anyhow::Error>;

    async fn delete_session(&self, user_id: i64, session_id: &str) -> Result<bool, anyhow::Error>;

    async fn list_user_sessions(&self, user_id: i64) -> Result<Vec<Session>, anyhow::Error>;

    /// Delete every session of a user. Returns the number removed.
    async fn delete_user_sessions(&self, user_id: i64) -> Result<usize, anyhow::Error>;

    async fn put_refresh_record(&self, record: &RefreshTokenRecord) -> Result<(), anyhow::Error>;

    async fn get_refresh_record(&self, jti: &str)
        -> Result<Option<RefreshTokenRecord>, anyhow::Error>;

    async fn delete_refresh_record(&self, jti: &str) -> Result<(), anyhow::Error>;

    /// Atomically mark `old_jti` as rotated to `successor.jti` and store the
    /// successor, only if `old_jti` has not been rotated yet.
    async fn rotate_refresh_record(
        &self,
        old_jti: &str,
        successor: &RefreshTokenRecord,
    ) -> Result<RotationOutcome, anyhow::Error>;

    async fn put_mfa_pending(&self, token: &str, user_id: i64, ttl_seconds: i64)
        -> Result<(), anyhow::Error>;

    async fn get_mfa_pending(&self, token: &str) -> Result<Option<i64>, anyhow::Error>;

    async fn delete_mfa_pending(&self, token: &str) -> Result<(), anyhow::Error>;

    /// Replaces any enrollment already pending for the user.
    async fn put_mfa_enrollment(
        &self,
        user_id: i64,
        enrollment: &PendingMfaEnrollment,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error>;

    async fn get_mfa_enrollment(&self, user_id: i64)
        -> Result<Option<PendingMfaEnrollment>, anyhow::Error>;

    async fn delete_mfa_enrollment(&self, user_id: i64) -> Result<(), anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn user_sessions_key(user_id: i64) -> String {
    format!("user_sessions:{}", user_id)
}

fn refresh_key(jti: &str) -> String {
    format!("refresh:{}", jti)
}

fn mfa_pending_key(token: &str) -> String {
    format!("mfa_pending:{}", token)
}

fn mfa_enrollment_key(user_id: i64) -> String {
    format!("mfa_enrollment:{}", user_id)
}

// KEYS[1] session hash, KEYS[2] user session set
// ARGV[1] ttl, ARGV[2] session id, ARGV[3..] field/value pairs
fn put_session_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        Script::new(
            r#"
            redis.call('DEL', KEYS[1])
            redis.call('HSET', KEYS[1], unpack(ARGV, 3))
            redis.call('EXPIRE', KEYS[1], ARGV[1])
            redis.call('SADD', KEYS[2], ARGV[2])
            if redis.call('TTL', KEYS[2]) < tonumber(ARGV[1]) then
                redis.call('EXPIRE', KEYS[2], ARGV[1])
            end
            return 1
            "#,
        )
    })
}

// KEYS[1] session hash, KEYS[2] user session set
// ARGV[1] ttl, ARGV[2] last_active_at
fn touch_session_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return 0
            end
            redis.call('HSET', KEYS[1], 'last_active_at', ARGV[2])
            redis.call('EXPIRE', KEYS[1], ARGV[1])
            if redis.call('TTL', KEYS[2]) < tonumber(ARGV[1]) then
                redis.call('EXPIRE', KEYS[2], ARGV[1])
            end
            return 1
            "#,
        )
    })
}

// KEYS[1] old record, KEYS[2] successor record
// ARGV[1] successor jti, ARGV[2] successor ttl, ARGV[3..] successor field/value pairs
fn rotate_refresh_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        Script::new(
            r#"
            local rotated = redis.call('HGET', KEYS[1], 'rotated_to')
            if not rotated then
                return {'missing', ''}
            end
            if rotated ~= '' then
                return {'rotated', rotated}
            end
            redis.call('HSET', KEYS[1], 'rotated_to', ARGV[1])
            redis.call('HSET', KEYS[2], unpack(ARGV, 3))
            redis.call('EXPIRE', KEYS[2], ARGV[2])
            return {'ok', ''}
            "#,
        )
    })
}

fn to_hash(fields: HashMap<String, String>) -> Option<HashMap<String, String>> {
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

#[async_trait]
impl SessionStore for RedisService {
    async fn put_session(&self, session: &Session, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.connection();
        let mut invocation = put_session_script().prepare_invoke();
        invocation
            .key(session_key(&session.session_id))
            .key(user_sessions_key(session.user_id))
            .arg(ttl_seconds)
            .arg(&session.session_id);
        for (field, value) in session.to_fields() {
            invocation.arg(field).arg(value);
        }

        invocation
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Failed to store session: {}", e))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, anyhow::Error> {
        let mut conn = self.connection();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(session_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load session: {}", e))?;

        Ok(to_hash(fields).and_then(|f| Session::from_fields(&f)))
    }

    async fn touch_session(&self, session: &Session, ttl_seconds: i64) -> Result<bool, anyhow::Error> {
        let mut conn = self.connection();
        let touched: i64 = touch_session_script()
            .key(session_key(&session.session_id))
            .key(user_sessions_key(session.user_id))
            .arg(ttl_seconds)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to touch session: {}", e))?;

        Ok(touched == 1)
    }

    async fn delete_session(&self, user_id: i64, session_id: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.connection();
        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(session_key(session_id))
            .srem(user_sessions_key(user_id), session_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete session: {}", e))?;

        Ok(deleted > 0)
    }

    async fn list_user_sessions(&self, user_id: i64) -> Result<Vec<Session>, anyhow::Error> {
        let mut conn = self.connection();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(user_sessions_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list sessions: {}", e))?;

        let mut sessions = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for id in ids {
            match self.get_session(&id).await? {
                Some(session) => sessions.push(session),
                None => stale.push(id),
            }
        }

        // Expired sessions leave their id behind in the set.
        if !stale.is_empty() {
            redis::cmd("SREM")
                .arg(user_sessions_key(user_id))
                .arg(&stale)
                .query_async::<_, i64>(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to prune sessions: {}", e))?;
        }

        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(sessions)
    }

    async fn delete_user_sessions(&self, user_id: i64) -> Result<usize, anyhow::Error> {
        let mut conn = self.connection();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(user_sessions_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list sessions: {}", e))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.del(session_key(id));
        }
        pipe.del(user_sessions_key(user_id));

        let counts: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete sessions: {}", e))?;

        // Last count is the set itself.
        let removed = counts.iter().take(ids.len()).filter(|c| **c > 0).count();
        Ok(removed)
    }

    async fn put_refresh_record(&self, record: &RefreshTokenRecord) -> Result<(), anyhow::Error> {
        let mut conn = self.connection();
        let key = refresh_key(&record.jti);
        let fields = record.to_fields();

        redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, record.ttl_seconds())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to store refresh token: {}", e))
    }

    async fn get_refresh_record(
        &self,
        jti: &str,
    ) -> Result<Option<RefreshTokenRecord>, anyhow::Error> {
        let mut conn = self.connection();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(refresh_key(jti))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load refresh token: {}", e))?;

        Ok(to_hash(fields).and_then(|f| RefreshTokenRecord::from_fields(&f)))
    }

    async fn delete_refresh_record(&self, jti: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.connection();
        redis::cmd("DEL")
            .arg(refresh_key(jti))
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Failed to delete refresh token: {}", e))
    }

    async fn rotate_refresh_record(
        &self,
        old_jti: &str,
        successor: &RefreshTokenRecord,
    ) -> Result<RotationOutcome, anyhow::Error> {
        let mut conn = self.connection();
        let mut invocation = rotate_refresh_script().prepare_invoke();
        invocation
            .key(refresh_key(old_jti))
            .key(refresh_key(&successor.jti))
            .arg(&successor.jti)
            .arg(successor.ttl_seconds());
        for (field, value) in successor.to_fields() {
            invocation.arg(field).arg(value);
        }

        let (status, rotated_to): (String, String) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to rotate refresh token: {}", e))?;

        match status.as_str() {
            "ok" => Ok(RotationOutcome::Rotated),
            "rotated" => Ok(RotationOutcome::AlreadyRotated(rotated_to)),
            "missing" => Ok(RotationOutcome::Missing),
            other => Err(anyhow::anyhow!("Unexpected rotation status: {}", other)),
        }
    }

    async fn put_mfa_pending(
        &self,
        token: &str,
        user_id: i64,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.connection();
        redis::cmd("SET")
            .arg(mfa_pending_key(token))
            .arg(user_id)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to store MFA challenge: {}", e))
    }

    async fn get_mfa_pending(&self, token: &str) -> Result<Option<i64>, anyhow::Error> {
        let mut conn = self.connection();
        redis::cmd("GET")
            .arg(mfa_pending_key(token))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load MFA challenge: {}", e))
    }

    async fn delete_mfa_pending(&self, token: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.connection();
        redis::cmd("DEL")
            .arg(mfa_pending_key(token))
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Failed to delete MFA challenge: {}", e))
    }

    async fn put_mfa_enrollment(
        &self,
        user_id: i64,
        enrollment: &PendingMfaEnrollment,
        ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        let payload = serde_json::to_string(enrollment)?;
        let mut conn = self.connection();
        redis::cmd("SET")
            .arg(mfa_enrollment_key(user_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to store MFA enrollment: {}", e))
    }

    async fn get_mfa_enrollment(
        &self,
        user_id: i64,
    ) -> Result<Option<PendingMfaEnrollment>, anyhow::Error> {
        let mut conn = self.connection();
        let payload: Option<String> = redis::cmd("GET")
            .arg(mfa_enrollment_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load MFA enrollment: {}", e))?;

        payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(|e| anyhow::anyhow!("Corrupt MFA enrollment for user {}: {}", user_id, e))
    }

    async fn delete_mfa_enrollment(&self, user_id: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.connection();
        redis::cmd("DEL")
            .arg(mfa_enrollment_key(user_id))
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Failed to delete MFA enrollment: {}", e))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.ping().await
    }
}

/// In-memory session store. TTLs are recorded, not enforced, except that
/// refresh records past `expires_at` read as absent.
#[derive(Default)]
pub struct MockSessionStore {
    pub sessions: Mutex<HashMap<String, Session>>,
    pub session_ttls: Mutex<HashMap<String, i64>>,
    pub user_sessions: Mutex<HashMap<i64, HashSet<String>>>,
    pub refresh_records: Mutex<HashMap<String, RefreshTokenRecord>>,
    pub mfa_pending: Mutex<HashMap<String, i64>>,
    pub mfa_enrollments: Mutex<HashMap<i64, PendingMfaEnrollment>>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow::anyhow!("Mock session store mutex poisoned: {}", e)
}

impl MockSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_ttl(&self, session_id: &str) -> Option<i64> {
        self.session_ttls.lock().ok()?.get(session_id).copied()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    async fn put_session(&self, session: &Session, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        self.sessions
            .lock()
            .map_err(poisoned)?
            .insert(session.session_id.clone(), session.clone());
        self.session_ttls
            .lock()
            .map_err(poisoned)?
            .insert(session.session_id.clone(), ttl_seconds);
        self.user_sessions
            .lock()
            .map_err(poisoned)?
            .entry(session.user_id)
            .or_default()
            .insert(session.session_id.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, anyhow::Error> {
        Ok(self.sessions.lock().map_err(poisoned)?.get(session_id).cloned())
    }

    async fn touch_session(&self, session: &Session, ttl_seconds: i64) -> Result<bool, anyhow::Error> {
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        let Some(stored) = sessions.get_mut(&session.session_id) else {
            return Ok(false);
        };
        stored.last_active_at = Utc::now();
        self.session_ttls
            .lock()
            .map_err(poisoned)?
            .insert(session.session_id.clone(), ttl_seconds);
        Ok(true)
    }

    async fn delete_session(&self, user_id: i64, session_id: &str) -> Result<bool, anyhow::Error> {
        let removed = self
            .sessions
            .lock()
            .map_err(poisoned)?
            .remove(session_id)
            .is_some();
        self.session_ttls.lock().map_err(poisoned)?.remove(session_id);
        if let Some(ids) = self.user_sessions.lock().map_err(poisoned)?.get_mut(&user_id) {
            ids.remove(session_id);
        }
        Ok(removed)
    }

    async fn list_user_sessions(&self, user_id: i64) -> Result<Vec<Session>, anyhow::Error> {
        let ids = self
            .user_sessions
            .lock()
            .map_err(poisoned)?
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        let sessions = self.sessions.lock().map_err(poisoned)?;

        let mut live: Vec<Session> = ids.iter().filter_map(|id| sessions.get(id).cloned()).collect();
        live.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(live)
    }

    async fn delete_user_sessions(&self, user_id: i64) -> Result<usize, anyhow::Error> {
        let ids = self
            .user_sessions
            .lock()
            .map_err(poisoned)?
            .remove(&user_id)
            .unwrap_or_default();

        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        let mut ttls = self.session_ttls.lock().map_err(poisoned)?;
        let mut removed = 0;
        for id in &ids {
            ttls.remove(id);
            if sessions.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn put_refresh_record(&self, record: &RefreshTokenRecord) -> Result<(), anyhow::Error> {
        self.refresh_records
            .lock()
            .map_err(poisoned)?
            .insert(record.jti.clone(), record.clone());
        Ok(())
    }

    async fn get_refresh_record(
        &self,
        jti: &str,
    ) -> Result<Option<RefreshTokenRecord>, anyhow::Error> {
        let records = self.refresh_records.lock().map_err(poisoned)?;
        Ok(records
            .get(jti)
            .filter(|r| r.expires_at > Utc::now())
            .cloned())
    }

    async fn delete_refresh_record(&self, jti: &str) -> Result<(), anyhow::Error> {
        self.refresh_records.lock().map_err(poisoned)?.remove(jti);
        Ok(())
    }

    async fn rotate_refresh_record(
        &self,
        old_jti: &str,
        successor: &RefreshTokenRecord,
    ) -> Result<RotationOutcome, anyhow::Error> {
        let mut records = self.refresh_records.lock().map_err(poisoned)?;
        let Some(old) = records.get_mut(old_jti) else {
            return Ok(RotationOutcome::Missing);
        };
        if let Some(rotated_to) = old.rotated_to.clone() {
            return Ok(RotationOutcome::AlreadyRotated(rotated_to));
        }
        old.rotated_to = Some(successor.jti.clone());
        records.insert(successor.jti.clone(), successor.clone());
        Ok(RotationOutcome::Rotated)
    }

    async fn put_mfa_pending(
        &self,
        token: &str,
        user_id: i64,
        _ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        self.mfa_pending
            .lock()
            .map_err(poisoned)?
            .insert(token.to_string(), user_id);
        Ok(())
    }

    async fn get_mfa_pending(&self, token: &str) -> Result<Option<i64>, anyhow::Error> {
        Ok(self.mfa_pending.lock().map_err(poisoned)?.get(token).copied())
    }

    async fn delete_mfa_pending(&self, token: &str) -> Result<(), anyhow::Error> {
        self.mfa_pending.lock().map_err(poisoned)?.remove(token);
        Ok(())
    }

    async fn put_mfa_enrollment(
        &self,
        user_id: i64,
        enrollment: &PendingMfaEnrollment,
        _ttl_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        self.mfa_enrollments
            .lock()
            .map_err(poisoned)?
            .insert(user_id, enrollment.clone());
        Ok(())
    }

    async fn get_mfa_enrollment(
        &self,
        user_id: i64,
    ) -> Result<Option<PendingMfaEnrollment>, anyhow::Error> {
        Ok(self.mfa_enrollments.lock().map_err(poisoned)?.get(&user_id).cloned())
    }

    async fn delete_mfa_enrollment(&self, user_id: i64) -> Result<(), anyhow::Error> {
        self.mfa_enrollments.lock().map_err(poisoned)?.remove(&user_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
