//! Decision cache: `authz:<subject>:<resource>:<action>` holding
//! `"<decision>:<policy name or empty>"`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::pattern;
use crate::services::redis::RedisService;

const KEY_PREFIX: &str = "authz";
const SCAN_BATCH: usize = 500;

pub fn cache_key(subject: &str, resource: &str, action: &str) -> String {
    format!("{}:{}:{}:{}", KEY_PREFIX, subject, resource, action)
}

/// Key glob for a targeted invalidation. Absent parts match anything.
pub fn invalidation_pattern(subject: Option<&str>, action: Option<&str>, resource: Option<&str>) -> String {
    format!(
        "{}:{}:{}:{}",
        KEY_PREFIX,
        subject.unwrap_or("*"),
        resource.unwrap_or("*"),
        action.unwrap_or("*")
    )
}

#[async_trait]
pub trait DecisionCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), anyhow::Error>;

    /// Delete every key matching a `*` glob. Returns the number removed.
    async fn delete_matching(&self, key_pattern: &str) -> Result<usize, anyhow::Error>;
}

/// Escape Redis MATCH metacharacters other than `*`.
fn redis_match_pattern(glob: &str) -> String {
    let mut escaped = String::with_capacity(glob.len());
    for c in glob.chars() {
        if matches!(c, '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl DecisionCache for RedisService {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.connection();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read decision cache: {}", e))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), anyhow::Error> {
        let mut conn = self.connection();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write decision cache: {}", e))
    }

    async fn delete_matching(&self, key_pattern: &str) -> Result<usize, anyhow::Error> {
        let mut conn = self.connection();
        let match_pattern = redis_match_pattern(key_pattern);
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&match_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to scan decision cache: {}", e))?;

            if !keys.is_empty() {
                let deleted: usize = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to invalidate decision cache: {}", e))?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

/// In-memory decision cache. TTLs are ignored.
#[derive(Default)]
pub struct MockDecisionCache {
    pub entries: Mutex<HashMap<String, String>>,
    /// When set, every call fails. Exercises fail-closed paths.
    pub fail: std::sync::atomic::AtomicBool,
}

impl MockDecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<(), anyhow::Error> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("decision cache unavailable");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow::anyhow!("Mock decision cache mutex poisoned: {}", e)
}

#[async_trait]
impl DecisionCache for MockDecisionCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        self.check_failing()?;
        Ok(self.entries.lock().map_err(poisoned)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl_seconds: u64) -> Result<(), anyhow::Error> {
        self.check_failing()?;
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_matching(&self, key_pattern: &str) -> Result<usize, anyhow::Error> {
        self.check_failing()?;
        let re = pattern::compile(key_pattern)?;
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|key, _| !re.is_match(key));
        Ok(before - entries.len())
    }
}
