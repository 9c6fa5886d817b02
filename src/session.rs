use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub type SessionStore = Arc<dyn SessionStoreType>;

/// Live session as the gateway keeps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionState {
    pub rate: f64,
    pub per: f64,
    pub allowance: f64,
    /// Requests allowed per renewal window; negative means unlimited.
    pub quota_max: i64,
    pub quota_remaining: i64,
    /// Unix time at which the quota window resets.
    pub quota_renews: i64,
    /// Length of the quota window in seconds.
    pub quota_renewal_rate: i64,
    pub apply_policy_id: String,
    pub apply_policies: Vec<String>,
    pub alias: String,
    pub org_id: String,
    pub tags: Vec<String>,
    pub expires: i64,
    pub meta_data: Map<String, Value>,
    pub last_updated: i64,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            rate: 0.0,
            per: 0.0,
            allowance: 0.0,
            quota_max: -1,
            quota_remaining: -1,
            quota_renews: 0,
            quota_renewal_rate: 0,
            apply_policy_id: String::new(),
            apply_policies: Vec::new(),
            alias: String::new(),
            org_id: String::new(),
            tags: Vec::new(),
            expires: 0,
            meta_data: Map::new(),
            last_updated: 0,
        }
    }
}

/// Computes the next value for a key from its current one. `None` leaves
/// the entry as it is.
pub type SessionUpdate = Box<dyn FnOnce(Option<SessionState>) -> Option<SessionState> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct Updated {
    /// Stored value after the update.
    pub session: Option<SessionState>,
    pub changed: bool,
}

#[async_trait]
pub trait SessionStoreType: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Option<SessionState>;
    async fn set(&self, key: &str, session: SessionState);
    /// Read-modify-write of one key, atomic with respect to other updates
    /// of the same key.
    async fn update(&self, key: &str, f: SessionUpdate) -> Updated;
    async fn remove(&self, key: &str);
    /// Drops every session (tests, shutdown).
    fn clear(&self);
}

#[derive(Clone, Debug)]
pub struct InMemorySessionStore {
    cache: Cache<String, SessionState>,
}

impl InMemorySessionStore {
    /// Creates a store whose idle entries expire after `ttl_secs`.
    pub fn new(ttl_secs: u64) -> Arc<Self> {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(ttl_secs))
            .eviction_listener(|key: Arc<String>, _value: SessionState, cause| {
                debug!("Session evicted: key={}, cause={:?}", key, cause);
            })
            .build();
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl SessionStoreType for InMemorySessionStore {
    async fn get(&self, key: &str) -> Option<SessionState> {
        self.cache.get(key).await
    }

    async fn set(&self, key: &str, session: SessionState) {
        self.cache.insert(key.to_string(), session).await;
    }

    async fn update(&self, key: &str, f: SessionUpdate) -> Updated {
        let result = self
            .cache
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match f(current.map(|e| e.into_value())) {
                    Some(next) => Op::Put(next),
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        match result {
            CompResult::Inserted(e) | CompResult::ReplacedWith(e) => {
                Updated { session: Some(e.into_value()), changed: true }
            }
            CompResult::Unchanged(e) => Updated { session: Some(e.into_value()), changed: false },
            CompResult::Removed(_) => Updated { session: None, changed: true },
            CompResult::StillNone(_) => Updated { session: None, changed: false },
        }
    }

    async fn remove(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}
