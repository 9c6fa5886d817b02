use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::session::SessionState;

pub type PolicyStore = Arc<dyn PolicyStoreType>;

/// Rate and quota limits shared by every session that applies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub per: f64,
    #[serde(default = "unlimited")]
    pub quota_max: i64,
    #[serde(default)]
    pub quota_renewal_rate: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn unlimited() -> i64 {
    -1
}

impl Policy {
    /// Copy this policy's limits onto `session`.
    pub fn apply(&self, session: &mut SessionState) {
        session.rate = self.rate;
        session.per = self.per;
        session.quota_max = self.quota_max;
        session.quota_renewal_rate = self.quota_renewal_rate;
        if !self.org_id.is_empty() {
            session.org_id = self.org_id.clone();
        }
        for tag in &self.tags {
            if !session.tags.contains(tag) {
                session.tags.push(tag.clone());
            }
        }
        if !session.apply_policies.contains(&self.id) {
            session.apply_policies.push(self.id.clone());
        }
    }
}

#[async_trait]
pub trait PolicyStoreType: Send + Sync + Debug {
    async fn resolve(&self, policy_id: &str) -> Option<Policy>;
    async fn insert(&self, policy: Policy);
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: DashMap<String, Policy>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Load a JSON array of policies.
    pub fn from_file(path: &Path) -> anyhow::Result<Arc<Self>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading policies from {}", path.display()))?;
        let list: Vec<Policy> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing policies in {}", path.display()))?;
        let store = Self::default();
        for p in list {
            store.policies.insert(p.id.clone(), p);
        }
        Ok(Arc::new(store))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[async_trait]
impl PolicyStoreType for InMemoryPolicyStore {
    async fn resolve(&self, policy_id: &str) -> Option<Policy> {
        self.policies.get(policy_id).map(|p| p.clone())
    }

    async fn insert(&self, policy: Policy) {
        self.policies.insert(policy.id.clone(), policy);
    }
}
