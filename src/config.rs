use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Read-only source of configuration values.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    /// Parse `key`, falling back to `default` when unset or unparsable.
    pub async fn parsed_or<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.0.get(key).await {
            None => default,
            Some(raw) => match raw.trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    warn!(%key, value = %raw, "ignoring invalid config value, using default");
                    default
                }
            },
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded once from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        } else {
            info!("no .env at {}, using process environment", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// Fixed set of values, mostly for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(entries: &[(&str, &str)]) -> Box<Self> {
        let mgr = Self::default();
        for (k, v) in entries {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        Box::new(mgr)
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

// -----------------------------------------------------------------------------
// Coprocess settings
// -----------------------------------------------------------------------------

pub const COPROCESS_ENABLED: &str = "COPROCESS_ENABLED";
pub const COPROCESS_HOOK_TIMEOUT_MS: &str = "COPROCESS_HOOK_TIMEOUT_MS";
pub const COPROCESS_POOL_SIZE: &str = "COPROCESS_POOL_SIZE";
pub const COPROCESS_BUNDLES_DIR: &str = "COPROCESS_BUNDLES_DIR";
pub const COPROCESS_MAX_OPERATIONS: &str = "COPROCESS_MAX_OPERATIONS";
pub const COPROCESS_LOG_DIR: &str = "COPROCESS_LOG_DIR";

/// Gateway-wide knobs for hook execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CoprocessConfig {
    pub enabled: bool,
    /// Per-hook deadline.
    #[serde(with = "millis")]
    #[schemars(with = "u64")]
    pub hook_timeout: Duration,
    /// Instances kept per bound bundle.
    pub pool_size: usize,
    pub bundles_dir: PathBuf,
    /// Operation budget for one script call.
    pub max_operations: u64,
    /// Where out-of-process drivers write their own logs.
    pub log_dir: Option<PathBuf>,
}

impl CoprocessConfig {
    pub fn defaults(root: &Path) -> Self {
        CoprocessConfig {
            enabled: true,
            hook_timeout: Duration::from_millis(5_000),
            pool_size: 4,
            bundles_dir: root.join("bundles"),
            max_operations: 1_000_000,
            log_dir: None,
        }
    }

    pub async fn from_config(config: &ConfigManager, root: &Path) -> Self {
        let defaults = Self::defaults(root);
        let timeout_ms = config
            .parsed_or(COPROCESS_HOOK_TIMEOUT_MS, defaults.hook_timeout.as_millis() as u64)
            .await;
        let pool_size = config.parsed_or(COPROCESS_POOL_SIZE, defaults.pool_size).await;
        CoprocessConfig {
            enabled: config.parsed_or(COPROCESS_ENABLED, defaults.enabled).await,
            hook_timeout: Duration::from_millis(timeout_ms.max(1)),
            pool_size: pool_size.max(1),
            bundles_dir: config
                .0
                .get(COPROCESS_BUNDLES_DIR)
                .await
                .map(PathBuf::from)
                .unwrap_or(defaults.bundles_dir),
            max_operations: config
                .parsed_or(COPROCESS_MAX_OPERATIONS, defaults.max_operations)
                .await,
            log_dir: config.0.get(COPROCESS_LOG_DIR).await.map(PathBuf::from),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::with(&[("foo", "bar")]);
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));
        assert_eq!(mgr.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "HOOKGATE_TEST_POOL=7\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("HOOKGATE_TEST_POOL").await, Some("7".to_string()));
    }

    #[tokio::test]
    async fn coprocess_defaults_apply_to_empty_config() {
        let config = ConfigManager(MapConfigManager::new());
        let cfg = CoprocessConfig::from_config(&config, Path::new("/srv/hookgate")).await;
        assert_eq!(cfg, CoprocessConfig::defaults(Path::new("/srv/hookgate")));
        assert_eq!(cfg.hook_timeout, Duration::from_secs(5));
        assert_eq!(cfg.bundles_dir, PathBuf::from("/srv/hookgate/bundles"));
    }

    #[tokio::test]
    async fn coprocess_values_are_read_and_bad_numbers_fall_back() {
        let config = ConfigManager(MapConfigManager::with(&[
            (COPROCESS_ENABLED, "false"),
            (COPROCESS_HOOK_TIMEOUT_MS, "250"),
            (COPROCESS_POOL_SIZE, "lots"),
            (COPROCESS_BUNDLES_DIR, "/opt/bundles"),
            (COPROCESS_LOG_DIR, "/var/log/hooks"),
        ]));
        let cfg = CoprocessConfig::from_config(&config, Path::new(".")).await;
        assert!(!cfg.enabled);
        assert_eq!(cfg.hook_timeout, Duration::from_millis(250));
        assert_eq!(cfg.pool_size, 4);
        assert_eq!(cfg.bundles_dir, PathBuf::from("/opt/bundles"));
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/var/log/hooks")));
    }

    #[test]
    fn config_manager_survives_serde() {
        let config = ConfigManager(MapConfigManager::with(&[("a", "1")]));
        let json = serde_json::to_string(&config).unwrap();
        let back: ConfigManager = serde_json::from_str(&json).unwrap();
        assert_eq!(format!("{back:?}"), "MapConfigManager(1 entries)");
    }
}
