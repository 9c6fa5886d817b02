//! Runs named hooks inside the runtime a bundle targets.
//!
//! A [`HookDriver`] exists per [`DriverKind`]; loading a bundle through it
//! yields a [`HookRuntime`] that owns whatever the bundle needs at request
//! time (compiled scripts, child processes). The pipeline only ever talks to
//! `HookRuntime`.

pub mod pool;
pub mod process;
pub mod script;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hook_plugin::message::{DispatchParams, DispatchResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CoprocessConfig;
use crate::manifest::{Bundle, DriverKind, ManifestError};

pub use process::ProcessDriver;
pub use script::ScriptDriver;

/// Why a single hook call failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookExecutionError {
    #[error("hook runtime unreachable: {0}")]
    Unreachable(String),
    #[error("hook '{0}' not found")]
    HookNotFound(String),
    #[error("hook timed out after {0:?}")]
    Timeout(Duration),
    #[error("hook call cancelled")]
    Cancelled,
    #[error("hook raised an error: {0}")]
    Fault(String),
    #[error("hook returned an invalid reply: {0}")]
    InvalidReply(String),
}

/// Per-call limits handed down from the request.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl InvokeContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

pub type Runtime = Arc<dyn HookRuntime>;

/// A bundle loaded into its runtime.
#[async_trait]
pub trait HookRuntime: Send + Sync + Debug {
    /// Hook names the runtime can currently call.
    fn hook_names(&self) -> Vec<String>;

    /// Call `params.hook`. Implementations check the name again at call
    /// time and report [`HookExecutionError::HookNotFound`].
    async fn invoke(
        &self,
        params: DispatchParams,
        ctx: &InvokeContext,
    ) -> Result<DispatchResult, HookExecutionError>;

    async fn shutdown(&self);
}

#[async_trait]
pub trait HookDriver: Send + Sync + Debug {
    fn kind(&self) -> DriverKind;
    async fn load(&self, bundle: &Bundle) -> Result<Runtime, ManifestError>;
}

/// Run `call` bounded by the context's timeout and cancellation.
pub async fn invoke_with_deadline<F>(call: F, ctx: &InvokeContext) -> Result<DispatchResult, HookExecutionError>
where
    F: Future<Output = Result<DispatchResult, HookExecutionError>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(HookExecutionError::Cancelled),
        res = tokio::time::timeout(ctx.timeout, call) => match res {
            Ok(inner) => inner,
            Err(_) => Err(HookExecutionError::Timeout(ctx.timeout)),
        },
    }
}

/// Drivers by kind.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DriverKind, Arc<dyn HookDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `rhai` and `process` drivers.
    pub fn with_defaults(cfg: &CoprocessConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ScriptDriver::new(cfg.pool_size, cfg.max_operations)));
        registry.register(Arc::new(ProcessDriver::new(cfg.pool_size, cfg.log_dir.clone())));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn HookDriver>) {
        debug!("registering driver '{}'", driver.kind());
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: DriverKind) -> Option<Arc<dyn HookDriver>> {
        self.drivers.get(&kind).cloned()
    }

    /// Load `bundle` into its driver and check every binding resolves.
    pub async fn bind(&self, bundle: &Bundle) -> Result<Runtime, ManifestError> {
        let driver = self
            .get(bundle.driver)
            .ok_or(ManifestError::DriverUnavailable(bundle.driver))?;
        let runtime = driver.load(bundle).await?;

        let known: HashSet<String> = runtime.hook_names().into_iter().collect();
        if let Some(missing) = bundle.hooks.iter().find(|h| !known.contains(&h.name)) {
            runtime.shutdown().await;
            return Err(ManifestError::UnresolvedHook {
                stage: missing.stage,
                name: missing.name.clone(),
            });
        }
        info!(bundle = %bundle.id, driver = %bundle.driver, hooks = bundle.hooks.len(), "bundle bound");
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hook_plugin::message::{HookStage, RequestObject, SessionObject};
    use std::fs;
    use tempfile::TempDir;

    fn params(hook: &str) -> DispatchParams {
        DispatchParams {
            stage: HookStage::Pre,
            hook: hook.into(),
            request: RequestObject::default(),
            session: SessionObject::default(),
            metadata: Default::default(),
            spec: Default::default(),
        }
    }

    fn rhai_bundle(script: &str, manifest: serde_json::Value) -> (TempDir, Bundle) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hooks.rhai"), script).unwrap();
        fs::write(dir.path().join("manifest.json"), manifest.to_string()).unwrap();
        let bundle = Bundle::load(dir.path()).unwrap();
        (dir, bundle)
    }

    #[tokio::test]
    async fn deadline_times_out_slow_calls() {
        let ctx = InvokeContext::new(Duration::from_millis(20), CancellationToken::new());
        let res = invoke_with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(DispatchResult::passthrough(params("slow")))
            },
            &ctx,
        )
        .await;
        assert_eq!(res.unwrap_err(), HookExecutionError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_call() {
        let cancel = CancellationToken::new();
        let ctx = InvokeContext::new(Duration::from_secs(5), cancel.clone());
        cancel.cancel();
        let res = invoke_with_deadline(std::future::pending(), &ctx).await;
        assert_eq!(res.unwrap_err(), HookExecutionError::Cancelled);
    }

    #[tokio::test]
    async fn bind_rejects_unresolved_hooks() {
        let (_dir, bundle) = rhai_bundle(
            "fn Present(request, session) { [request, session] }",
            serde_json::json!({
                "file_list": ["hooks.rhai"],
                "custom_middleware": {
                    "driver": "rhai",
                    "pre": [{"name": "Present"}],
                    "post": [{"name": "Absent"}]
                }
            }),
        );
        let registry = DriverRegistry::with_defaults(&CoprocessConfig::defaults(bundle.base_dir.as_path()));
        match registry.bind(&bundle).await {
            Err(ManifestError::UnresolvedHook { stage, name }) => {
                assert_eq!(stage, HookStage::Post);
                assert_eq!(name, "Absent");
            }
            other => panic!("expected unresolved hook, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_driver_is_reported() {
        let (_dir, bundle) = rhai_bundle(
            "fn Present(request, session) { [request, session] }",
            serde_json::json!({
                "file_list": ["hooks.rhai"],
                "custom_middleware": {"driver": "rhai", "pre": [{"name": "Present"}]}
            }),
        );
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.bind(&bundle).await,
            Err(ManifestError::DriverUnavailable(DriverKind::Rhai))
        ));
    }
}
