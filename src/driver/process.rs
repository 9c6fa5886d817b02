//! `process` driver: the first entry of `file_list` is an executable that
//! speaks the `hook_plugin` JSON-RPC protocol on stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hook_plugin::jsonrpc::HOOK_NOT_FOUND;
use hook_plugin::message::{DispatchParams, DispatchResult, InitParams, LogLevel};
use hook_plugin::plugin_actor::{CallError, PluginHandle, spawn_plugin};
use hook_plugin::plugin_runtime::VERSION;
use tracing::{debug, info, warn};

use super::pool::InstancePool;
use super::{HookDriver, HookExecutionError, HookRuntime, InvokeContext, Runtime, invoke_with_deadline};
use crate::manifest::{Bundle, DriverKind, ManifestError};

/// How long a child gets to answer `init` / `hooks` at load time.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ProcessDriver {
    pool_size: usize,
    log_dir: Option<PathBuf>,
}

impl ProcessDriver {
    pub fn new(pool_size: usize, log_dir: Option<PathBuf>) -> Self {
        Self { pool_size: pool_size.max(1), log_dir }
    }
}

#[async_trait]
impl HookDriver for ProcessDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Process
    }

    async fn load(&self, bundle: &Bundle) -> Result<Runtime, ManifestError> {
        let exe = bundle
            .file_paths()
            .into_iter()
            .next()
            .ok_or(ManifestError::EmptyFileList)?;
        let launcher = Launcher {
            exe,
            cwd: bundle.base_dir.clone(),
            init: InitParams {
                version: VERSION.to_string(),
                bundle_id: bundle.id.clone(),
                base_dir: bundle.base_dir.to_string_lossy().into_owned(),
                files: bundle.file_list.clone(),
                log_level: LogLevel::Info,
                log_dir: self.log_dir.as_ref().map(|d| d.to_string_lossy().into_owned()),
            },
        };

        // one child up front so the hook list is known at bind time
        let first = tokio::time::timeout(STARTUP_TIMEOUT, launcher.start())
            .await
            .map_err(|_| ManifestError::Driver("driver did not start in time".into()))?
            .map_err(|e| ManifestError::Driver(e.to_string()))?;
        let hooks = tokio::time::timeout(STARTUP_TIMEOUT, first.hooks())
            .await
            .map_err(|_| ManifestError::Driver("driver did not list its hooks in time".into()))?
            .map_err(|e| ManifestError::Driver(e.to_string()))?
            .hooks;
        info!(bundle = %bundle.id, plugin = %first.id(), hooks = hooks.len(), "driver process started");

        let mut slots = vec![Some(first)];
        slots.resize_with(self.pool_size, || None);

        Ok(Arc::new(ProcessRuntime {
            bundle_id: bundle.id.clone(),
            launcher,
            hooks,
            pool: InstancePool::new(slots),
        }))
    }
}

#[derive(Debug, Clone)]
struct Launcher {
    exe: PathBuf,
    cwd: PathBuf,
    init: InitParams,
}

impl Launcher {
    async fn start(&self) -> Result<PluginHandle, HookExecutionError> {
        let handle = spawn_plugin(&self.exe, &self.cwd)
            .map_err(|e| HookExecutionError::Unreachable(format!("{}: {e}", self.exe.display())))?;
        let res = handle.init(self.init.clone()).await.map_err(|e| {
            handle.shutdown();
            HookExecutionError::Unreachable(e.to_string())
        })?;
        if !res.success {
            handle.shutdown();
            return Err(HookExecutionError::Unreachable(
                res.error.unwrap_or_else(|| "driver refused init".into()),
            ));
        }
        Ok(handle)
    }
}

/// One child per pool slot; empty slots are filled on first use.
#[derive(Debug)]
pub struct ProcessRuntime {
    bundle_id: String,
    launcher: Launcher,
    hooks: Vec<String>,
    pool: InstancePool<Option<PluginHandle>>,
}

fn map_call_error(hook: &str, err: CallError) -> HookExecutionError {
    match err {
        CallError::Closed(id) => HookExecutionError::Unreachable(format!("plugin '{id}' is not running")),
        CallError::Rpc { code, .. } if code == HOOK_NOT_FOUND => HookExecutionError::HookNotFound(hook.to_string()),
        CallError::Rpc { message, .. } => HookExecutionError::Fault(message),
        CallError::InvalidReply(msg) => HookExecutionError::InvalidReply(msg),
    }
}

#[async_trait]
impl HookRuntime for ProcessRuntime {
    fn hook_names(&self) -> Vec<String> {
        self.hooks.clone()
    }

    async fn invoke(
        &self,
        params: DispatchParams,
        ctx: &InvokeContext,
    ) -> Result<DispatchResult, HookExecutionError> {
        let started = Instant::now();
        let mut slot = invoke_slot(&self.pool, ctx).await?;

        let handle = match &*slot {
            Some(h) if !h.is_closed() => h.clone(),
            _ => {
                let h = invoke_start(&self.launcher, ctx).await?;
                debug!(bundle = %self.bundle_id, plugin = %h.id(), "driver process (re)started");
                *slot = Some(h.clone());
                h
            }
        };

        let hook = params.hook.clone();
        let remaining = InvokeContext::new(ctx.timeout.saturating_sub(started.elapsed()), ctx.cancel.clone());
        let res = invoke_with_deadline(
            async { handle.dispatch(&params).await.map_err(|e| map_call_error(&hook, e)) },
            &remaining,
        )
        .await;

        match res {
            Err(HookExecutionError::Timeout(_)) => {
                warn!(bundle = %self.bundle_id, plugin = %handle.id(), %hook, "hook timed out, replacing driver process");
                handle.shutdown();
                *slot = None;
                Err(HookExecutionError::Timeout(ctx.timeout))
            }
            Err(e @ (HookExecutionError::Cancelled | HookExecutionError::Unreachable(_))) => {
                handle.shutdown();
                *slot = None;
                Err(e)
            }
            other => other,
        }
    }

    async fn shutdown(&self) {
        for handle in self.pool.close().into_iter().flatten() {
            handle.stop().await;
        }
        debug!(bundle = %self.bundle_id, "process runtime shut down");
    }
}

async fn invoke_slot(
    pool: &InstancePool<Option<PluginHandle>>,
    ctx: &InvokeContext,
) -> Result<super::pool::PooledInstance<Option<PluginHandle>>, HookExecutionError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(HookExecutionError::Cancelled),
        res = tokio::time::timeout(ctx.timeout, pool.acquire()) => {
            res.map_err(|_| HookExecutionError::Timeout(ctx.timeout))?
        }
    }
}

async fn invoke_start(launcher: &Launcher, ctx: &InvokeContext) -> Result<PluginHandle, HookExecutionError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(HookExecutionError::Cancelled),
        res = tokio::time::timeout(ctx.timeout, launcher.start()) => {
            res.map_err(|_| HookExecutionError::Timeout(ctx.timeout))?
        }
    }
}
