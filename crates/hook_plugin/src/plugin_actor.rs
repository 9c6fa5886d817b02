use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jsonrpc::{Id, Message, Request, Response};
use crate::message::*;
use crate::plugin_runtime::{HookHandler, HostLog, handle_request};

// -----------------------------------------------------------------------------
// Methods spoken between gateway and driver
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    Init,
    Hooks,
    Dispatch,
    Health,
    Stop,
    /// Driver → gateway notification.
    Log,
}

/// What can go wrong on a round trip to a driver.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("plugin '{0}' is not running")]
    Closed(String),
    #[error("plugin replied with error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("plugin reply could not be decoded: {0}")]
    InvalidReply(String),
}

type Envelope = (Request, oneshot::Sender<Response>);

/// Speaks JSON-RPC to one driver instance, in-process or as a child.
#[derive(Clone, Debug)]
pub struct PluginHandle {
    tx: mpsc::Sender<Envelope>,
    plugin_id: String,
    shutdown: CancellationToken,
}

impl PluginHandle {
    pub fn id(&self) -> &str {
        &self.plugin_id
    }

    pub async fn call(&self, req: Request) -> Result<Response, CallError> {
        let (tx_resp, rx_resp) = oneshot::channel();
        self.tx
            .send((req, tx_resp))
            .await
            .map_err(|_| CallError::Closed(self.plugin_id.clone()))?;
        rx_resp.await.map_err(|_| CallError::Closed(self.plugin_id.clone()))
    }

    /// Call any method and deserialize `.result` into `T`.
    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
    ) -> Result<T, CallError> {
        let req = Request::call(Id::String(Uuid::new_v4().to_string()), method, params);
        let rsp = self.call(req).await?;
        if let Some(err) = rsp.error {
            return Err(CallError::Rpc { code: err.code, message: err.message });
        }
        let v = rsp
            .result
            .ok_or_else(|| CallError::InvalidReply("no result field".into()))?;
        serde_json::from_value(v).map_err(|e| CallError::InvalidReply(e.to_string()))
    }

    fn to_params<P: Serialize>(p: &P) -> Result<Option<Value>, CallError> {
        serde_json::to_value(p)
            .map(Some)
            .map_err(|e| CallError::InvalidReply(e.to_string()))
    }

    pub async fn init(&self, params: InitParams) -> Result<InitResult, CallError> {
        self.rpc_call(Method::Init, Self::to_params(&params)?).await
    }

    pub async fn hooks(&self) -> Result<HooksResult, CallError> {
        self.rpc_call(Method::Hooks, None).await
    }

    pub async fn dispatch(&self, params: &DispatchParams) -> Result<DispatchResult, CallError> {
        self.rpc_call(Method::Dispatch, Self::to_params(params)?).await
    }

    pub async fn health(&self) -> Result<HealthResult, CallError> {
        self.rpc_call(Method::Health, None).await
    }

    /// Ask the driver to stop, then tear the actor down.
    pub async fn stop(&self) {
        let _: Result<Value, _> = self.rpc_call(Method::Stop, None).await;
        self.shutdown();
    }

    /// Tear the actor down without asking; a child process is killed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    /* ────────────────────────────────────────────────────────────────────────
     * 1)  In-process actor
     * ──────────────────────────────────────────────────────────────────────── */
    pub fn in_process<H: HookHandler>(mut handler: H) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(32);
        let shutdown = CancellationToken::new();
        handler.attach_log(HostLog::Tracing);

        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    msg = rx.recv() => {
                        let Some((req, rsp_tx)) = msg else { break };
                        if let Some(rsp) = handle_request(&mut handler, req).await {
                            let _ = rsp_tx.send(rsp);
                        }
                    }
                }
            }
        });

        Self { tx, plugin_id: "in-process".into(), shutdown }
    }
}

/* ────────────────────────────────────────────────────────────────────────
 * 2)  Child-process (binary on disk)
 * ──────────────────────────────────────────────────────────────────────── */

/// Launch `exe_path` with `cwd` as working directory and wire JSON-RPC over
/// stdin/stdout. `log` notifications from the child are re-emitted as
/// `tracing` events. The child is killed when the handle shuts down or the
/// last handle clone is dropped.
pub fn spawn_plugin<P: AsRef<Path>, C: AsRef<Path>>(
    exe_path: P,
    cwd: C,
) -> anyhow::Result<PluginHandle> {
    let mut child = TokioCommand::new(exe_path.as_ref())
        .current_dir(cwd.as_ref())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("stdin unavailable"))?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout unavailable"))?;

    let plugin_id = format!(
        "{}-{}",
        exe_path
            .as_ref()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("plugin"),
        child.id().unwrap_or_default()
    );

    let (tx, mut rx) = mpsc::channel::<Envelope>(32);
    let shutdown = CancellationToken::new();

    // track in-flight calls by encoded `id`
    let inflight: Arc<DashMap<String, oneshot::Sender<Response>>> = Arc::new(DashMap::new());

    // ── task that proxies rx → child.stdin ───────────────────────────
    {
        let inflight = Arc::clone(&inflight);
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (req, rsp_tx) = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };
                let Ok(line) = serde_json::to_string(&req) else { continue };
                if let Some(id) = &req.id {
                    if let Ok(key) = serde_json::to_string(id) {
                        inflight.insert(key, rsp_tx);
                    }
                }
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    token.cancel();
                    break;
                }
            }
        });
    }

    // ── task that reads child.stdout → routes Response|notification ──
    {
        let inflight = Arc::clone(&inflight);
        let token = shutdown.clone();
        let plugin_id = plugin_id.clone();
        tokio::spawn(async move {
            let mut rdr = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    line = rdr.next_line() => match line {
                        Ok(Some(l)) => l,
                        _ => break,
                    },
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(&line) {
                    Ok(Message::Response(rsp)) => {
                        let Ok(key) = serde_json::to_string(&rsp.id) else { continue };
                        if let Some((_, tx_rsp)) = inflight.remove(&key) {
                            let _ = tx_rsp.send(rsp);
                        }
                    }
                    Ok(Message::Request(req)) => forward_notification(&plugin_id, req),
                    Err(e) => tracing::debug!(plugin = %plugin_id, "ignoring bad line: {e}"),
                }
            }
            token.cancel();
            let _ = child.kill().await;
            // wake every caller still waiting
            inflight.clear();
            tracing::debug!(plugin = %plugin_id, "plugin stopped");
        });
    }

    Ok(PluginHandle { tx, plugin_id, shutdown })
}

fn forward_notification(plugin_id: &str, req: Request) {
    if req.method != Method::Log.as_ref() {
        tracing::debug!(plugin = %plugin_id, "ignoring '{}' from plugin", req.method);
        return;
    }
    let Some(Ok(p)) = req.params.map(serde_json::from_value::<LogParams>) else {
        return;
    };
    let message = p.message;
    match p.level {
        LogLevel::Trace => tracing::trace!(plugin = %plugin_id, "{message}"),
        LogLevel::Debug => tracing::debug!(plugin = %plugin_id, "{message}"),
        LogLevel::Info => tracing::info!(plugin = %plugin_id, "{message}"),
        LogLevel::Warn => tracing::warn!(plugin = %plugin_id, "{message}"),
        LogLevel::Error => tracing::error!(plugin = %plugin_id, "{message}"),
    }
}
