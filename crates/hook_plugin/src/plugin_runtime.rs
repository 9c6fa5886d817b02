//! Async runtime that wires **stdin / stdout** JSON‑RPC traffic to a
//! user‑supplied [`HookHandler`].
//!
//! A driver executable only has to implement the trait and hand it to
//! [`run`]:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     hook_plugin::plugin_runtime::run(MyHooks::default()).await
//! }
//! ```
//!
//! Calls are processed one at a time; the gateway keeps a pool of child
//! processes when it needs parallelism. Stdout belongs to the protocol, so
//! driver logs go to a file (`InitParams::log_dir`) or back to the gateway
//! as `log` notifications through [`HostLog`].

use std::sync::Once;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::level_filters::LevelFilter;
use tracing_appender::rolling::daily;
use tracing_subscriber::{Layer, Registry, fmt, prelude::*};

use crate::jsonrpc::{
    HOOK_FAILED, HOOK_NOT_FOUND, INVALID_PARAMS, Id, METHOD_NOT_FOUND, Message, PARSE_ERROR,
    Request, Response,
};
use crate::message::*;
use crate::plugin_actor::Method;

pub const VERSION: &str = "0.1.0";

/// Why a hook could not produce a result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookFault {
    #[error("hook '{0}' is not defined")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

impl HookFault {
    pub fn code(&self) -> i64 {
        match self {
            HookFault::NotFound(_) => HOOK_NOT_FOUND,
            HookFault::Failed(_) => HOOK_FAILED,
        }
    }
}

/// Sends driver log lines back to the gateway.
#[derive(Clone, Debug)]
pub enum HostLog {
    /// Child process: `log` notifications on stdout.
    Stdout(UnboundedSender<String>),
    /// In-process: straight into this process' `tracing` subscriber.
    Tracing,
}

impl HostLog {
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match self {
            HostLog::Stdout(tx) => {
                let params = LogParams { level, message };
                let notif = Request::notification(Method::Log, serde_json::to_value(params).ok());
                if let Ok(line) = serde_json::to_string(&notif) {
                    let _ = tx.send(format!("{line}\n"));
                }
            }
            HostLog::Tracing => match level {
                LogLevel::Trace => tracing::trace!("{message}"),
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Error => tracing::error!("{message}"),
            },
        }
    }
}

// -----------------------------------------------------------------------------
// HookHandler trait – implement this in your driver
// -----------------------------------------------------------------------------

#[async_trait]
pub trait HookHandler: Send + Sync + 'static {
    /// Load whatever the bundle needs. Called once, before any dispatch.
    async fn init(&mut self, _params: InitParams) -> InitResult {
        InitResult { success: true, error: None }
    }

    /// Entry point used by the runtime: sets up file logging, then `init`.
    async fn start(&mut self, params: InitParams) -> InitResult {
        init_logging(&params);
        self.init(params).await
    }

    /// Names of every hook this driver can run.
    fn hooks(&self) -> HooksResult;

    /// Run one hook.
    async fn dispatch(&mut self, params: DispatchParams) -> Result<DispatchResult, HookFault>;

    async fn health(&self) -> HealthResult {
        HealthResult { healthy: true, reason: None }
    }

    async fn stop(&mut self) {}

    /// Receives the channel for `log` notifications before the first call.
    fn attach_log(&mut self, _log: HostLog) {}
}

/// Installs a daily rolling file subscriber once per process when a log
/// directory is given. Without one, driver-side `tracing` stays silent.
fn init_logging(params: &InitParams) {
    static LOG_INIT: Once = Once::new();
    let Some(dir) = params.log_dir.clone() else {
        return;
    };
    let level = match params.log_level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };
    let file_name = format!("{}.log", params.bundle_id);
    LOG_INIT.call_once(move || {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("cannot create driver log dir {dir}: {e}");
            return;
        }
        let subscriber = Registry::default().with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(daily(&dir, file_name))
                .with_filter(level),
        );
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("a tracing subscriber was already installed");
        }
    });
}

// -----------------------------------------------------------------------------
// Request handling shared by the stdio loop and the in-process actor
// -----------------------------------------------------------------------------

/// Dispatch a single JSON-RPC request to `handler`. Returns `None` for
/// notifications.
pub(crate) async fn handle_request<H: HookHandler>(
    handler: &mut H,
    req: Request,
) -> Option<Response> {
    fn params<T: serde::de::DeserializeOwned>(v: Option<Value>) -> Result<T, String> {
        serde_json::from_value(v.unwrap_or(Value::Null)).map_err(|e| e.to_string())
    }

    let id = req.id.clone();
    let response = match req.method.parse::<Method>() {
        Ok(Method::Init) => match params::<InitParams>(req.params) {
            Ok(p) => {
                let res = handler.start(p).await;
                if res.success {
                    Response::success(id.clone()?, json!(res))
                } else {
                    Response::fail(id.clone()?, HOOK_FAILED, "Init failed", Some(json!(res.error)))
                }
            }
            Err(e) => Response::fail(id.clone()?, INVALID_PARAMS, "Invalid params", Some(json!(e))),
        },
        Ok(Method::Hooks) => Response::success(id.clone()?, json!(handler.hooks())),
        Ok(Method::Dispatch) => match params::<DispatchParams>(req.params) {
            Ok(p) => match handler.dispatch(p).await {
                Ok(result) => match serde_json::to_value(result) {
                    Ok(v) => Response::success(id.clone()?, v),
                    Err(e) => Response::fail(id.clone()?, HOOK_FAILED, e.to_string(), None),
                },
                Err(fault) => Response::fail(id.clone()?, fault.code(), fault.to_string(), None),
            },
            Err(e) => Response::fail(id.clone()?, INVALID_PARAMS, "Invalid params", Some(json!(e))),
        },
        Ok(Method::Health) => Response::success(id.clone()?, json!(handler.health().await)),
        Ok(Method::Stop) => {
            handler.stop().await;
            Response::success(id.clone()?, Value::Null)
        }
        Ok(Method::Log) | Err(_) => {
            tracing::warn!("unsupported method '{}'", req.method);
            Response::fail(id.clone()?, METHOD_NOT_FOUND, "Method not found", None)
        }
    };
    Some(response)
}

// -----------------------------------------------------------------------------
// Runtime function – spawn read / write loops
// -----------------------------------------------------------------------------

/// Runs the JSON‑RPC stdin/stdout loop until EOF or `stop`.
pub async fn run<H: HookHandler>(mut handler: H) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut w = BufWriter::new(io::stdout());
        while let Some(line) = rx.recv().await {
            if let Err(e) = w.write_all(line.as_bytes()).await {
                eprintln!("stdout write error: {e}");
                break;
            }
            if w.flush().await.is_err() {
                eprintln!("stdout flush error");
                break;
            }
        }
    });

    handler.attach_log(HostLog::Stdout(tx.clone()));

    let mut reader = BufReader::new(io::stdin());
    let mut line = String::new();

    while reader.read_line(&mut line).await? != 0 {
        trim_newlines(&mut line);
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Message>(&line) {
            Ok(Message::Request(req)) => {
                let stopping = req.method == Method::Stop.as_ref();
                if let Some(resp) = handle_request(&mut handler, req).await {
                    enqueue(&tx, &resp);
                }
                if stopping {
                    break;
                }
            }
            Ok(Message::Response(_)) => { /* the gateway never calls back into us */ }
            Err(e) => {
                let err = Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(e.to_string())));
                enqueue(&tx, &err);
            }
        }
        line.clear();
    }

    drop(tx);
    // HostLog clones held by the handler keep the channel open
    drop(handler);
    let _ = writer.await;
    Ok(())
}

fn enqueue(tx: &UnboundedSender<String>, resp: &Response) {
    if let Ok(line) = serde_json::to_string(resp) {
        let _ = tx.send(format!("{line}\n"));
    }
}

fn trim_newlines(s: &mut String) {
    while matches!(s.chars().last(), Some('\n' | '\r')) {
        s.pop();
    }
}
