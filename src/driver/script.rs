//! `rhai` driver: hooks are Rhai functions.
//!
//! Every `.rhai` file in the bundle's `file_list` is compiled and merged into
//! one AST at load time. A hook is any public function taking one to four
//! parameters. `pre` and `auth_check` hooks are bound positionally to
//! `(request, session, metadata, spec)`; `post_key_auth` and `post` hooks to
//! `(request, session, spec)`, or to the full four when they declare four
//! parameters:
//!
//! ```rhai
//! fn MyPreHook(request, session) {
//!     request.set_header("x-checked", "yes");
//!     [request, session]
//! }
//!
//! fn MyPostHook(request, session, spec) {
//!     request.set_header("x-api", spec.APIID);
//!     [request, session]
//! }
//!
//! fn MyAuthCheck(request, session, metadata, spec) {
//!     if get_header(request, "authorization") == "valid_token" {
//!         session.rate = 1000.0;
//!         session.per = 1.0;
//!         metadata.token = "valid_token";
//!     }
//!     [request, session, metadata]
//! }
//! ```
//!
//! A hook returns `[request, session]`, `[request, session, metadata]` or a
//! map with `request` / `session` / `metadata` keys (missing keys keep the
//! values passed in). `raw_body` is seen by scripts as a base64 string.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hook_plugin::message::{DispatchParams, DispatchResult, HookStage, RequestObject, SessionObject};
use rhai::{AST, Array, CallFnOptions, Dynamic, Engine, EvalAltResult, FnAccess, Map, Scope};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::InstancePool;
use super::{HookDriver, HookExecutionError, HookRuntime, InvokeContext, Runtime, invoke_with_deadline};
use crate::manifest::{Bundle, DriverKind, ManifestError};

const MAX_HOOK_ARITY: usize = 4;

#[derive(Debug, Clone)]
pub struct ScriptDriver {
    pool_size: usize,
    max_operations: u64,
}

impl ScriptDriver {
    pub fn new(pool_size: usize, max_operations: u64) -> Self {
        Self { pool_size: pool_size.max(1), max_operations }
    }
}

#[async_trait]
impl HookDriver for ScriptDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Rhai
    }

    async fn load(&self, bundle: &Bundle) -> Result<Runtime, ManifestError> {
        let compiler = Engine::new();
        let mut ast = AST::empty();
        let mut compiled = 0;
        for path in bundle.file_paths() {
            if path.extension().and_then(|e| e.to_str()) != Some("rhai") {
                continue;
            }
            let src = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| ManifestError::Io { path: path.clone(), source })?;
            let file_ast = compiler
                .compile(&src)
                .map_err(|e| ManifestError::Driver(format!("{}: {e}", display_name(&path))))?;
            ast.combine(file_ast);
            compiled += 1;
        }
        if compiled == 0 {
            return Err(ManifestError::Driver("bundle lists no .rhai files".into()));
        }

        let mut arities: HashMap<String, usize> = HashMap::new();
        for f in ast.iter_functions() {
            let n = f.params.len();
            if f.access == FnAccess::Private || n == 0 || n > MAX_HOOK_ARITY {
                continue;
            }
            let entry = arities.entry(f.name.to_string()).or_insert(n);
            *entry = (*entry).max(n);
        }

        let instances = (0..self.pool_size)
            .map(|_| ScriptInstance::new(self.max_operations))
            .collect();
        debug!(bundle = %bundle.id, files = compiled, hooks = arities.len(), "compiled rhai bundle");

        Ok(Arc::new(ScriptRuntime {
            bundle_id: bundle.id.clone(),
            ast: Arc::new(ast),
            arities,
            pool: InstancePool::new(instances),
        }))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

pub struct ScriptRuntime {
    bundle_id: String,
    ast: Arc<AST>,
    arities: HashMap<String, usize>,
    pool: InstancePool<ScriptInstance>,
}

impl fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("bundle_id", &self.bundle_id)
            .field("hooks", &self.arities.keys().collect::<Vec<_>>())
            .field("pool", &self.pool)
            .finish()
    }
}

#[async_trait]
impl HookRuntime for ScriptRuntime {
    fn hook_names(&self) -> Vec<String> {
        self.arities.keys().cloned().collect()
    }

    async fn invoke(
        &self,
        params: DispatchParams,
        ctx: &InvokeContext,
    ) -> Result<DispatchResult, HookExecutionError> {
        let arity = *self
            .arities
            .get(&params.hook)
            .ok_or_else(|| HookExecutionError::HookNotFound(params.hook.clone()))?;
        let pool = self.pool.clone();
        let ast = self.ast.clone();
        let deadline = Instant::now() + ctx.timeout;
        let cancel = ctx.cancel.clone();
        let timeout = ctx.timeout;

        invoke_with_deadline(
            async move {
                let instance = pool.acquire().await?;
                // the blocking call owns the instance; it returns to the pool
                // when the script stops, even if the caller gave up
                let task = tokio::task::spawn_blocking(move || {
                    instance.guard.arm(deadline, cancel);
                    let res = call_hook(&instance, &ast, params, arity, timeout);
                    instance.guard.disarm();
                    res
                });
                task.await
                    .map_err(|e| HookExecutionError::Fault(format!("script task failed: {e}")))?
            },
            ctx,
        )
        .await
    }

    async fn shutdown(&self) {
        let idle = self.pool.close();
        debug!(bundle = %self.bundle_id, released = idle.len(), "rhai runtime shut down");
    }
}

// -----------------------------------------------------------------------------
// Engine instances
// -----------------------------------------------------------------------------

struct ScriptInstance {
    engine: Engine,
    guard: Arc<CallGuard>,
}

impl ScriptInstance {
    fn new(max_operations: u64) -> Self {
        let guard = Arc::new(CallGuard::default());
        let mut engine = Engine::new();
        engine.set_max_operations(max_operations);

        let progress = guard.clone();
        engine.on_progress(move |ops| {
            if ops & 0x7f == 0 && progress.expired() {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
        engine.on_print(|s| info!(target: "hookgate::script", "{s}"));
        engine.on_debug(|s, _src, pos| debug!(target: "hookgate::script", "{s} @ {pos}"));

        engine.register_fn("get_header", get_header);
        engine.register_fn("set_header", set_header);
        engine.register_fn("delete_header", delete_header);
        engine.register_fn("log_debug", |m: &str| debug!(target: "hookgate::script", "{m}"));
        engine.register_fn("log_info", |m: &str| info!(target: "hookgate::script", "{m}"));
        engine.register_fn("log_warn", |m: &str| warn!(target: "hookgate::script", "{m}"));
        engine.register_fn("log_error", |m: &str| error!(target: "hookgate::script", "{m}"));

        Self { engine, guard }
    }
}

/// Deadline and cancellation of the call currently running on an engine.
#[derive(Default)]
struct CallGuard {
    limits: Mutex<Option<(Instant, CancellationToken)>>,
}

impl CallGuard {
    fn set(&self, value: Option<(Instant, CancellationToken)>) {
        *self.limits.lock().unwrap_or_else(|p| p.into_inner()) = value;
    }

    fn arm(&self, deadline: Instant, cancel: CancellationToken) {
        self.set(Some((deadline, cancel)));
    }

    fn disarm(&self) {
        self.set(None);
    }

    fn expired(&self) -> bool {
        match &*self.limits.lock().unwrap_or_else(|p| p.into_inner()) {
            Some((deadline, cancel)) => cancel.is_cancelled() || Instant::now() >= *deadline,
            None => false,
        }
    }

    fn cancelled(&self) -> bool {
        matches!(
            &*self.limits.lock().unwrap_or_else(|p| p.into_inner()),
            Some((_, cancel)) if cancel.is_cancelled()
        )
    }
}

fn to_dynamic<T: Serialize>(what: &str, value: &T) -> Result<Dynamic, HookExecutionError> {
    rhai::serde::to_dynamic(value)
        .map_err(|e| HookExecutionError::Fault(format!("cannot pass {what} to script: {e}")))
}

fn call_hook(
    instance: &ScriptInstance,
    ast: &AST,
    params: DispatchParams,
    arity: usize,
    timeout: Duration,
) -> Result<DispatchResult, HookExecutionError> {
    let request = to_dynamic("request", &params.request)?;
    let session = to_dynamic("session", &params.session)?;
    let spec = to_dynamic("spec", &params.spec)?;
    let inputs = match params.stage {
        HookStage::Post | HookStage::PostKeyAuth if arity < 4 => vec![request, session, spec],
        _ => vec![request, session, to_dynamic("metadata", &params.metadata)?, spec],
    };
    let args: Vec<Dynamic> = inputs.into_iter().take(arity).collect();

    let mut scope = Scope::new();
    let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
    let out = instance
        .engine
        .call_fn_with_options::<Dynamic>(options, &mut scope, ast, &params.hook, args)
        .map_err(|err| match *err {
            EvalAltResult::ErrorTerminated(..) if instance.guard.cancelled() => HookExecutionError::Cancelled,
            EvalAltResult::ErrorTerminated(..) => HookExecutionError::Timeout(timeout),
            other => HookExecutionError::Fault(other.to_string()),
        })?;

    let value: Value = rhai::serde::from_dynamic(&out)
        .map_err(|e| HookExecutionError::InvalidReply(e.to_string()))?;
    split_reply(value, params)
}

fn split_reply(value: Value, params: DispatchParams) -> Result<DispatchResult, HookExecutionError> {
    let (request, session, metadata) = match value {
        Value::Array(items) if (2..=3).contains(&items.len()) => {
            let mut it = items.into_iter();
            (it.next(), it.next(), it.next())
        }
        Value::Object(mut map) => (map.remove("request"), map.remove("session"), map.remove("metadata")),
        other => {
            return Err(HookExecutionError::InvalidReply(format!(
                "expected [request, session] or a map, got {}",
                json_kind(&other)
            )));
        }
    };

    let request = match request {
        Some(v) => serde_json::from_value::<RequestObject>(v)
            .map_err(|e| HookExecutionError::InvalidReply(format!("request: {e}")))?,
        None => params.request,
    };
    let session = match session {
        Some(v) => serde_json::from_value::<SessionObject>(v)
            .map_err(|e| HookExecutionError::InvalidReply(format!("session: {e}")))?,
        None => params.session,
    };
    let metadata = match metadata {
        Some(Value::Object(m)) => m,
        Some(Value::Null) | None => params.metadata,
        Some(other) => {
            return Err(HookExecutionError::InvalidReply(format!(
                "metadata must be a map, got {}",
                json_kind(&other)
            )));
        }
    };
    Ok(DispatchResult { request, session, metadata })
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "nothing",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array of the wrong length",
        Value::Object(_) => "a map",
    }
}

// -----------------------------------------------------------------------------
// Script helpers
// -----------------------------------------------------------------------------

fn get_header(request: &mut Map, name: &str) -> Dynamic {
    let Some(headers) = request.get("headers").and_then(|h| h.read_lock::<Map>()) else {
        return Dynamic::UNIT;
    };
    headers
        .iter()
        .find(|(k, _)| k.as_str().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
        .unwrap_or(Dynamic::UNIT)
}

fn map_field<'a>(request: &'a mut Map, field: &str) -> &'a mut Dynamic {
    let slot = request.entry(field.into()).or_insert_with(|| Dynamic::from_map(Map::new()));
    if !slot.is_map() {
        *slot = Dynamic::from_map(Map::new());
    }
    slot
}

fn set_header(request: &mut Map, name: &str, value: &str) {
    let key = name.to_ascii_lowercase();
    for field in ["headers", "set_headers"] {
        if let Some(mut m) = map_field(request, field).write_lock::<Map>() {
            m.insert(key.as_str().into(), Dynamic::from(value.to_string()));
        }
    }
}

fn delete_header(request: &mut Map, name: &str) {
    let key = name.to_ascii_lowercase();
    if let Some(mut m) = map_field(request, "headers").write_lock::<Map>() {
        m.retain(|k, _| !k.as_str().eq_ignore_ascii_case(&key));
    }
    let slot = request
        .entry("delete_headers".into())
        .or_insert_with(|| Dynamic::from_array(Array::new()));
    if !slot.is_array() {
        *slot = Dynamic::from_array(Array::new());
    }
    if let Some(mut list) = slot.write_lock::<Array>() {
        list.push(Dynamic::from(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    async fn runtime(script: &str, pool: usize, max_ops: u64) -> (TempDir, Runtime) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hooks.rhai"), script).unwrap();
        fs::write(
            dir.path().join("manifest.json"),
            json!({"file_list": ["hooks.rhai"], "custom_middleware": {"driver": "rhai"}}).to_string(),
        )
        .unwrap();
        let bundle = Bundle::load(dir.path()).unwrap();
        let rt = ScriptDriver::new(pool, max_ops).load(&bundle).await.unwrap();
        (dir, rt)
    }

    fn params(hook: &str) -> DispatchParams {
        let mut request = RequestObject { method: "GET".into(), url: "/get".into(), ..Default::default() };
        request.headers.insert("authorization".into(), "valid_token".into());
        DispatchParams {
            stage: HookStage::Pre,
            hook: hook.into(),
            request,
            session: SessionObject::default(),
            metadata: Default::default(),
            spec: BTreeMap::from([("APIID".to_string(), "api-1".to_string())]),
        }
    }

    fn ctx(ms: u64) -> InvokeContext {
        InvokeContext::new(Duration::from_millis(ms), CancellationToken::new())
    }

    #[tokio::test]
    async fn public_functions_with_hook_arity_are_hooks() {
        let (_d, rt) = runtime(
            r#"
            fn One(r) { [r, #{}] }
            fn Four(r, s, m, spec) { [r, s, m] }
            private fn Hidden(r, s) { [r, s] }
            fn helper() { 1 }
            "#,
            1,
            0,
        )
        .await;
        let mut names = rt.hook_names();
        names.sort();
        assert_eq!(names, vec!["Four".to_string(), "One".to_string()]);
    }

    #[tokio::test]
    async fn helpers_edit_headers_and_metadata() {
        let (_d, rt) = runtime(
            r#"
            fn Auth(request, session, metadata, spec) {
                if get_header(request, "Authorization") == "valid_token" {
                    session.rate = 1000;
                    metadata.token = "valid_token";
                    metadata.api = spec.APIID;
                }
                request.set_header("X-Seen", "1");
                request.delete_header("Authorization");
                [request, session, metadata]
            }
            "#,
            1,
            0,
        )
        .await;
        let out = rt.invoke(params("Auth"), &ctx(2_000)).await.unwrap();
        assert_eq!(out.session.rate, Some(1000.0));
        assert_eq!(out.metadata["token"], json!("valid_token"));
        assert_eq!(out.metadata["api"], json!("api-1"));
        assert_eq!(out.request.set_headers["x-seen"], "1");
        assert_eq!(out.request.headers.get("x-seen").map(String::as_str), Some("1"));
        assert!(!out.request.headers.contains_key("authorization"));
        assert_eq!(out.request.delete_headers, vec!["authorization".to_string()]);
    }

    #[tokio::test]
    async fn post_hooks_take_spec_as_third_argument() {
        let (_d, rt) = runtime(
            r#"
            fn MyPostHook(request, session, spec) {
                request.set_header("x-apiid", `${spec.APIID}`);
                [request, session]
            }
            fn FullPost(request, session, metadata, spec) {
                metadata.api = spec.APIID;
                [request, session, metadata]
            }
            "#,
            1,
            0,
        )
        .await;
        for stage in [HookStage::Post, HookStage::PostKeyAuth] {
            let mut p = params("MyPostHook");
            p.stage = stage;
            let out = rt.invoke(p, &ctx(2_000)).await.unwrap();
            assert_eq!(out.request.set_headers["x-apiid"], "api-1", "{stage}");
        }

        let mut p = params("FullPost");
        p.stage = HookStage::Post;
        let out = rt.invoke(p, &ctx(2_000)).await.unwrap();
        assert_eq!(out.metadata["api"], json!("api-1"));
    }

    #[tokio::test]
    async fn map_reply_keeps_missing_parts() {
        let (_d, rt) = runtime(
            r#"fn Rewrite(request) { request.url = "/test2"; #{ request: request } }"#,
            1,
            0,
        )
        .await;
        let mut p = params("Rewrite");
        p.session.alias = "kept".into();
        let out = rt.invoke(p, &ctx(2_000)).await.unwrap();
        assert_eq!(out.request.url, "/test2");
        assert_eq!(out.session.alias, "kept");
    }

    #[tokio::test]
    async fn wrong_shapes_are_invalid_replies() {
        let (_d, rt) = runtime(
            r#"
            fn Number(r, s) { 42 }
            fn Short(r, s) { [r] }
            fn BadRequest(r, s) { [1, s] }
            "#,
            1,
            0,
        )
        .await;
        for hook in ["Number", "Short", "BadRequest"] {
            let err = rt.invoke(params(hook), &ctx(2_000)).await.unwrap_err();
            assert!(matches!(err, HookExecutionError::InvalidReply(_)), "{hook}: {err:?}");
        }
    }

    #[tokio::test]
    async fn script_errors_are_faults_and_unknown_names_not_found() {
        let (_d, rt) = runtime(r#"fn Boom(r, s) { throw "nope"; }"#, 1, 0).await;
        assert!(matches!(
            rt.invoke(params("Boom"), &ctx(2_000)).await,
            Err(HookExecutionError::Fault(msg)) if msg.contains("nope")
        ));
        assert_eq!(
            rt.invoke(params("Gone"), &ctx(2_000)).await.unwrap_err(),
            HookExecutionError::HookNotFound("Gone".into())
        );
    }

    #[tokio::test]
    async fn runaway_script_times_out_and_frees_its_engine() {
        let (_d, rt) = runtime(
            r#"
            fn Spin(r, s) { loop { } }
            fn Quick(r, s) { [r, s] }
            "#,
            1,
            0,
        )
        .await;
        let err = rt.invoke(params("Spin"), &ctx(50)).await.unwrap_err();
        assert_eq!(err, HookExecutionError::Timeout(Duration::from_millis(50)));
        // single engine: this only succeeds once the spinning call stopped
        assert!(rt.invoke(params("Quick"), &ctx(5_000)).await.is_ok());
    }

    #[tokio::test]
    async fn operation_budget_is_enforced() {
        let (_d, rt) = runtime(r#"fn Busy(r, s) { let x = 0; loop { x += 1; } }"#, 1, 10_000).await;
        assert!(matches!(
            rt.invoke(params("Busy"), &ctx(10_000)).await,
            Err(HookExecutionError::Fault(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_the_call() {
        let (_d, rt) = runtime(r#"fn Spin(r, s) { loop { } }"#, 1, 0).await;
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        let err = rt
            .invoke(params("Spin"), &InvokeContext::new(Duration::from_secs(10), cancel))
            .await
            .unwrap_err();
        assert_eq!(err, HookExecutionError::Cancelled);
    }

    #[tokio::test]
    async fn compile_errors_refuse_the_bundle() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.rhai"), "fn broken( {").unwrap();
        fs::write(
            dir.path().join("manifest.json"),
            json!({"file_list": ["bad.rhai"], "custom_middleware": {"driver": "rhai"}}).to_string(),
        )
        .unwrap();
        let bundle = Bundle::load(dir.path()).unwrap();
        assert!(matches!(
            ScriptDriver::new(1, 0).load(&bundle).await,
            Err(ManifestError::Driver(msg)) if msg.starts_with("bad.rhai")
        ));
    }
}
