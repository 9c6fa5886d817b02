//! Stage sequencing for one request.
//!
//! ```text
//!  PRE ──► AUTH ──► POST_AUTH ──► POST ──► PROXY
//!   │        │          │           │
//!   └────────┴──────────┴───────────┴──► OVERRIDE | REJECTED
//! ```
//!
//! `PRE` is skipped when no `pre` hooks are bound; keyless APIs go from
//! `PRE` straight to `POST`. After every hook the request is checked for a
//! return override before its edits are applied to the live request.

pub mod overrides;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hook_plugin::message::{DispatchParams, DispatchResult, HookStage, RequestObject, SessionObject};
use http::{Method, Uri};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum_macros::{AsRefStr, Display};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::api::ApiDefinition;
use crate::codec::{self, LiveRequest};
use crate::driver::{HookExecutionError, InvokeContext, Runtime};
use crate::logger::HookMetrics;
use crate::manifest::Bundle;
use crate::policy::PolicyStore;
use crate::quota::{self, QuotaOutcome};
use crate::session::{SessionState, SessionStore};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Pre,
    Auth,
    PostAuth,
    Post,
    Proxy,
    Override,
    /// Terminal failure: auth rejection, exhausted quota or a failed hook.
    /// `termination_reason` tells them apart.
    Rejected,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TerminationReason {
    None,
    Override,
    AuthRejected,
    HookError,
    QuotaExceeded,
}

/// A response produced by the pipeline instead of proxying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HookResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HookResponse {
    /// `{"error": message}` with a JSON content type.
    pub fn error(status: u16, message: &str) -> Self {
        HookResponse {
            status,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: json!({ "error": message }).to_string(),
        }
    }
}

/// URL rewrite / method transform already evaluated by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RouteDecision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl RouteDecision {
    pub fn is_empty(&self) -> bool {
        self.rewrite_to.is_none() && self.method.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineResult {
    pub final_request: RequestObject,
    pub final_session: SessionObject,
    /// Store key of the authorised session, if any.
    pub session_key: Option<String>,
    /// Terminal state reached.
    pub state: PipelineState,
    /// States visited, in order.
    pub path: Vec<PipelineState>,
    pub terminated: bool,
    pub termination_reason: TerminationReason,
    /// What to send back when `terminated`.
    pub response: Option<HookResponse>,
}

/// A bundle together with its loaded runtime.
#[derive(Debug, Clone)]
pub struct BoundBundle {
    pub bundle: Arc<Bundle>,
    pub runtime: Runtime,
}

/// Everything one execution carries between stages.
struct Run {
    request: RequestObject,
    session: SessionObject,
    metadata: Map<String, Value>,
    session_key: Option<String>,
    path: Vec<PipelineState>,
}

struct Halt {
    state: PipelineState,
    reason: TerminationReason,
    response: HookResponse,
}

impl Halt {
    fn auth_rejected() -> Self {
        Halt {
            state: PipelineState::Rejected,
            reason: TerminationReason::AuthRejected,
            response: HookResponse::error(403, "Key not authorised"),
        }
    }

    fn quota_exceeded() -> Self {
        Halt {
            state: PipelineState::Rejected,
            reason: TerminationReason::QuotaExceeded,
            response: HookResponse::error(403, "Quota exceeded"),
        }
    }

    /// Ends in `Rejected` like an auth failure, but answers 500.
    fn hook_error() -> Self {
        Halt {
            state: PipelineState::Rejected,
            reason: TerminationReason::HookError,
            response: HookResponse::error(500, "There was a problem proxying the request"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    api: Arc<ApiDefinition>,
    hooks: Option<BoundBundle>,
    sessions: SessionStore,
    policies: PolicyStore,
    hook_timeout: Duration,
    metrics: HookMetrics,
}

impl Pipeline {
    pub fn new(
        api: Arc<ApiDefinition>,
        hooks: Option<BoundBundle>,
        sessions: SessionStore,
        policies: PolicyStore,
        hook_timeout: Duration,
    ) -> Self {
        Pipeline { api, hooks, sessions, policies, hook_timeout, metrics: HookMetrics::new() }
    }

    pub fn api(&self) -> &ApiDefinition {
        &self.api
    }

    pub fn bundle(&self) -> Option<&Arc<Bundle>> {
        self.hooks.as_ref().map(|b| &b.bundle)
    }

    pub async fn shutdown(&self) {
        if let Some(bound) = &self.hooks {
            bound.runtime.shutdown().await;
        }
    }

    /// Run every applicable stage against `live`. Never fails: errors end
    /// up as a rendered response in the result.
    #[instrument(
        name = "pipeline",
        skip_all,
        fields(
            request_id = %Uuid::new_v4(),
            api = %self.api.api_id,
            method = %live.method(),
            path = %live.uri().path()
        )
    )]
    pub async fn execute(
        &self,
        live: &mut LiveRequest,
        route: &RouteDecision,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        codec::mark_original(live);
        let mut run = Run {
            request: codec::encode_request(live),
            session: SessionObject::default(),
            metadata: Map::new(),
            session_key: None,
            path: Vec::new(),
        };

        let result = match self.walk(live, route, cancel, &mut run).await {
            Ok(()) => {
                run.path.push(PipelineState::Proxy);
                PipelineResult {
                    final_request: codec::encode_request(live),
                    final_session: run.session,
                    session_key: run.session_key,
                    state: PipelineState::Proxy,
                    path: run.path,
                    terminated: false,
                    termination_reason: TerminationReason::None,
                    response: None,
                }
            }
            Err(halt) => {
                run.path.push(halt.state);
                PipelineResult {
                    final_request: run.request,
                    final_session: run.session,
                    session_key: run.session_key,
                    state: halt.state,
                    path: run.path,
                    terminated: true,
                    termination_reason: halt.reason,
                    response: Some(halt.response),
                }
            }
        };

        self.metrics.record_outcome(result.termination_reason.as_ref());
        info!(
            target: "request",
            api = %self.api.api_id,
            state = %result.state,
            reason = %result.termination_reason,
            "pipeline finished"
        );
        result
    }

    async fn walk(
        &self,
        live: &mut LiveRequest,
        route: &RouteDecision,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<(), Halt> {
        if self.has_hooks(HookStage::Pre) {
            run.path.push(PipelineState::Pre);
            self.run_stage(HookStage::Pre, live, run, cancel).await?;
        }

        if !self.api.use_keyless_access {
            if self.api.enable_coprocess_auth {
                run.path.push(PipelineState::Auth);
                self.authenticate(live, run, cancel).await?;
            } else {
                self.lookup_key(run).await?;
            }
            run.path.push(PipelineState::PostAuth);
            self.run_stage(HookStage::PostKeyAuth, live, run, cancel).await?;
        }

        run.path.push(PipelineState::Post);
        self.apply_route(route, live, run)?;
        self.run_stage(HookStage::Post, live, run, cancel).await
    }

    fn has_hooks(&self, stage: HookStage) -> bool {
        self.hooks
            .as_ref()
            .is_some_and(|b| b.bundle.hooks_for(stage).next().is_some())
    }

    fn spec(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("APIID".to_string(), self.api.api_id.clone()),
            ("OrgID".to_string(), self.api.org_id.clone()),
            ("config_data".to_string(), self.api.config_data.to_string()),
        ])
    }

    /// Hooks of `stage` in declared order, each seeing the previous one's
    /// output.
    async fn run_stage(
        &self,
        stage: HookStage,
        live: &mut LiveRequest,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let Some(bound) = &self.hooks else { return Ok(()) };
        for binding in bound.bundle.hooks_for(stage) {
            let out = self
                .invoke(&bound.runtime, stage, &binding.name, run, cancel)
                .await
                .map_err(|e| self.hook_failed(stage, &binding.name, e))?;
            self.settle(stage, &binding.name, out, live, run)?;
        }
        Ok(())
    }

    async fn invoke(
        &self,
        runtime: &Runtime,
        stage: HookStage,
        name: &str,
        run: &Run,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, HookExecutionError> {
        let params = DispatchParams {
            stage,
            hook: name.to_string(),
            request: run.request.clone(),
            session: run.session.clone(),
            metadata: run.metadata.clone(),
            spec: self.spec(),
        };
        let ctx = InvokeContext::new(self.hook_timeout, cancel.clone());
        let started = Instant::now();
        let res = runtime
            .invoke(params, &ctx)
            .instrument(info_span!("hook", %stage, hook = %name))
            .await;
        let elapsed = started.elapsed();
        self.metrics.record_hook(stage.as_ref(), name, elapsed, res.is_ok());
        debug!(%stage, hook = %name, elapsed_ms = elapsed.as_millis() as u64, ok = res.is_ok(), "hook returned");
        res
    }

    /// Take a hook's output: stop on an override, otherwise apply its edits
    /// to the live request and re-encode.
    fn settle(
        &self,
        stage: HookStage,
        hook: &str,
        out: DispatchResult,
        live: &mut LiveRequest,
        run: &mut Run,
    ) -> Result<(), Halt> {
        run.request = out.request;
        run.session = out.session;
        run.metadata = out.metadata;

        if let Some(ov) = overrides::check(&run.request) {
            return Err(match overrides::render(&ov) {
                Ok(response) => {
                    info!(%stage, %hook, status = response.status, "hook returned an override");
                    Halt { state: PipelineState::Override, reason: TerminationReason::Override, response }
                }
                Err(e) => self.hook_failed(stage, hook, e),
            });
        }

        codec::decode_request(&run.request, live)
            .map_err(|e| self.hook_failed(stage, hook, HookExecutionError::InvalidReply(e.to_string())))?;
        run.request = codec::encode_request(live);
        Ok(())
    }

    fn hook_failed(&self, stage: HookStage, hook: &str, err: HookExecutionError) -> Halt {
        warn!(%stage, %hook, error = %err, "hook failed");
        if stage == HookStage::Auth {
            Halt::auth_rejected()
        } else {
            Halt::hook_error()
        }
    }

    async fn authenticate(
        &self,
        live: &mut LiveRequest,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let Some((bound, name)) = self
            .hooks
            .as_ref()
            .and_then(|b| b.bundle.auth_hook().map(|h| (b, h.name.clone())))
        else {
            warn!("coprocess auth enabled without an auth hook");
            return Err(Halt::auth_rejected());
        };

        run.session = SessionObject::default();
        let out = self
            .invoke(&bound.runtime, HookStage::Auth, &name, run, cancel)
            .await
            .map_err(|e| self.hook_failed(HookStage::Auth, &name, e))?;
        self.settle(HookStage::Auth, &name, out, live, run)?;

        let mut state = SessionState::default();
        codec::decode_session(&run.session, &mut state);
        if !state.apply_policy_id.is_empty() {
            match self.policies.resolve(&state.apply_policy_id).await {
                Some(policy) => policy.apply(&mut state),
                None => {
                    warn!(policy = %state.apply_policy_id, "auth hook applied an unknown policy");
                    return Err(Halt::auth_rejected());
                }
            }
        } else if !grants_access(&run.session) {
            debug!(hook = %name, "auth hook did not authorise the session");
            return Err(Halt::auth_rejected());
        }

        let key = run
            .metadata
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| run.request.header(&self.api.auth_header_name).map(str::to_string))
            .filter(|k| !k.is_empty())
            .ok_or_else(Halt::auth_rejected)?;

        let now = Utc::now();
        self.sessions
            .update(
                &key,
                Box::new(move |previous| {
                    let mut next = state;
                    quota::carry_over(previous.as_ref(), &mut next, now);
                    next.last_updated = now.timestamp();
                    Some(next)
                }),
            )
            .await;
        self.admit(&key, run, now).await
    }

    /// Non-coprocess authentication: the session must already exist.
    async fn lookup_key(&self, run: &mut Run) -> Result<(), Halt> {
        let key = run
            .request
            .header(&self.api.auth_header_name)
            .map(str::to_string)
            .filter(|k| !k.is_empty())
            .ok_or_else(Halt::auth_rejected)?;
        self.admit(&key, run, Utc::now()).await
    }

    async fn admit(&self, key: &str, run: &mut Run, now: DateTime<Utc>) -> Result<(), Halt> {
        match quota::consume(&self.sessions, key, now).await {
            QuotaOutcome::Exceeded => {
                info!("quota exceeded");
                Err(Halt::quota_exceeded())
            }
            QuotaOutcome::UnknownKey => Err(Halt::auth_rejected()),
            QuotaOutcome::Allowed { .. } | QuotaOutcome::Unlimited => {
                let stored = self.sessions.get(key).await.ok_or_else(Halt::auth_rejected)?;
                run.session = codec::encode_session(&stored, true);
                run.session_key = Some(key.to_string());
                Ok(())
            }
        }
    }

    fn apply_route(&self, route: &RouteDecision, live: &mut LiveRequest, run: &mut Run) -> Result<(), Halt> {
        if route.is_empty() {
            return Ok(());
        }
        if let Some(m) = &route.method {
            let method = Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                warn!(method = %m, "invalid method transform");
                Halt::hook_error()
            })?;
            *live.method_mut() = method;
        }
        if let Some(to) = &route.rewrite_to {
            let uri = to.parse::<Uri>().map_err(|_| {
                warn!(rewrite_to = %to, "invalid url rewrite");
                Halt::hook_error()
            })?;
            *live.uri_mut() = uri;
        }
        debug!(method = %live.method(), url = %live.uri(), "route decision applied");
        run.request = codec::encode_request(live);
        Ok(())
    }
}

/// An auth hook grants access by filling in at least one limit.
fn grants_access(session: &SessionObject) -> bool {
    session.rate.is_some()
        || session.per.is_some()
        || session.quota_max.is_some()
        || session.quota_renewal_rate.is_some()
}
