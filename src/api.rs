use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use http::Uri;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, LiveRequest};
use crate::config::CoprocessConfig;
use crate::driver::DriverRegistry;
use crate::manifest::{Bundle, MANIFEST_FILE, ManifestError};
use crate::pipeline::{BoundBundle, Pipeline, PipelineResult, RouteDecision};
use crate::policy::PolicyStore;
use crate::session::SessionStore;
use crate::watcher::{DirectoryWatcher, WatchedType};

/// The slice of an API definition the hook pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApiDefinition {
    pub api_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub org_id: String,
    pub listen_path: String,
    #[serde(default)]
    pub use_keyless_access: bool,
    #[serde(default)]
    pub enable_coprocess_auth: bool,
    /// Directory name of the bundle under the bundles dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_middleware_bundle: Option<String>,
    #[serde(default = "default_auth_header")]
    pub auth_header_name: String,
    /// Free-form configuration handed to hooks as `spec.config_data`.
    #[serde(default)]
    pub config_data: Value,
    #[serde(default)]
    pub url_rewrites: Vec<UrlRewrite>,
    #[serde(default)]
    pub method_transforms: Vec<MethodTransform>,
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UrlRewrite {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub rewrite_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MethodTransform {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub to_method: String,
}

fn rule_matches(rule_path: &str, rule_method: Option<&str>, method: &str, path: &str) -> bool {
    rule_path == path && rule_method.is_none_or(|m| m.eq_ignore_ascii_case(method))
}

impl ApiDefinition {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading API definition {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing API definition {}", path.display()))
    }

    /// Rewrite and method transform for a request already stripped of the
    /// listen path. A method transform may match the rewritten path.
    pub fn route_decision(&self, method: &str, path: &str) -> RouteDecision {
        let mut decision = RouteDecision::default();
        let mut effective = path.to_string();
        if let Some(rw) = self
            .url_rewrites
            .iter()
            .find(|r| rule_matches(&r.path, r.method.as_deref(), method, path))
        {
            decision.rewrite_to = Some(rw.rewrite_to.clone());
            effective = rw.rewrite_to.split('?').next().unwrap_or_default().to_string();
        }
        if let Some(mt) = self.method_transforms.iter().find(|t| {
            rule_matches(&t.path, t.method.as_deref(), method, &effective)
                || rule_matches(&t.path, t.method.as_deref(), method, path)
        }) {
            decision.method = Some(mt.to_method.to_ascii_uppercase());
        }
        decision
    }

    fn prefix(&self) -> &str {
        self.listen_path.trim_end_matches('/')
    }

    fn serves(&self, path: &str) -> bool {
        let prefix = self.prefix();
        prefix.is_empty() || path == prefix || path.starts_with(&format!("{prefix}/"))
    }

    /// `uri` with the listen path removed.
    fn strip(&self, uri: &Uri) -> Result<Uri, GatewayError> {
        let rest = uri.path().strip_prefix(self.prefix()).unwrap_or(uri.path());
        let mut inner = if rest.starts_with('/') { rest.to_string() } else { format!("/{rest}") };
        if let Some(q) = uri.query() {
            inner.push('?');
            inner.push_str(q);
        }
        inner.parse().map_err(|_| GatewayError::NoRoute(uri.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API '{api_id}' cannot use bundle '{bundle}': {source}")]
    Bundle {
        api_id: String,
        bundle: String,
        #[source]
        source: ManifestError,
    },
    #[error("API '{0}' enables coprocess auth but binds no auth_check hook")]
    MissingAuthHook(String),
    #[error("API '{0}' needs a middleware bundle but coprocess is disabled")]
    CoprocessDisabled(String),
    #[error("invalid listen path '{0}'")]
    InvalidListenPath(String),
    #[error("no API listens on '{0}'")]
    NoRoute(String),
    #[error("request looped through more than {0} APIs")]
    LoopTooDeep(usize),
}

/// Scheme of URLs that send a request back into another loaded API.
pub const LOOP_SCHEME: &str = "tyk";

/// Internal loops allowed per request.
pub const MAX_LOOPS: usize = 5;

/// Target API and inner URI when `result` proxies to a loop URL.
fn loop_target(result: &PipelineResult, uri: &Uri) -> Option<(String, Uri)> {
    if result.terminated || uri.scheme_str() != Some(LOOP_SCHEME) {
        return None;
    }
    let api = uri.host()?.to_string();
    let inner = uri
        .path_and_query()
        .cloned()
        .map(Uri::from)
        .unwrap_or_else(|| Uri::from_static("/"));
    Some((api, inner))
}

/// Loaded APIs and their pipelines.
#[derive(Debug)]
pub struct HookGateway {
    config: CoprocessConfig,
    drivers: DriverRegistry,
    sessions: SessionStore,
    policies: PolicyStore,
    apis: DashMap<String, Arc<Pipeline>>,
}

impl HookGateway {
    pub fn new(
        config: CoprocessConfig,
        drivers: DriverRegistry,
        sessions: SessionStore,
        policies: PolicyStore,
    ) -> Arc<Self> {
        Arc::new(HookGateway { config, drivers, sessions, policies, apis: DashMap::new() })
    }

    pub fn config(&self) -> &CoprocessConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Put `api` into service, replacing a previous version. Nothing is
    /// replaced when the bundle fails to load or bind.
    pub async fn load_api(&self, api: ApiDefinition) -> Result<(), GatewayError> {
        if !api.listen_path.starts_with('/') {
            return Err(GatewayError::InvalidListenPath(api.listen_path));
        }

        let hooks = match &api.custom_middleware_bundle {
            None => None,
            Some(_) if !self.config.enabled => return Err(GatewayError::CoprocessDisabled(api.api_id)),
            Some(name) => Some(self.bind(&api.api_id, name).await?),
        };

        let needs_auth_hook = api.enable_coprocess_auth && !api.use_keyless_access;
        if needs_auth_hook && hooks.as_ref().and_then(|b| b.bundle.auth_hook()).is_none() {
            if let Some(b) = &hooks {
                b.runtime.shutdown().await;
            }
            return Err(GatewayError::MissingAuthHook(api.api_id));
        }

        let api_id = api.api_id.clone();
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(api),
            hooks,
            self.sessions.clone(),
            self.policies.clone(),
            self.config.hook_timeout,
        ));
        if let Some(old) = self.apis.insert(api_id.clone(), pipeline) {
            old.shutdown().await;
        }
        info!(api = %api_id, "API loaded");
        Ok(())
    }

    async fn bind(&self, api_id: &str, bundle_name: &str) -> Result<BoundBundle, GatewayError> {
        let wrap = |source| GatewayError::Bundle {
            api_id: api_id.to_string(),
            bundle: bundle_name.to_string(),
            source,
        };
        let bundle = Bundle::load(self.config.bundles_dir.join(bundle_name)).map_err(wrap)?;
        let runtime = self.drivers.bind(&bundle).await.map_err(wrap)?;
        Ok(BoundBundle { bundle: Arc::new(bundle), runtime })
    }

    /// Take an API out of service. Returns whether it was loaded.
    pub async fn unload_api(&self, api_id: &str) -> bool {
        match self.apis.remove(api_id) {
            Some((_, pipeline)) => {
                pipeline.shutdown().await;
                info!(api = %api_id, "API unloaded");
                true
            }
            None => false,
        }
    }

    /// Reload every API using `bundle_name`. An API whose bundle no longer
    /// loads is taken out of service.
    pub async fn reload_bundle(&self, bundle_name: &str) -> Vec<(String, Result<(), GatewayError>)> {
        let affected: Vec<ApiDefinition> = self
            .apis
            .iter()
            .filter(|e| e.value().api().custom_middleware_bundle.as_deref() == Some(bundle_name))
            .map(|e| e.value().api().clone())
            .collect();

        let mut outcomes = Vec::with_capacity(affected.len());
        for api in affected {
            let api_id = api.api_id.clone();
            let res = self.load_api(api).await;
            if let Err(e) = &res {
                error!(api = %api_id, bundle = %bundle_name, "reload failed, API out of service: {e}");
                self.unload_api(&api_id).await;
            }
            outcomes.push((api_id, res));
        }
        outcomes
    }

    pub fn pipeline(&self, api_id: &str) -> Option<Arc<Pipeline>> {
        self.apis.get(api_id).map(|e| e.value().clone())
    }

    pub fn api_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.apis.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Pipeline with the longest listen path serving `path`.
    pub fn route(&self, path: &str) -> Option<Arc<Pipeline>> {
        self.apis
            .iter()
            .filter(|e| e.value().api().serves(path))
            .max_by_key(|e| e.value().api().prefix().len())
            .map(|e| e.value().clone())
    }

    /// Loaded API whose `name`, or failing that `api_id`, is `target`.
    pub fn by_name(&self, target: &str) -> Option<Arc<Pipeline>> {
        let named = self
            .apis
            .iter()
            .find(|e| e.value().api().name == target)
            .map(|e| e.value().clone());
        named.or_else(|| self.pipeline(target))
    }

    /// Route `live`, strip the listen path and run the pipeline. A request
    /// a hook pointed at `tyk://<api>/<path>` runs again through that API.
    /// The returned request is what goes upstream unless the result is
    /// terminated.
    pub async fn handle(
        &self,
        mut live: LiveRequest,
        cancel: &CancellationToken,
    ) -> Result<(LiveRequest, PipelineResult), GatewayError> {
        let path = live.uri().path().to_string();
        let mut pipeline = self.route(&path).ok_or(GatewayError::NoRoute(path))?;

        codec::mark_original(&mut live);
        let inner = pipeline.api().strip(live.uri())?;
        *live.uri_mut() = inner;

        let mut loops = 0;
        loop {
            let decision = pipeline.api().route_decision(live.method().as_str(), live.uri().path());
            let result = pipeline.execute(&mut live, &decision, cancel).await;
            let Some((target, inner)) = loop_target(&result, live.uri()) else {
                return Ok((live, result));
            };

            loops += 1;
            if loops > MAX_LOOPS {
                warn!(api = %pipeline.api().api_id, "loop limit reached");
                return Err(GatewayError::LoopTooDeep(MAX_LOOPS));
            }
            let next = self
                .by_name(&target)
                .ok_or_else(|| GatewayError::NoRoute(live.uri().to_string()))?;
            debug!(from = %pipeline.api().api_id, to = %next.api().api_id, url = %inner, "looping request");
            *live.uri_mut() = inner;
            pipeline = next;
        }
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.apis.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unload_api(&id).await;
        }
    }
}

/// Reloads APIs when a file inside one of their bundles changes.
pub struct BundleWatcher {
    gateway: Arc<HookGateway>,
    bundles_dir: PathBuf,
}

impl BundleWatcher {
    pub async fn start(gateway: Arc<HookGateway>, poll_interval: Duration) -> anyhow::Result<DirectoryWatcher> {
        let bundles_dir = gateway.config().bundles_dir.clone();
        let watched = Arc::new(BundleWatcher { gateway, bundles_dir: bundles_dir.clone() });
        DirectoryWatcher::new(bundles_dir, watched, &[], false, false, poll_interval).await
    }

    /// Bundle directory name for a file directly inside it.
    fn bundle_of(&self, path: &Path) -> Option<String> {
        let dir = path.parent()?;
        if dir.parent()? != self.bundles_dir.as_path() {
            return None;
        }
        dir.file_name()?.to_str().map(str::to_string)
    }

    async fn reload(&self, path: &Path) -> anyhow::Result<()> {
        let Some(name) = self.bundle_of(path) else { return Ok(()) };
        for (api_id, res) in self.gateway.reload_bundle(&name).await {
            match res {
                Ok(()) => info!(api = %api_id, bundle = %name, "bundle reloaded"),
                Err(e) => warn!(api = %api_id, bundle = %name, "bundle reload failed: {e}"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WatchedType for BundleWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        self.bundle_of(path).is_some()
            && (path.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILE)
                || path.extension().is_some_and(|e| e == "rhai"))
    }

    async fn on_create_or_modify(&self, path: &Path) -> anyhow::Result<()> {
        self.reload(path).await
    }

    async fn on_remove(&self, path: &Path) -> anyhow::Result<()> {
        self.reload(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::InMemoryPolicyStore;
    use crate::session::InMemorySessionStore;
    use bytes::Bytes;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn api(value: Value) -> ApiDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn gateway(root: &Path) -> Arc<HookGateway> {
        let config = CoprocessConfig::defaults(root);
        fs::create_dir_all(&config.bundles_dir).unwrap();
        let drivers = DriverRegistry::with_defaults(&config);
        HookGateway::new(config, drivers, InMemorySessionStore::new(60), InMemoryPolicyStore::new())
    }

    fn write_bundle(root: &Path, name: &str, script: &str, middleware: Value) {
        let dir = root.join("bundles").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("hooks.rhai"), script).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            json!({"file_list": ["hooks.rhai"], "custom_middleware": middleware}).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn route_decisions_follow_rewrites_then_transforms() {
        let def = api(json!({
            "api_id": "a", "listen_path": "/test-api-1/",
            "url_rewrites": [{"path": "/get", "method": "GET", "rewrite_to": "/test2"}],
            "method_transforms": [{"path": "/test2", "method": "GET", "to_method": "post"}]
        }));
        assert_eq!(
            def.route_decision("GET", "/get"),
            RouteDecision { rewrite_to: Some("/test2".into()), method: Some("POST".into()) }
        );
        assert_eq!(def.route_decision("POST", "/post"), RouteDecision::default());
        assert_eq!(def.auth_header_name, "Authorization");
    }

    #[test]
    fn listen_path_is_stripped() {
        let def = api(json!({"api_id": "a", "listen_path": "/test-api-1/"}));
        assert!(def.serves("/test-api-1/post"));
        assert!(def.serves("/test-api-1"));
        assert!(!def.serves("/test-api-10/post"));
        let uri: Uri = "/test-api-1/post?x=1".parse().unwrap();
        assert_eq!(def.strip(&uri).unwrap().to_string(), "/post?x=1");
        let root: Uri = "/test-api-1".parse().unwrap();
        assert_eq!(def.strip(&root).unwrap().to_string(), "/");
    }

    #[tokio::test]
    async fn coprocess_auth_requires_an_auth_hook() {
        let root = TempDir::new().unwrap();
        let gw = gateway(root.path());
        write_bundle(root.path(), "noauth", "fn Pre(r, s) { [r, s] }", json!({"driver": "rhai", "pre": [{"name": "Pre"}]}));

        let err = gw
            .load_api(api(json!({
                "api_id": "a", "listen_path": "/a/", "enable_coprocess_auth": true,
                "custom_middleware_bundle": "noauth"
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingAuthHook(_)));
        assert!(gw.pipeline("a").is_none());
    }

    #[tokio::test]
    async fn broken_bundle_keeps_the_api_out_of_service() {
        let root = TempDir::new().unwrap();
        let gw = gateway(root.path());
        write_bundle(root.path(), "broken", "fn Pre(r, s) { [r, s] }", json!({"driver": "rhai", "pre": [{"name": "Missing"}]}));

        let err = gw
            .load_api(api(json!({
                "api_id": "a", "listen_path": "/a/", "use_keyless_access": true,
                "custom_middleware_bundle": "broken"
            })))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Bundle { source: ManifestError::UnresolvedHook { .. }, .. }
        ));
        assert!(gw.route("/a/x").is_none());
    }

    #[tokio::test]
    async fn handle_routes_by_longest_listen_path() {
        let root = TempDir::new().unwrap();
        let gw = gateway(root.path());
        gw.load_api(api(json!({"api_id": "root", "listen_path": "/", "use_keyless_access": true})))
            .await
            .unwrap();
        gw.load_api(api(json!({"api_id": "one", "listen_path": "/one/", "use_keyless_access": true})))
            .await
            .unwrap();
        assert_eq!(gw.api_ids(), vec!["one".to_string(), "root".to_string()]);

        let req = http::Request::builder().uri("/one/thing?q=1").body(Bytes::new()).unwrap();
        let (live, res) = gw.handle(req, &CancellationToken::new()).await.unwrap();
        assert!(!res.terminated);
        assert_eq!(live.uri().to_string(), "/thing?q=1");
        assert_eq!(res.final_request.raw_url, "/one/thing?q=1");

        assert!(gw.unload_api("one").await);
        assert!(!gw.unload_api("one").await);
        let req = http::Request::builder().uri("/one/thing").body(Bytes::new()).unwrap();
        let (live, _) = gw.handle(req, &CancellationToken::new()).await.unwrap();
        assert_eq!(live.uri().path(), "/one/thing");
    }

    #[tokio::test]
    async fn loop_urls_are_followed_up_to_the_limit() {
        let root = TempDir::new().unwrap();
        let gw = gateway(root.path());
        write_bundle(
            root.path(),
            "looper",
            r#"fn Loop(request, session) { request.url = "tyk://" + get_header(request, "x-to") + "/again"; [request, session] }"#,
            json!({"driver": "rhai", "pre": [{"name": "Loop"}]}),
        );
        gw.load_api(api(json!({
            "api_id": "a", "name": "self", "listen_path": "/a/", "use_keyless_access": true,
            "custom_middleware_bundle": "looper"
        })))
        .await
        .unwrap();

        let req = http::Request::builder().uri("/a/x").header("x-to", "self").body(Bytes::new()).unwrap();
        let err = gw.handle(req, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::LoopTooDeep(MAX_LOOPS)));

        let req = http::Request::builder().uri("/a/x").header("x-to", "ghost").body(Bytes::new()).unwrap();
        let err = gw.handle(req, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoRoute(url) if url == "tyk://ghost/again"));
    }

    #[tokio::test]
    async fn by_name_prefers_name_then_api_id() {
        let root = TempDir::new().unwrap();
        let gw = gateway(root.path());
        gw.load_api(api(json!({"api_id": "id-1", "name": "first", "listen_path": "/one/", "use_keyless_access": true})))
            .await
            .unwrap();
        assert_eq!(gw.by_name("first").unwrap().api().api_id, "id-1");
        assert_eq!(gw.by_name("id-1").unwrap().api().api_id, "id-1");
        assert!(gw.by_name("other").is_none());
    }

    #[tokio::test]
    async fn reload_picks_up_new_code_and_drops_broken_bundles() {
        let root = TempDir::new().unwrap();
        let gw = gateway(root.path());
        let mw = json!({"driver": "rhai", "pre": [{"name": "Tag"}]});
        write_bundle(root.path(), "tags", r#"fn Tag(r, s) { r.set_header("x-v", "1"); [r, s] }"#, mw.clone());
        gw.load_api(api(json!({
            "api_id": "a", "listen_path": "/", "use_keyless_access": true, "custom_middleware_bundle": "tags"
        })))
        .await
        .unwrap();

        write_bundle(root.path(), "tags", r#"fn Tag(r, s) { r.set_header("x-v", "2"); [r, s] }"#, mw);
        let outcomes = gw.reload_bundle("tags").await;
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
        let req = http::Request::builder().uri("/").body(Bytes::new()).unwrap();
        let (live, _) = gw.handle(req, &CancellationToken::new()).await.unwrap();
        assert_eq!(live.headers()["x-v"], "2");

        fs::remove_file(root.path().join("bundles/tags/hooks.rhai")).unwrap();
        let outcomes = gw.reload_bundle("tags").await;
        assert!(outcomes[0].1.is_err());
        assert!(gw.pipeline("a").is_none());
    }

    #[tokio::test]
    async fn watcher_only_cares_about_files_inside_bundles() {
        let root = TempDir::new().unwrap();
        let gw = gateway(root.path());
        let watcher = BundleWatcher { bundles_dir: gw.config().bundles_dir.clone(), gateway: gw };
        let dir = root.path().join("bundles");
        assert!(watcher.is_relevant(&dir.join("b1").join(MANIFEST_FILE)));
        assert!(watcher.is_relevant(&dir.join("b1").join("hooks.rhai")));
        assert!(!watcher.is_relevant(&dir.join("b1").join("notes.txt")));
        assert!(!watcher.is_relevant(&dir.join(MANIFEST_FILE)));
        assert!(!watcher.is_relevant(&dir.join("b1").join("nested").join("hooks.rhai")));
    }
}
