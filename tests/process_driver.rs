use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hook_plugin::message::{DispatchParams, HookStage, RequestObject, SessionObject};
use hookgate::api::{ApiDefinition, HookGateway};
use hookgate::config::CoprocessConfig;
use hookgate::driver::{DriverRegistry, HookExecutionError, InvokeContext};
use hookgate::manifest::{Bundle, ManifestError};
use hookgate::pipeline::TerminationReason;
use hookgate::policy::InMemoryPolicyStore;
use hookgate::session::InMemorySessionStore;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Bundle directory holding a copy of the mock driver binary.
fn process_bundle(parent: &Path, name: &str, middleware: Value) -> PathBuf {
    let dir = parent.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::copy(env!("CARGO_BIN_EXE_mock_hooks"), dir.join("mock_hooks")).unwrap();
    fs::write(
        dir.join("manifest.json"),
        json!({"file_list": ["mock_hooks"], "custom_middleware": middleware}).to_string(),
    )
    .unwrap();
    dir
}

fn config(root: &Path) -> CoprocessConfig {
    let mut cfg = CoprocessConfig::defaults(root);
    cfg.pool_size = 1;
    cfg.hook_timeout = Duration::from_millis(500);
    fs::create_dir_all(&cfg.bundles_dir).unwrap();
    cfg
}

fn params(hook: &str, headers: &[(&str, &str)]) -> DispatchParams {
    let mut request = RequestObject { method: "GET".into(), url: "/".into(), ..Default::default() };
    for (k, v) in headers {
        request.headers.insert(k.to_string(), v.to_string());
    }
    DispatchParams {
        stage: HookStage::Pre,
        hook: hook.into(),
        request,
        session: SessionObject::default(),
        metadata: Default::default(),
        spec: Default::default(),
    }
}

fn ctx(timeout: Duration) -> InvokeContext {
    InvokeContext::new(timeout, CancellationToken::new())
}

#[tokio::test]
async fn binds_and_lists_hooks_from_the_child() {
    let root = TempDir::new().unwrap();
    let cfg = config(root.path());
    let dir = process_bundle(&cfg.bundles_dir, "mock", json!({"driver": "process", "pre": [{"name": "MyPreHook"}]}));
    let bundle = Bundle::load(&dir).unwrap();

    let runtime = DriverRegistry::with_defaults(&cfg).bind(&bundle).await.unwrap();
    let names = runtime.hook_names();
    assert!(names.contains(&"MyPreHook".to_string()));
    assert!(names.contains(&"MyAuthCheck".to_string()));

    let out = runtime.invoke(params("MyPreHook", &[]), &ctx(Duration::from_secs(5))).await.unwrap();
    assert_eq!(out.request.set_headers["x-pre"], "mock");
    assert_eq!(out.request.add_params["pre"], "1");
    assert_eq!(out.metadata["seen_pre"], json!(true));
    runtime.shutdown().await;
}

#[tokio::test]
async fn unresolved_binding_refuses_the_bundle() {
    let root = TempDir::new().unwrap();
    let cfg = config(root.path());
    let dir = process_bundle(&cfg.bundles_dir, "mock", json!({"driver": "process", "post": [{"name": "Nope"}]}));
    let bundle = Bundle::load(&dir).unwrap();

    let err = DriverRegistry::with_defaults(&cfg).bind(&bundle).await.unwrap_err();
    assert!(matches!(err, ManifestError::UnresolvedHook { stage: HookStage::Post, ref name } if name == "Nope"));
}

#[tokio::test]
async fn faults_timeouts_and_crashes_are_reported_and_recovered() {
    let root = TempDir::new().unwrap();
    let cfg = config(root.path());
    let dir = process_bundle(&cfg.bundles_dir, "mock", json!({"driver": "process"}));
    let runtime = DriverRegistry::with_defaults(&cfg).bind(&Bundle::load(&dir).unwrap()).await.unwrap();

    assert_eq!(
        runtime.invoke(params("Fail", &[]), &ctx(Duration::from_secs(5))).await.unwrap_err(),
        HookExecutionError::Fault("mock failure".into())
    );
    assert_eq!(
        runtime.invoke(params("Unknown", &[]), &ctx(Duration::from_secs(5))).await.unwrap_err(),
        HookExecutionError::HookNotFound("Unknown".into())
    );

    let slow = runtime
        .invoke(params("Sleep", &[("x-sleep-ms", "5000")]), &ctx(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(slow, HookExecutionError::Timeout(Duration::from_millis(100)));
    // the stuck child was replaced
    assert!(runtime.invoke(params("MyPreHook", &[]), &ctx(Duration::from_secs(5))).await.is_ok());

    assert!(matches!(
        runtime.invoke(params("Crash", &[]), &ctx(Duration::from_secs(5))).await,
        Err(HookExecutionError::Unreachable(_))
    ));
    assert!(runtime.invoke(params("MyPreHook", &[]), &ctx(Duration::from_secs(5))).await.is_ok());
    runtime.shutdown().await;
}

#[tokio::test]
async fn gateway_runs_a_process_bundle_end_to_end() {
    let root = TempDir::new().unwrap();
    let cfg = config(root.path());
    process_bundle(
        &cfg.bundles_dir,
        "mock",
        json!({
            "driver": "process",
            "pre": [{"name": "MyPreHook"}],
            "auth_check": {"name": "MyAuthCheck"},
            "post": [{"name": "MyPostHook"}, {"name": "Teapot"}]
        }),
    );
    let drivers = DriverRegistry::with_defaults(&cfg);
    let gateway: Arc<HookGateway> =
        HookGateway::new(cfg, drivers, InMemorySessionStore::new(60), InMemoryPolicyStore::new());
    let api: ApiDefinition = serde_json::from_value(json!({
        "api_id": "p", "listen_path": "/p/", "enable_coprocess_auth": true, "custom_middleware_bundle": "mock"
    }))
    .unwrap();
    gateway.load_api(api).await.unwrap();

    let cancel = CancellationToken::new();
    let req = http::Request::builder().uri("/p/x").header("Authorization", "nope").body(Bytes::new()).unwrap();
    let (_, res) = gateway.handle(req, &cancel).await.unwrap();
    assert_eq!(res.termination_reason, TerminationReason::AuthRejected);

    let req = http::Request::builder().uri("/p/x").header("Authorization", "abc").body(Bytes::new()).unwrap();
    let (_, res) = gateway.handle(req, &cancel).await.unwrap();
    assert_eq!(res.termination_reason, TerminationReason::Override);
    let rsp = res.response.unwrap();
    assert_eq!((rsp.status, rsp.body.as_str()), (418, "short and stout"));
    // edits made before the override are visible in the final request
    assert_eq!(res.final_request.headers["x-plan"], "mock");
    assert_eq!(res.final_request.headers["x-pre"], "mock");
    assert_eq!(res.final_request.params["pre"], "1");

    gateway.shutdown().await;
    assert!(gateway.api_ids().is_empty());
}
