//! Process-driver bundle used by the integration tests and for trying the
//! gateway by hand. Copy the binary into a bundle directory and list it as
//! the first entry of `file_list`.

use std::time::Duration;

use async_trait::async_trait;
use hook_plugin::message::{
    DispatchParams, DispatchResult, HooksResult, InitParams, InitResult, LogLevel, ReturnOverride,
};
use hook_plugin::plugin_runtime::{HookFault, HookHandler, HostLog, run};
use serde_json::json;

const HOOKS: &[&str] = &["MyPreHook", "MyAuthCheck", "MyPostHook", "Fail", "Sleep", "Teapot", "Crash"];

#[derive(Default)]
struct MockHooks {
    bundle_id: String,
    log: Option<HostLog>,
}

impl MockHooks {
    fn log(&self, level: LogLevel, message: String) {
        if let Some(log) = &self.log {
            log.log(level, message);
        }
    }
}

#[async_trait]
impl HookHandler for MockHooks {
    async fn init(&mut self, params: InitParams) -> InitResult {
        self.bundle_id = params.bundle_id;
        InitResult { success: true, error: None }
    }

    fn hooks(&self) -> HooksResult {
        HooksResult { hooks: HOOKS.iter().map(|h| h.to_string()).collect() }
    }

    async fn dispatch(&mut self, params: DispatchParams) -> Result<DispatchResult, HookFault> {
        let hook = params.hook.clone();
        let mut out = DispatchResult::passthrough(params);
        match hook.as_str() {
            "MyPreHook" => {
                out.request.set_headers.insert("x-pre".into(), self.bundle_id.clone());
                out.request.add_params.insert("pre".into(), "1".into());
                out.metadata.insert("seen_pre".into(), json!(true));
            }
            "MyAuthCheck" => {
                if out.request.header("authorization") == Some("abc") {
                    out.session.rate = Some(1000.0);
                    out.session.per = Some(1.0);
                    out.session.quota_max = Some(10);
                    out.session.quota_renewal_rate = Some(60);
                    out.session.metadata.insert("plan".into(), json!("mock"));
                    out.metadata.insert("token".into(), json!("abc"));
                }
            }
            "MyPostHook" => {
                let plan = out.session.metadata.get("plan").and_then(|v| v.as_str()).unwrap_or("none").to_string();
                out.request.set_headers.insert("x-plan".into(), plan);
            }
            "Fail" => return Err(HookFault::Failed("mock failure".into())),
            "Sleep" => {
                let ms = out
                    .request
                    .header("x-sleep-ms")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2_000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "Teapot" => {
                out.request.return_overrides = ReturnOverride {
                    response_code: Some(418),
                    response_body: Some("short and stout".into()),
                    ..Default::default()
                };
            }
            "Crash" => std::process::exit(3),
            _ => return Err(HookFault::NotFound(hook)),
        }
        self.log(LogLevel::Debug, format!("{hook} done"));
        Ok(out)
    }

    fn attach_log(&mut self, log: HostLog) {
        self.log = Some(log);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    run(MockHooks::default()).await
}
