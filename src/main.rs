use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, process};

use anyhow::{Context, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use hookgate::{
    api::{ApiDefinition, BundleWatcher, HookGateway},
    config::{ConfigManager, CoprocessConfig, EnvConfigManager},
    driver::DriverRegistry,
    logger::init_tracing,
    manifest::Bundle,
    policy::{InMemoryPolicyStore, PolicyStore},
    schema::write_schema,
    session::{InMemorySessionStore, SessionState, SessionStore},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "hookgate",
    about = "Coprocess hook dispatch for API gateways",
    version = "0.2.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load every API under `<root>/apis` and reload bundles as they change
    Run(RunArgs),

    /// Check a bundle: manifest, files, and that every hook resolves
    Validate(ValidateArgs),

    /// Run one recorded request through an API's pipeline and print the result
    Replay(ReplayArgs),

    /// Emit JSON-Schema for manifests and hook objects into `<root>/schemas`
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Idle session lifetime in seconds
    #[arg(long, default_value = "3600")]
    session_timeout: u64,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// How often the bundles directory is polled, in ms
    #[arg(long, default_value = "1000")]
    poll_ms: u64,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_logs_endpoint: Option<String>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_events_endpoint: Option<String>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Bundle directory containing manifest.json
    bundle: PathBuf,

    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// API definition (JSON)
    #[arg(long)]
    api: PathBuf,

    /// Recorded request (JSON: method, url, headers, body)
    #[arg(long)]
    request: PathBuf,

    /// Policies (JSON array)
    #[arg(long)]
    policies: Option<PathBuf>,

    /// Seed a stored session, as `key=path/to/session.json`
    #[arg(long = "session", value_parser = parse_seed)]
    sessions: Vec<(String, PathBuf)>,

    /// Replay the request this many times against the same stores
    #[arg(long, default_value = "1")]
    repeat: usize,

    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory, defaults to `<root>/schemas`
    #[arg(long)]
    out: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

/// A request as captured for replay.
#[derive(Debug, Deserialize)]
struct RecordedRequest {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: String,
    /// Binary bodies; wins over `body` when present.
    #[serde(default)]
    body_base64: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn parse_seed(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((key, path)) if !key.is_empty() && !path.is_empty() => Ok((key.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected key=path, got '{raw}'")),
    }
}

/// Resolve the hookgate root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("HOOKGATE_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./hookgate")
    }
}

async fn load_config(root: &Path) -> CoprocessConfig {
    let config = ConfigManager(EnvConfigManager::new(root.join(".env")));
    CoprocessConfig::from_config(&config, root).await
}

fn load_policies(path: Option<&Path>) -> anyhow::Result<PolicyStore> {
    let store: PolicyStore = match path {
        Some(p) => InMemoryPolicyStore::from_file(p)?,
        None => InMemoryPolicyStore::new(),
    };
    Ok(store)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        session_timeout: 3600,
        log_level: "info".to_string(),
        poll_ms: 1000,
        otel_logs_endpoint: None,
        otel_events_endpoint: None,
    })) {
        Commands::Run(args) => run(root, args).await,
        Commands::Validate(args) => {
            init_tracing(
                root.clone(),
                "logs/hookgate-validate.log".to_string(),
                "logs/hookgate-validate.json".to_string(),
                args.log_level,
                None,
                None,
            )?;
            validate(&root, &args.bundle).await
        }
        Commands::Replay(args) => {
            init_tracing(
                root.clone(),
                "logs/hookgate-replay.log".to_string(),
                "logs/hookgate-replay.json".to_string(),
                args.log_level.clone(),
                None,
                None,
            )?;
            replay(&root, args).await
        }
        Commands::Schema(args) => {
            init_tracing(
                root.clone(),
                "logs/hookgate-schema.log".to_string(),
                "logs/hookgate-schema.json".to_string(),
                args.log_level,
                None,
                None,
            )?;
            let out_dir = args.out.unwrap_or_else(|| root.join("schemas"));
            let files = write_schema(&out_dir)?;
            println!("{} schemas written to {}", files.len(), out_dir.display());
            process::exit(0);
        }
    }
}

async fn validate(root: &Path, dir: &Path) -> anyhow::Result<()> {
    let bundle = Bundle::load(dir).with_context(|| format!("bundle {}", dir.display()))?;
    let config = load_config(root).await;
    let drivers = DriverRegistry::with_defaults(&config);
    let runtime = drivers.bind(&bundle).await.with_context(|| format!("bundle {}", bundle.id))?;

    println!("✅ Bundle `{}` ({} driver) is valid.", bundle.id, bundle.driver);
    for hook in &bundle.hooks {
        println!("   {:<14} #{} {}", hook.stage.as_ref(), hook.order, hook.name);
    }
    runtime.shutdown().await;
    Ok(())
}

async fn replay(root: &Path, args: ReplayArgs) -> anyhow::Result<()> {
    let config = load_config(root).await;
    let drivers = DriverRegistry::with_defaults(&config);
    let sessions: SessionStore = InMemorySessionStore::new(3600);
    for (key, path) in &args.sessions {
        let raw = fs::read_to_string(path).with_context(|| format!("reading session {}", path.display()))?;
        let session: SessionState =
            serde_json::from_str(&raw).with_context(|| format!("parsing session {}", path.display()))?;
        sessions.set(key, session).await;
    }
    let policies = load_policies(args.policies.as_deref())?;

    let gateway = HookGateway::new(config, drivers, sessions, policies);
    let api = ApiDefinition::from_file(&args.api)?;
    gateway.load_api(api).await?;

    let raw = fs::read_to_string(&args.request)
        .with_context(|| format!("reading request {}", args.request.display()))?;
    let recorded: RecordedRequest = serde_json::from_str(&raw)?;

    let cancel = CancellationToken::new();
    for _ in 0..args.repeat.max(1) {
        let live = build_request(&recorded)?;
        let (_, result) = gateway.handle(live, &cancel).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    gateway.shutdown().await;
    Ok(())
}

fn build_request(recorded: &RecordedRequest) -> anyhow::Result<http::Request<Bytes>> {
    let body = match &recorded.body_base64 {
        Some(b64) => Bytes::from(STANDARD.decode(b64).context("body_base64 is not valid base64")?),
        None => Bytes::from(recorded.body.clone()),
    };
    let mut builder = http::Request::builder()
        .method(recorded.method.as_str())
        .uri(recorded.url.as_str());
    for (name, value) in &recorded.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(body).context("recorded request is not a valid HTTP request")
}

async fn run(root: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let _telemetry = init_tracing(
        root.clone(),
        "logs/hookgate_logs.log".to_string(),
        "logs/hookgate_events.log".to_string(),
        args.log_level,
        args.otel_logs_endpoint,
        args.otel_events_endpoint,
    )?;

    info!("hookgate starting up…");
    println!("hookgate starting up…");

    if !root.exists() {
        let err = format!(
            "Root directory {} does not exist. Set HOOKGATE_ROOT or create it first.",
            root.display()
        );
        error!("{err}");
        bail!(err);
    }

    let config = load_config(&root).await;
    fs::create_dir_all(&config.bundles_dir)?;
    let policies_file = root.join("policies.json");
    let policies = load_policies(policies_file.exists().then_some(policies_file.as_path()))?;
    let drivers = DriverRegistry::with_defaults(&config);
    let gateway = HookGateway::new(config, drivers, InMemorySessionStore::new(args.session_timeout), policies);

    let apis_dir = root.join("apis");
    if apis_dir.is_dir() {
        for entry in fs::read_dir(&apis_dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let loaded = match ApiDefinition::from_file(&path) {
                Ok(api) => gateway.load_api(api).await.map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = loaded {
                warn!("skipping {}: {e:#}", path.display());
            }
        }
    }
    info!(apis = ?gateway.api_ids(), "APIs loaded");
    println!("✅ {} API(s) loaded: {:?}", gateway.api_ids().len(), gateway.api_ids());

    let watcher = BundleWatcher::start(gateway.clone(), Duration::from_millis(args.poll_ms.max(50))).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    watcher.shutdown();
    gateway.shutdown().await;
    println!("hookgate stopped.");
    Ok(())
}
