use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const SERVICE_NAME: &str = "hookgate";

/// Install the global `tracing` subscriber.
///
/// With an OTLP endpoint, logs, traces and metrics are exported over
/// OTLP/HTTP and mirrored to stdout. Without one, a text log and a JSON
/// "request" event log roll daily under `root`. Keep the returned
/// [`Telemetry`] alive until shutdown.
pub fn init_tracing(
    root: PathBuf,
    log_file: String,
    event_file: String,
    log_level: String,
    otel_logs_endpoint: Option<String>,
    otel_events_endpoint: Option<String>,
) -> Result<Option<Telemetry>> {
    let otel_enabled = otel_logs_endpoint.is_some() || otel_events_endpoint.is_some();

    if otel_enabled {
        let logs = otel_logs_endpoint.as_deref().unwrap_or_default();
        let events = otel_events_endpoint.as_deref().unwrap_or(logs);
        Ok(Some(Telemetry::init(&log_level, logs, logs, events)?))
    } else {
        FileTelemetry::init_files(&log_level, root.join(&log_file), root.join(&event_file))?;
        Ok(None)
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(end_point: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_traces(end_point: &str) -> Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("span exporter")?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(end_point: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(end_point)
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn filter(log_level: &str, quiet: &[&str]) -> Result<EnvFilter> {
    let mut filter = EnvFilter::new(log_level);
    for target in quiet {
        filter = filter.add_directive(
            format!("{target}=off")
                .parse()
                .map_err(|e| anyhow!("bad directive for {target}: {e}"))?,
        );
    }
    Ok(filter)
}

/// OTLP providers kept alive for the lifetime of the process.
pub struct Telemetry {
    pub logger_provider: SdkLoggerProvider,
    pub tracer_provider: SdkTracerProvider,
    pub meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn init(
        log_level: &str,
        logger_endpoint: &str,
        tracer_endpoint: &str,
        meter_endpoint: &str,
    ) -> Result<Self> {
        let logger_provider = init_logs(logger_endpoint)?;
        let tracer_provider = init_traces(tracer_endpoint)?;
        let meter_provider = init_metrics(meter_endpoint)?;

        let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider)
            .with_filter(filter(log_level, &["hyper", "tonic", "h2", "reqwest"])?);

        // local printer so `info!` still shows on stdout
        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(filter(log_level, &[])?);

        Registry::default()
            .with(otel_logs_layer)
            .with(fmt_layer)
            .try_init()
            .context("tracing subscriber already installed")?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Telemetry { logger_provider, tracer_provider, meter_provider })
    }
}

/// File-only logging: a plain text log and newline-delimited JSON events
/// for everything logged with `target: "request"`.
pub struct FileTelemetry;

impl FileTelemetry {
    pub fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<Self> {
        let txt_appender = appender(&log_file)?;
        let txt_layer = fmt::Layer::default().with_writer(txt_appender).with_ansi(false);

        let json_appender = appender(&event_file)?;
        let json_layer = fmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new("request=info"));

        Registry::default()
            .with(EnvFilter::new(log_level))
            .with(txt_layer)
            .with(json_layer)
            .try_init()
            .context("tracing subscriber already installed")?;

        Ok(FileTelemetry)
    }
}

fn appender(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("log path {} has no parent", path.display()))?;
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, name))
}

/// Counters and histograms recorded by the pipeline and the drivers.
///
/// Instruments come from the global meter, so they are no-ops until a
/// provider is installed by [`Telemetry::init`].
#[derive(Clone)]
pub struct HookMetrics {
    invocations: Counter<u64>,
    failures: Counter<u64>,
    latency_ms: Histogram<f64>,
    outcomes: Counter<u64>,
}

impl HookMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        HookMetrics {
            invocations: meter
                .u64_counter("hook_invocations")
                .with_description("Hook calls made by the pipeline")
                .build(),
            failures: meter
                .u64_counter("hook_failures")
                .with_description("Hook calls that ended in an error")
                .build(),
            latency_ms: meter
                .f64_histogram("hook_latency_ms")
                .with_description("Latency per hook call in ms")
                .with_unit("ms")
                .build(),
            outcomes: meter
                .u64_counter("pipeline_outcomes")
                .with_description("Pipeline executions by termination reason")
                .build(),
        }
    }

    pub fn record_hook(&self, stage: &str, hook: &str, elapsed: Duration, ok: bool) {
        let attrs = [
            KeyValue::new("stage", stage.to_string()),
            KeyValue::new("hook", hook.to_string()),
        ];
        self.invocations.add(1, &attrs);
        self.latency_ms.record(elapsed.as_secs_f64() * 1_000.0, &attrs);
        if !ok {
            self.failures.add(1, &attrs);
        }
    }

    pub fn record_outcome(&self, reason: &str) {
        self.outcomes.add(1, &[KeyValue::new("reason", reason.to_string())]);
    }
}

impl std::fmt::Debug for HookMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookMetrics").finish_non_exhaustive()
    }
}

impl Default for HookMetrics {
    fn default() -> Self {
        Self::new()
    }
}
