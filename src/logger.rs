use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::error::ControlResult;

const SERVICE_NAME: &str = "rackctl";

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

/// Providers that must be flushed on shutdown. Empty when logging to files.
#[derive(Debug, Default)]
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn is_otlp(&self) -> bool {
        self.logger_provider.is_some()
    }

    pub fn shutdown(self) {
        if let Some(provider) = self.logger_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("log provider shutdown failed: {e}");
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("meter provider shutdown failed: {e}");
            }
        }
    }
}

/// Install the global subscriber. Without an endpoint everything goes to
/// daily-rolling files under `root`; with one, logs and metrics are exported
/// over OTLP/HTTP and mirrored to stderr. Stdout is never written, it carries
/// tool responses.
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: &str,
    otel_endpoint: Option<String>,
) -> Result<Telemetry> {
    match otel_endpoint {
        Some(endpoint) => init_otlp(log_level, &endpoint),
        None => {
            init_files(log_level, root, log_file, event_file)?;
            Ok(Telemetry::default())
        }
    }
}

fn rolling(dir: &Path, file: &str) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .build(dir)
        .with_context(|| format!("Failed to open log file {file} in {}", dir.display()))
}

fn init_files(log_level: &str, dir: &Path, log_file: &str, event_file: &str) -> Result<()> {
    let env_filter = EnvFilter::new(log_level);

    let txt_layer = fmt::Layer::default()
        .with_writer(rolling(dir, log_file)?)
        .with_ansi(false);

    // only `target: "request"` events land in the JSON file
    let json_layer = fmt::layer()
        .json()
        .with_writer(rolling(dir, event_file)?)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    Registry::default()
        .with(env_filter)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow!("tracing already initialised: {e}"))
}

fn init_otlp(log_level: &str, endpoint: &str) -> Result<Telemetry> {
    let log_exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/logs", endpoint.trim_end_matches('/')))
        .build()
        .context("Failed to build OTLP log exporter")?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(get_resource())
        .build();

    let metric_exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/metrics", endpoint.trim_end_matches('/')))
        .build()
        .context("Failed to build OTLP metric exporter")?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(get_resource())
        .build();
    global::set_meter_provider(meter_provider.clone());

    let otel_logs_layer = {
        let filter = EnvFilter::new(log_level)
            .add_directive("hyper=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("reqwest=off".parse()?);
        OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter)
    };
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_filter(EnvFilter::new(log_level));

    Registry::default()
        .with(otel_logs_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| anyhow!("tracing already initialised: {e}"))?;
    info!("Exporting logs and metrics to {endpoint}");

    Ok(Telemetry {
        logger_provider: Some(logger_provider),
        meter_provider: Some(meter_provider),
    })
}

/// Per-request counters plus one `target: "request"` event per call.
#[derive(Debug, Clone)]
pub struct RequestTelemetry {
    requests_started: Counter<u64>,
    requests_succeeded: Counter<u64>,
    requests_failed: Counter<u64>,
    request_latency_ms: Histogram<f64>,
}

impl Default for RequestTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTelemetry {
    pub fn new() -> Self {
        let meter = global::meter("rackctl-requests");
        Self {
            requests_started: meter
                .u64_counter("requests_started")
                .with_description("Total tool requests started")
                .build(),
            requests_succeeded: meter.u64_counter("requests_succeeded").build(),
            requests_failed: meter.u64_counter("requests_failed").build(),
            request_latency_ms: meter
                .f64_histogram("request_latency_ms")
                .with_description("Latency per tool request in ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub async fn instrument_request<F, Fut, T>(&self, name: &str, handler: F) -> ControlResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ControlResult<T>>,
    {
        self.requests_started.add(1, &[]);
        let start = Instant::now();

        let result = handler().await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.request_latency_ms.record(elapsed, &[]);
        match &result {
            Ok(_) => {
                self.requests_succeeded.add(1, &[]);
                info!("request `{name}` succeeded in {elapsed:.1} ms");
            }
            Err(err) => {
                self.requests_failed.add(1, &[]);
                error!(error = %err, "request `{name}` failed in {elapsed:.1} ms");
            }
        }

        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request = name,
            latency_ms = elapsed,
            status = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            },
        );

        result
    }
}
