use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Args;
use tokio::io::{self, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::CliContext;
use rackctl::app::App;
use rackctl::config::ControlConfig;
use rackctl::engine::InMemoryEngine;
use rackctl::logger::init_tracing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry HTTP endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    pub otel_endpoint: Option<String>,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_endpoint: None,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let root = context.root.clone();
    if !root.exists() {
        bail!(
            "Root directory `{}` does not exist. Please run `rackctl init` first.",
            root.display()
        );
    }

    let telemetry = init_tracing(
        &root.join("logs"),
        "rackctl.log",
        "rackctl-requests.json",
        &args.log_level,
        args.otel_endpoint,
    )
    .context("could not create logger")?;

    let config = ControlConfig::from_manager(&context.config_manager, &root)
        .await
        .context("invalid configuration")?;
    info!("rackctl starting with {config:?}");

    let mut app = App::new(config);
    let router = match app.bootstrap(Arc::new(InMemoryEngine::with_demo_rack())).await {
        Ok(router) => router,
        Err(err) => {
            error!("Failed to bootstrap rackctl: {err:#}");
            telemetry.shutdown();
            return Err(err);
        }
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            on_signal.cancel();
        }
    });

    eprintln!("rackctl running; send one JSON request per line, Ctrl-C or EOF to exit");
    let served = router
        .serve(BufReader::new(io::stdin()), io::stdout(), shutdown)
        .await;

    info!("rackctl shutting down");
    app.shutdown().await;
    telemetry.shutdown();

    let handled = served?;
    info!("Handled {handled} request(s)");
    Ok(())
}
