use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nebula_watch::config::{parse_target_spec, MonitorConfig};
use nebula_watch::engine::Engine;
use nebula_watch::link::{InterfaceLink, LinkStatus};
use nebula_watch::monitor::ScanSummary;
use nebula_watch::notify::{AlertChannel, LogChannel};
use nebula_watch::resource::ProcMeminfo;
use nebula_watch::server;
use nebula_watch::types::TargetSnapshot;

/// Endpoint monitor with debounced outage and recovery alerts.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "nebula-watch",
    version,
    about = "Endpoint monitor: periodic health checks with debounced outage alerts.",
    long_about = None
)]
struct Cli {
    /// Path to a JSON configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra target as `name|url[|health_path[|kind]]`. Repeatable.
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Override the scan interval in milliseconds.
    #[arg(long = "interval-ms")]
    interval_ms: Option<u64>,

    /// Serve the status API on this address (e.g. 127.0.0.1:8080).
    #[arg(long = "serve-api")]
    serve_api: Option<String>,

    /// Run a single scan pass, print the results and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// With --once, also write results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write alert messages to the log when no alert channel is configured.
    #[arg(long = "log-alerts", default_value_t = false)]
    log_alerts: bool,
}

#[derive(Debug, Serialize)]
struct OnceReport<'a> {
    summary: Option<&'a ScanSummary>,
    targets: &'a [TargetSnapshot],
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nebula_watch=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing::info!(
        targets = config.targets.len(),
        interval_ms = config.scan.interval_ms,
        failure_threshold = config.alert.failure_threshold,
        alert_cooldown_ms = config.alert.alert_cooldown_ms,
        channel = config.channel.is_usable(),
        "configuration loaded"
    );

    let channel = (cli.log_alerts && !config.channel.is_usable())
        .then(|| Arc::new(LogChannel) as Arc<dyn AlertChannel>);
    let link: Arc<dyn LinkStatus> = Arc::new(InterfaceLink);
    let mut engine = Engine::build(config, link, ProcMeminfo::new(), channel)
        .context("failed to initialize monitor")?;

    if cli.once {
        let summary = engine.run_once().await;
        let targets = engine.snapshots();
        print_results_table(&targets, summary.as_ref());
        if let Some(path) = cli.output.as_deref() {
            let report = OnceReport {
                summary: summary.as_ref(),
                targets: &targets,
            };
            match write_json(path, &report) {
                Ok(()) => println!("Wrote JSON results to {}", path.display()),
                Err(e) => tracing::error!(
                    path = %path.display(),
                    error = %format!("{e:#}"),
                    "failed to write JSON"
                ),
            }
        }
        return Ok(());
    }

    if engine.announce_startup().await {
        tracing::info!("startup announcement sent");
    }

    let shutdown = CancellationToken::new();
    let api = cli.serve_api.clone().map(|bind| {
        let state = engine.app_state();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(&bind, state, shutdown).await {
                tracing::error!(error = %format!("{e:#}"), "status API stopped");
            }
        })
    });

    let handle = engine.start(Vec::new()).context("failed to start scheduler")?;
    tracing::info!("monitoring; press Ctrl+C to stop");
    let _ = tokio::signal::ctrl_c().await;

    tracing::info!("shutting down");
    shutdown.cancel();
    tokio::task::spawn_blocking(move || handle.stop())
        .await
        .context("scheduler shutdown failed")?;
    if let Some(api) = api {
        let _ = tokio::time::timeout(Duration::from_secs(5), api).await;
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<MonitorConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::default(),
    };
    let extra = cli
        .targets
        .iter()
        .map(|s| parse_target_spec(s))
        .collect::<Result<Vec<_>, _>>()?;
    config.push_targets(extra)?;
    if let Some(ms) = cli.interval_ms {
        config.scan.interval_ms = ms;
        config.validate()?;
    }
    Ok(config)
}

fn print_results_table(targets: &[TargetSnapshot], summary: Option<&ScanSummary>) {
    let mut name_w = "name".len();
    let mut url_w = "url".len();
    for t in targets {
        name_w = name_w.max(t.name.len());
        url_w = url_w.max(t.url.len().min(60));
    }
    let kind_w = "health_check".len();
    let status_w = "unknown".len();
    let lat_w = "latency".len().max(9);

    match summary {
        Some(s) => println!(
            "\nChecked: {} (up: {}, down: {}, skipped: {}) in {} ms",
            s.checked, s.up, s.down, s.skipped, s.duration_ms
        ),
        None => println!("\nScan did not run"),
    }
    println!(
        "{:<name_w$}  {:<kind_w$}  {:<status_w$}  {:>lat_w$}  {:<url_w$}",
        "name", "kind", "status", "latency", "url"
    );
    println!(
        "{:-<name_w$}  {:-<kind_w$}  {:-<status_w$}  {:-<lat_w$}  {:-<url_w$}",
        "", "", "", "", ""
    );
    for t in targets {
        let mut url = t.url.clone();
        if url.len() > 60 {
            let mut cut = 60;
            while !url.is_char_boundary(cut) {
                cut -= 1;
            }
            url.truncate(cut);
        }
        let kind = match t.kind {
            nebula_watch::types::CheckKind::Reachability => "reachability",
            nebula_watch::types::CheckKind::HealthCheck => "health_check",
        };
        println!(
            "{:<name_w$}  {:<kind_w$}  {:<status_w$}  {:>lat_w$}  {:<url_w$}",
            t.name,
            kind,
            t.status.as_str().to_lowercase(),
            t.latency_text(),
            url
        );
    }
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
