use anyhow::{Context, anyhow};
use clap::Parser;
use log::info;
use rustls::crypto::{CryptoProvider, ring};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nombot::config::LoggerConfig;
use nombot::{App, Config, RuntimeMetrics};

/// Polls and streams exchange APIs and feeds every result through
/// the configured strategy pipeline.
#[derive(Parser, Debug)]
#[command(name = "nombot", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log filter overriding `logger.level` and RUST_LOG (e.g. `debug`,
    /// `nombot::adapters=trace`)
    #[arg(short, long)]
    log_level: Option<String>,
}

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// - Install the rustls crypto provider (wss:// endpoints)
// - Load and validate configuration (fatal on error)
// - Initialize logging from configuration
// - Build and start every service, then wait for Ctrl-C
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // rustls >= 0.23 needs an explicit provider, installed once and early.
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow!("failed to install rustls CryptoProvider"))?;

    let config = Config::load(&args.config)
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    init_logger(&config.logger, args.log_level.as_deref());

    let metrics = Arc::new(RuntimeMetrics::default());
    spawn_reporter(metrics.clone(), config.metrics.interval_secs);

    let mut app = App::build(&config, metrics.clone()).context("cannot build services")?;
    app.start()?;
    info!(
        "nombot running: {} service(s), {} poll adapter(s), {} stream adapter(s)",
        app.contexts().len(),
        app.poll_adapters().len(),
        app.stream_adapters().len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    app.shutdown().await?;
    info!("[METRICS] final {}", metrics.summary());
    Ok(())
}

/// `logger.level` first, then `logger.modules`, RUST_LOG and finally
/// `--log-level`; later filters win.
fn init_logger(cfg: &LoggerConfig, cli: Option<&str>) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&cfg.level);
    for (module, level) in &cfg.modules {
        builder.parse_filters(&format!("{module}={level}"));
    }
    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }
    if let Some(filter) = cli {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_millis().init();
}

/// Periodic one-line metrics summary.
fn spawn_reporter(metrics: Arc<RuntimeMetrics>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));
        tick.tick().await;
        loop {
            tick.tick().await;
            info!("[METRICS] {}", metrics.summary());
        }
    });
}
