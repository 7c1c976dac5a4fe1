//! EV3 brick monitor entry point.
//!
//! ```text
//! ev3link-monitor                          Run with ev3link-monitor.toml
//! ev3link-monitor --config <path>          Load a custom config TOML
//! ev3link-monitor --brick lab=10.0.0.7     Add or override a brick
//! ev3link-monitor --snapshot-json          Print status changes as JSON
//! ev3link-monitor --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ev3link_monitor::config::MonitorConfig;
use ev3link_monitor::monitor::BrickMonitor;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ev3link-monitor", about = "Headless EV3 brick link monitor")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "ev3link-monitor.toml")]
    config: PathBuf,

    /// Brick to monitor as `id=host[:port]`; may be repeated.
    #[arg(short, long = "brick", value_name = "ID=HOST[:PORT]")]
    bricks: Vec<String>,

    /// Print registry snapshots as JSON lines on every status change.
    #[arg(long)]
    snapshot_json: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&MonitorConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = MonitorConfig::load(&cli.config);
    config.apply_overrides(&cli.bricks)?;
    config.validate()?;

    // Logs go to stderr so JSON snapshots on stdout stay parseable.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("ev3link-monitor v{}", env!("CARGO_PKG_VERSION"));
    for brick in &config.bricks {
        info!("brick {} at {}:{}", brick.id, brick.host, brick.port);
    }
    info!(
        "probe every {}ms (idle {}ms), timeout {}ms",
        config.health.active_interval_ms,
        config.health.idle_interval_ms,
        config.health.probe_timeout_ms
    );

    let monitor = BrickMonitor::with_reporting(config, cli.snapshot_json);
    let stop = monitor.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    monitor.run().await;

    Ok(())
}
