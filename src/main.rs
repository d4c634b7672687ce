//! Mihomo Statistic - CLI Entry Point
//!
//! Inspects and maintains the persisted connection counters:
//! prints the current totals as JSON and optionally resets them.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use mihomo_statistic::{build_manager, Config, VERSION};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mihomo-statistic")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Inspect and reset mihomo-rust connection statistics")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', short_alias = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Home directory (overrides config)
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Zero direct and proxy bandwidth totals
    #[arg(long = "reset-bandwidth")]
    reset_bandwidth: bool,

    /// Collapse the cumulative connection count to open connections
    #[arg(long = "reset-connections")]
    reset_connections: bool,
}

fn filter_level(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        "silent" => "off",
        _ => "info",
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(dir) = args.directory {
        config.home_dir = dir;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                format!("mihomo_statistic={}", filter_level(&config.log_level)).parse()?,
            ),
        )
        .init();

    info!("Mihomo Statistic v{}", VERSION);

    let manager = build_manager(&config);
    if config.statistic.persistence && !manager.is_persisted() {
        error!(
            "Counters at {} are unavailable, showing in-memory totals",
            config.store_path().display()
        );
    }

    if args.reset_bandwidth {
        manager.reset_bandwidth();
        info!("Bandwidth totals reset");
    }

    if args.reset_connections {
        manager.reset_connections();
        info!("Connection count reset");
    }

    let (active, history) = manager.connections_count();
    let (direct_up, direct_down) = manager.bandwidth_direct();
    let (proxy_up, proxy_down) = manager.bandwidth_proxy();

    let report = json!({
        "version": manager.store_version(),
        "persisted": manager.is_persisted(),
        "connections": {
            "active": active,
            "history": history,
        },
        "direct": {
            "up": direct_up,
            "down": direct_down,
        },
        "proxy": {
            "up": proxy_up,
            "down": proxy_down,
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
