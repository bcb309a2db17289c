//! # Overlay Commit - simulated display controller
//!
//! Loads a configuration, registers its outputs on the simulated display
//! controller and runs a demonstration of the window allocator and the
//! commit scheduler.

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use overlay_commit::hw::sim::SimulatedHardware;
use overlay_commit::CoreConfig;
use std::sync::Arc;
use std::time::Duration;

mod demo;

#[derive(Parser)]
#[command(name = "overlay-commit")]
#[command(about = "Hardware overlay window allocator with an atomic multi-output commit scheduler")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/overlay-commit/overlay-commit.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Simulated delay between programming a frame and its completion (ms)
    #[arg(long, default_value_t = 16)]
    latency_ms: u64,

    /// Override the hard fence timeout from the configuration (ms, 0 = unbounded)
    #[arg(long)]
    fence_timeout_ms: Option<u64>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting overlay-commit");
    info!(
        "📄 Version: {} (built {} for {}, {} profile, {})",
        env!("CARGO_PKG_VERSION"),
        env!("OVERLAY_BUILD_DATE"),
        env!("OVERLAY_BUILD_TARGET"),
        env!("OVERLAY_BUILD_PROFILE"),
        option_env!("OVERLAY_GIT_COMMIT").unwrap_or("unknown commit")
    );

    // Load configuration
    let mut config = match CoreConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            info!("📝 Using default configuration");
            CoreConfig::default()
        }
    };

    // Override config with CLI flags
    if let Some(timeout) = cli.fence_timeout_ms {
        config.timing.fence_timeout_ms = timeout;
        info!("⏱️ Fence timeout set to {} ms via CLI flag", timeout);
    }
    config.validate()?;

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let hardware = Arc::new(SimulatedHardware::with_latency(Duration::from_millis(cli.latency_ms)));
    demo::run(config, hardware).await?;

    info!("👋 overlay-commit shutting down");
    Ok(())
}
