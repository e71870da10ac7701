/*!
 * Robot Streamer
 *
 * Captures the robot camera and streams it to the operator, tagging every
 * frame for latency measurement.
 */

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use avatar_stream::platform::get_system_info;
use avatar_stream::streaming::{run_sender, spawn_shutdown_listener, SenderOptions};
use avatar_stream::{logging, Params, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(name = "robot-stream", version, about = "Stream the robot camera to the operator")]
struct Args {
    /// Path to the shared parameter file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Capture device, overrides `video.device`
    #[arg(long)]
    device: Option<String>,

    /// Stream without frame tags or timestamps
    #[arg(long)]
    no_tag: bool,

    /// Debug logging for this crate
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║              Avatar Robot Streamer v{:<26}║", env!("CARGO_PKG_VERSION"));
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let mut params = Params::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(device) = args.device {
        params.video.device = Some(device);
    }

    let system = get_system_info();
    info!("[Robot] Host {} ({} {})", system.hostname, system.os, system.arch);
    info!(
        "[Robot] Streaming to {}:{}",
        params.network.operator_ip, params.network.video_port
    );

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let options = SenderOptions { no_tag: args.no_tag };
    let report = run_sender(&params, &options, cancel)
        .await
        .context("Robot streamer failed")?;

    info!("[Robot] ✅ Stopped after {:.1}s", report.uptime.as_secs_f64());
    Ok(())
}
