/*!
 * Operator Viewer
 *
 * Shows the robot stream with an FPS and latency overlay.
 */

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use avatar_stream::platform::get_system_info;
use avatar_stream::streaming::{run_viewer, spawn_shutdown_listener, ViewerOptions};
use avatar_stream::{logging, Params, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(name = "operator-view", version, about = "View the robot stream with latency overlay")]
struct Args {
    /// Path to the shared parameter file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// No display window, log FPS and latency instead
    #[arg(long)]
    headless: bool,

    /// Debug logging for this crate
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║              Avatar Operator Viewer v{:<25}║", env!("CARGO_PKG_VERSION"));
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let params = Params::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let system = get_system_info();
    info!("[Viewer] Host {} ({} {})", system.hostname, system.os, system.arch);
    info!("[Viewer] Press 'q' or ESC in the video window to quit");

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let options = ViewerOptions { headless: args.headless };
    let report = run_viewer(&params, &options, cancel)
        .await
        .context("Operator viewer failed")?;

    if let Some(avg) = report.latency.average_ms {
        info!("[Viewer] Average latency over the last samples: {:.1} ms", avg);
    }
    info!("[Viewer] ✅ Viewer closed");
    Ok(())
}
