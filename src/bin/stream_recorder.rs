/*!
 * Stream Recorder
 *
 * Saves the robot stream to MP4 and logs per-frame latency alongside it.
 */

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use avatar_stream::streaming::{run_recorder, spawn_shutdown_listener, RecorderOptions};
use avatar_stream::{logging, Params, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(name = "stream-recorder", version, about = "Record the robot stream to a file")]
struct Args {
    /// Path to the shared parameter file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory to save recordings, overrides `recorder.output_dir`
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Debug logging for this crate
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let params = Params::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    info!("[Recorder] Press Ctrl+C to stop recording");

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let options = RecorderOptions { output_dir: args.output_dir };
    let report = run_recorder(&params, &options, cancel)
        .await
        .context("Recorder failed")?;

    if report.metrics.matched > 0 {
        info!(
            "[Recorder] {} of {} frames measured",
            report.metrics.matched, report.metrics.frames_received
        );
    }
    Ok(())
}
