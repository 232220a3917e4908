//! uplinkd - frame acquisition and Dataverse upload daemon
//!
//! This daemon:
//! 1. Polls the vision service for frames on a fixed period
//! 2. Buffers frames in a bounded in-memory buffer
//! 3. Uploads buffered frames to a Dataverse dataset, retrying on later cycles
//! 4. Stops cleanly on Ctrl-C, finishing the cycle in flight

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use dataverse_uplink::{
    DataverseSink, PipelineController, PipelineMode, UplinkConfig, VisionApiSource,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Poll a vision service for frames and upload them to a Dataverse dataset"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "UPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the pipeline layout from the configuration.
    #[arg(long, value_enum)]
    mode: Option<PipelineMode>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = UplinkConfig::load_from(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    let source = VisionApiSource::new(config.source.clone())?;
    let sink = DataverseSink::new(config.repository.clone())?;
    let settings = config.pipeline_settings();

    log::info!(
        "uplinkd {} starting: source={} repository={} dataset={}",
        env!("CARGO_PKG_VERSION"),
        config.source.endpoint,
        config.repository.endpoint,
        config.repository.persistent_id
    );

    let mut controller = PipelineController::new(settings);
    controller
        .start(source, sink)
        .context("failed to start pipeline")?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("uplinkd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!(
        "shutdown signal received, finishing current cycle (up to {} ms)...",
        settings.shape.longest_period().as_millis()
    );
    controller.stop()?;

    let stats = controller.stats();
    log::info!(
        "uplinkd stopped: fetched={} absent={} uploaded={} failed={} evicted={} skipped_cycles={}",
        stats.fetched,
        stats.absent,
        stats.uploaded,
        stats.upload_failures,
        stats.evicted,
        stats.cycles_skipped
    );
    Ok(())
}
