//! roadwatchd - roadway detection daemon
//!
//! This daemon:
//! 1. Pre-flights the camera stream
//! 2. Runs the detection pipeline in the background when the stream is up
//! 3. Steers the PTZ camera toward accepted detections
//! 4. Records crops and NDJSON events under the artifact directory
//! 5. Serves the gallery, even when the pipeline is not running

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use roadwatch::detect::build_backend;
use roadwatch::{
    ActuatorController, ArtifactReader, ArtifactStore, Detector, EventLog, EventRecorder,
    GalleryHandle, GalleryServer, Pipeline, PipelineHandle, RoadwatchConfig, RtspSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "ROADWATCH_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = RoadwatchConfig::load_from(args.config.as_deref())?;

    log::info!(
        "roadwatchd {} writing to {}",
        env!("CARGO_PKG_VERSION"),
        cfg.store.artifact_dir.display()
    );
    let pipeline = match start_pipeline(&cfg) {
        Ok(handle) => Some(handle),
        Err(err) => {
            log::warn!("pipeline not started ({:#}); serving existing artifacts only", err);
            None
        }
    };

    let gallery = match spawn_gallery(&cfg) {
        Ok(handle) => handle,
        Err(err) => {
            if let Some(pipeline) = pipeline {
                let _ = pipeline.stop();
            }
            return Err(err);
        }
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("roadwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    if let Some(pipeline) = pipeline {
        let stats = pipeline.stop()?;
        log::info!(
            "pipeline stopped: frames={} events={} record_failures={}",
            stats.frames,
            stats.events,
            stats.record_failures
        );
    }
    gallery.stop()?;

    Ok(())
}

/// Everything on the pipeline side. Any failure here leaves the process
/// running with the gallery alone.
fn start_pipeline(cfg: &RoadwatchConfig) -> Result<PipelineHandle> {
    let artifacts = ArtifactStore::open(&cfg.store.artifact_dir, cfg.store.image_format)
        .with_context(|| {
            format!(
                "open artifact directory {}",
                cfg.store.artifact_dir.display()
            )
        })?;
    let recorder = EventRecorder::new(artifacts, EventLog::open(cfg.store.event_log_path())?);

    let backend = build_backend(&cfg.detector.backend, cfg.detector.model_path.as_deref())?;
    let detector = Detector::new(backend, cfg.class_filter()?);
    let actuator = ActuatorController::from_config(cfg.ptz_config())?;
    let source = RtspSource::new(cfg.rtsp_config());

    let handle = Pipeline::new(Box::new(source), detector, recorder, actuator)
        .with_threshold(cfg.detector.confidence_threshold)
        .with_retry(cfg.retry)
        .start()?;
    Ok(handle)
}

fn spawn_gallery(cfg: &RoadwatchConfig) -> Result<GalleryHandle> {
    let reader = ArtifactReader::new(&cfg.store.artifact_dir);
    GalleryServer::new(cfg.gallery.clone(), reader, cfg.store.event_log_path()).spawn()
}
