//! gallery_api - gallery-only service
//!
//! Serves an existing artifact directory and event log. Does NOT ingest
//! the camera stream or move the camera.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use roadwatch::{ArtifactReader, GalleryServer, RoadwatchConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "ROADWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Bind address; overrides the configured gallery address.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = RoadwatchConfig::load_from(args.config.as_deref())?;
    let mut gallery_cfg = cfg.gallery.clone();
    if let Some(addr) = args.addr {
        gallery_cfg.addr = addr;
    }
    if !cfg.store.artifact_dir.is_dir() {
        log::warn!(
            "artifact directory {} does not exist yet; gallery will be empty",
            cfg.store.artifact_dir.display()
        );
    }

    let reader = ArtifactReader::new(&cfg.store.artifact_dir);
    let handle = GalleryServer::new(gallery_cfg, reader, cfg.store.event_log_path()).spawn()?;
    log::info!(
        "gallery_api serving {}",
        cfg.store.artifact_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("gallery_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping gallery...");
    handle.stop()?;

    Ok(())
}
