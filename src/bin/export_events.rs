//! export_events - filter and summarise the detection event log

use anyhow::{anyhow, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use roadwatch::store::{read_events, sanitize_label};
use roadwatch::{ArtifactReader, DetectionEvent, RoadwatchConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file used to locate the artifact directory and event log.
    #[arg(long, env = "ROADWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Event log to read; overrides the configured path.
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Only events with this label.
    #[arg(long)]
    label: Option<String>,
    /// Only events from this frame id onward.
    #[arg(long, default_value_t = 0)]
    since_frame: u64,
    /// Print per-label counts instead of the events.
    #[arg(long)]
    summary: bool,
    /// Report events whose artifact is missing; exits non-zero if any are.
    #[arg(long)]
    check_artifacts: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let cfg = RoadwatchConfig::load_from(args.config.as_deref())?;
    let event_log = args
        .event_log
        .clone()
        .unwrap_or_else(|| cfg.store.event_log_path());
    let artifact_dir = event_log
        .parent()
        .filter(|_| args.event_log.is_some())
        .map(PathBuf::from)
        .unwrap_or_else(|| cfg.store.artifact_dir.clone());

    let events = read_events(&event_log)?;
    let total = events.len();
    let selected = filter_events(events, args.label.as_deref(), args.since_frame);
    log::info!(
        "{} of {} events selected from {}",
        selected.len(),
        total,
        event_log.display()
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.summary {
        for (label, count) in summarise(&selected) {
            writeln!(out, "{label}\t{count}")?;
        }
    } else {
        for event in &selected {
            writeln!(out, "{}", serde_json::to_string(event)?)?;
        }
    }

    if args.check_artifacts {
        let reader = ArtifactReader::new(artifact_dir);
        let missing = missing_artifacts(&reader, &selected);
        for event in &missing {
            log::error!(
                "frame {} ({}): artifact '{}' missing",
                event.frame_id,
                event.label,
                event.artifact
            );
        }
        if !missing.is_empty() {
            return Err(anyhow!("{} events reference missing artifacts", missing.len()));
        }
    }
    Ok(())
}

fn filter_events(
    events: Vec<DetectionEvent>,
    label: Option<&str>,
    since_frame: u64,
) -> Vec<DetectionEvent> {
    let label = label.map(sanitize_label);
    events
        .into_iter()
        .filter(|event| event.frame_id >= since_frame)
        .filter(|event| {
            label
                .as_deref()
                .map_or(true, |label| sanitize_label(&event.label) == label)
        })
        .collect()
}

fn summarise(events: &[DetectionEvent]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for event in events {
        *counts.entry(event.label.clone()).or_insert(0) += 1;
    }
    counts
}

fn missing_artifacts<'a>(
    reader: &ArtifactReader,
    events: &'a [DetectionEvent],
) -> Vec<&'a DetectionEvent> {
    events
        .iter()
        .filter(|event| event.artifact.is_empty() || !reader.contains(&event.artifact))
        .collect()
}
