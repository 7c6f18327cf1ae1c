//! Durable output of the pipeline: cropped artifacts and the event log.
//!
//! Both live under one directory and are create/append-only from the
//! writer side. Readers (the gallery, `export_events`) take snapshots and
//! never lock.

mod artifact;
mod event_log;
mod recorder;

pub use artifact::{
    artifact_file_name, content_type_for, sanitize_label, ArtifactError, ArtifactFormat,
    ArtifactName, ArtifactReader, ArtifactStore, NotFound,
};
pub use event_log::{latest_event, read_events, DetectionEvent, EventAction, EventLog};
pub use recorder::{EventRecorder, RecordError};

/// File name of the event log inside the artifact directory.
pub const EVENT_LOG_FILE: &str = "detections.ndjson";
