use thiserror::Error;

use super::artifact::{ArtifactError, ArtifactStore};
use super::event_log::{DetectionEvent, EventAction, EventLog};
use crate::detect::Detection;
use crate::frame::Frame;

#[derive(Debug, Error)]
pub enum RecordError {
    /// Crop or image write failed; no event was appended.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// The artifact was written but the log append failed. The artifact
    /// stays on disk unreferenced.
    #[error("event log append failed after writing {artifact}: {source}")]
    Log {
        artifact: String,
        #[source]
        source: std::io::Error,
    },
}

/// Writes the artifact, then the event that references it.
///
/// Owned by the pipeline thread; it is the only writer of both the artifact
/// directory and the event log.
pub struct EventRecorder {
    artifacts: ArtifactStore,
    log: EventLog,
}

impl EventRecorder {
    pub fn new(artifacts: ArtifactStore, log: EventLog) -> Self {
        Self { artifacts, log }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn record(
        &mut self,
        frame: &Frame,
        detection: &Detection,
    ) -> Result<DetectionEvent, RecordError> {
        let rect = detection
            .bbox
            .to_pixel_rect(frame.width, frame.height)
            .ok_or_else(|| {
                ArtifactError::Crop(format!(
                    "bbox {:?} outside {}x{} frame",
                    detection.bbox, frame.width, frame.height
                ))
            })?;
        let crop = frame
            .crop(&detection.bbox)
            .map_err(|e| ArtifactError::Crop(e.to_string()))?;
        let artifact = self
            .artifacts
            .save(frame.frame_id, &detection.label, &crop)?;

        let event = DetectionEvent {
            frame_id: frame.frame_id,
            timestamp: self.log.next_timestamp(),
            label: detection.label.clone(),
            bbox: rect.to_array(),
            action: EventAction::CapturedFrame,
            confidence: detection.confidence,
            artifact,
        };
        match self.log.append(&event) {
            Ok(()) => Ok(event),
            Err(source) => Err(RecordError::Log {
                artifact: event.artifact,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::store::{read_events, ArtifactFormat};
    use tempfile::tempdir;

    fn frame(frame_id: u64) -> Frame {
        Frame::from_rgb(frame_id, 32, 24, vec![90; 32 * 24 * 3]).unwrap()
    }

    fn recorder(dir: &std::path::Path) -> EventRecorder {
        let store = ArtifactStore::open(dir, ArtifactFormat::Png).unwrap();
        let log = EventLog::open(dir.join("detections.ndjson")).unwrap();
        EventRecorder::new(store, log)
    }

    #[test]
    fn record_writes_artifact_before_event() {
        let dir = tempdir().unwrap();
        let mut recorder = recorder(dir.path());
        let detection = Detection::new("car", 0.8, BoundingBox::new(4.0, 2.0, 20.5, 12.0));

        let event = recorder.record(&frame(3), &detection).unwrap();
        assert_eq!(event.artifact, "frame_3_car.png");
        assert_eq!(event.bbox, [4, 2, 21, 12]);
        assert!(recorder.artifacts().reader().contains(&event.artifact));

        let logged = read_events(&dir.path().join("detections.ndjson")).unwrap();
        assert_eq!(logged, vec![event]);
    }

    #[test]
    fn out_of_frame_bbox_appends_nothing() {
        let dir = tempdir().unwrap();
        let mut recorder = recorder(dir.path());
        let detection = Detection::new("bus", 0.9, BoundingBox::new(100.0, 100.0, 120.0, 130.0));

        let err = recorder.record(&frame(1), &detection).unwrap_err();
        assert!(matches!(err, RecordError::Artifact(ArtifactError::Crop(_))));
        assert_eq!(recorder.log().appended(), 0);
        assert!(read_events(&dir.path().join("detections.ndjson"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn same_label_in_one_frame_shares_an_artifact() {
        let dir = tempdir().unwrap();
        let mut recorder = recorder(dir.path());
        let frame = frame(4);
        let small = Detection::new("car", 0.8, BoundingBox::new(0.0, 0.0, 4.0, 4.0));
        let wide = Detection::new("car", 0.9, BoundingBox::new(0.0, 0.0, 16.0, 8.0));

        let first = recorder.record(&frame, &small).unwrap();
        let second = recorder.record(&frame, &wide).unwrap();
        assert_eq!(first.artifact, "frame_4_car.png");
        assert_eq!(first.artifact, second.artifact);

        let events = read_events(&dir.path().join("detections.ndjson")).unwrap();
        assert_eq!(events.len(), 2);
        let stored = image::open(dir.path().join(&first.artifact)).unwrap();
        assert_eq!((stored.width(), stored.height()), (16, 8));
    }

    #[test]
    fn artifact_failure_drops_the_event() {
        let dir = tempdir().unwrap();
        let artifacts = dir.path().join("crops");
        let mut recorder = EventRecorder::new(
            ArtifactStore::open(&artifacts, ArtifactFormat::Png).unwrap(),
            EventLog::open(dir.path().join("detections.ndjson")).unwrap(),
        );
        std::fs::remove_dir_all(&artifacts).unwrap();

        let detection = Detection::new("truck", 0.7, BoundingBox::new(0.0, 0.0, 8.0, 8.0));
        let err = recorder.record(&frame(2), &detection).unwrap_err();
        assert!(matches!(err, RecordError::Artifact(ArtifactError::Io(_))));
        assert_eq!(recorder.log().appended(), 0);
    }
}
