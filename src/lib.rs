//! Roadwatch
//!
//! Watches a roadway through a fixed PTZ camera: detects vehicles in the live
//! stream, steers the camera toward them, records each detection as a
//! cropped image plus an NDJSON event, and serves the latest crops over HTTP.
//!
//! # Architecture
//!
//! Two execution contexts run for the life of the process:
//!
//! 1. **Pipeline** (`pipeline`): one worker thread reading frames, running
//!    the detector, recording events and queuing PTZ commands. PTZ commands
//!    go to a dispatcher thread through a single-slot mailbox, so network
//!    latency never stalls the frame loop.
//! 2. **Gallery** (`gallery`): an HTTP server that lists and serves
//!    artifacts read-only.
//!
//! They share only the artifact directory and the event log (`store`),
//! which the pipeline writes create/append-only and the gallery reads as
//! snapshots.
//!
//! # Module Structure
//!
//! - `frame`: decoded RGB frames and cropping
//! - `ingest`: frame sources (`stub://` synthetic, RTSP via GStreamer)
//! - `detect`: detector backends and the vehicle class filter
//! - `ptz`: pan/tilt/zoom command computation, digest-auth client, dispatcher
//! - `store`: artifacts, event log, recorder
//! - `pipeline`: orchestration and retry policy
//! - `gallery`: HTTP view
//! - `config`: file + environment configuration

pub mod config;
pub mod detect;
pub mod frame;
pub mod gallery;
pub mod ingest;
pub mod pipeline;
pub mod ptz;
pub mod store;

pub use config::RoadwatchConfig;
pub use detect::{BoundingBox, ClassFilter, Detection, Detector, DetectorBackend};
pub use frame::Frame;
pub use gallery::{GalleryConfig, GalleryHandle, GalleryServer};
pub use ingest::{ConnectError, FrameSource, ReadError, RtspConfig, RtspSource};
pub use pipeline::{Pipeline, PipelineHandle, PipelineState, PipelineStats, RetryPolicy};
pub use ptz::{ActuatorController, ActuatorError, PtzCommand, PtzConfig};
pub use store::{
    ArtifactFormat, ArtifactReader, ArtifactStore, DetectionEvent, EventLog, EventRecorder,
    NotFound, RecordError,
};
