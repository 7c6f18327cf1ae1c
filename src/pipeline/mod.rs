//! Frame loop: source → detector → {recorder, actuator}.
//!
//! One worker thread owns the source, the detector, the recorder and the
//! actuator handle. Frames are processed strictly in order. Transient stream
//! errors reopen the source under a bounded backoff policy; everything else
//! stays inside the loop and never reaches the gallery.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::detect::Detector;
use crate::frame::Frame;
use crate::ingest::{ConnectError, FrameSource, ReadError};
use crate::ptz::ActuatorController;
use crate::store::{EventRecorder, RecordError};

/// Detections must score strictly above this to be recorded.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Preflight = 1,
    Running = 2,
    Retrying = 3,
    Draining = 4,
    Stopped = 5,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Preflight,
            2 => Self::Running,
            3 => Self::Retrying,
            4 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preflight => "preflight",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnect policy for transient stream errors.
///
/// `max_retries` counts consecutive reopen attempts; it resets after a frame
/// is read successfully. Zero means stop on the first read failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn fail_fast() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before reopen attempt `attempt` (1-based), doubling each time.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    events: AtomicU64,
    record_failures: AtomicU64,
    detector_failures: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    /// Detections above the threshold.
    pub accepted: u64,
    /// Detections at or below the threshold.
    pub rejected: u64,
    /// Events appended to the log.
    pub events: u64,
    pub record_failures: u64,
    pub detector_failures: u64,
    /// Successful reopens after a read failure.
    pub reconnects: u64,
}

struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Idle as u8),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, next: PipelineState) {
        let prev = PipelineState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        if prev != next {
            log::info!("pipeline: {} -> {}", prev, next);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            frames: c.frames.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            events: c.events.load(Ordering::Relaxed),
            record_failures: c.record_failures.load(Ordering::Relaxed),
            detector_failures: c.detector_failures.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    detector: Detector,
    recorder: EventRecorder,
    actuator: ActuatorController,
    threshold: f32,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Detector,
        recorder: EventRecorder,
        actuator: ActuatorController,
    ) -> Self {
        Self {
            source,
            detector,
            recorder,
            actuator,
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pre-flight the source, then run the loop on its own thread.
    ///
    /// The pre-flight open/close happens on the caller's thread; if it fails
    /// the loop never starts and the error is returned.
    pub fn start(mut self) -> Result<PipelineHandle, ConnectError> {
        let shared = Arc::new(Shared::new());
        shared.set_state(PipelineState::Preflight);
        if let Err(err) = self.source.open() {
            log::warn!("stream pre-flight failed, pipeline not started: {}", err);
            shared.set_state(PipelineState::Stopped);
            self.actuator.shutdown();
            return Err(err);
        }
        self.source.close();
        log::info!(
            "pre-flight ok: source={} detector={} threshold={} ptz={}",
            self.source.describe(),
            self.detector.backend_name(),
            self.threshold,
            if self.actuator.is_enabled() { "enabled" } else { "disabled" }
        );
        if let Err(err) = self.detector.warm_up() {
            log::warn!("detector warm-up failed: {}", err);
        }

        let shared_thread = shared.clone();
        let join = std::thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || self.run(&shared_thread))
            .map_err(|e| ConnectError::new("pipeline", format!("spawn worker: {e}")))?;

        Ok(PipelineHandle {
            shared,
            join: Some(join),
        })
    }

    fn run(mut self, shared: &Shared) {
        shared.set_state(PipelineState::Running);
        let mut attempts = 0u32;
        let mut open = match self.source.open() {
            Ok(()) => true,
            Err(err) => {
                log::warn!("stream open failed: {}", err);
                self.reconnect(shared, &mut attempts)
            }
        };
        let mut last_health_log = Instant::now();

        while open && !shared.stop_requested() {
            match self.source.next_frame() {
                Ok(frame) => {
                    attempts = 0;
                    self.process(&frame, shared);
                }
                Err(ReadError::EndOfStream) => {
                    log::info!("end of stream from {}", self.source.describe());
                    break;
                }
                Err(ReadError::Transient(reason)) => {
                    log::warn!("stream read failed: {}", reason);
                    open = self.reconnect(shared, &mut attempts);
                }
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                self.log_health(shared);
                last_health_log = Instant::now();
            }
        }

        shared.set_state(PipelineState::Draining);
        self.source.close();
        self.actuator.shutdown();
        self.log_health(shared);
        shared.set_state(PipelineState::Stopped);
    }

    /// Reopen the source under the retry policy. False when retries are
    /// exhausted or a stop was requested.
    fn reconnect(&mut self, shared: &Shared, attempts: &mut u32) -> bool {
        shared.set_state(PipelineState::Retrying);
        self.source.close();
        loop {
            if *attempts >= self.retry.max_retries {
                log::error!(
                    "giving up on {} after {} reconnect attempts",
                    self.source.describe(),
                    *attempts
                );
                return false;
            }
            *attempts += 1;
            let delay = self.retry.backoff_for(*attempts);
            log::info!(
                "reconnect attempt {}/{} in {:?}",
                *attempts,
                self.retry.max_retries,
                delay
            );
            if !sleep_unless_stopped(delay, &shared.stop) {
                return false;
            }
            match self.source.open() {
                Ok(()) => {
                    shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    shared.set_state(PipelineState::Running);
                    return true;
                }
                Err(err) => log::warn!("reconnect failed: {}", err),
            }
        }
    }

    fn process(&mut self, frame: &Frame, shared: &Shared) {
        let counters = &shared.counters;
        counters.frames.fetch_add(1, Ordering::Relaxed);
        let detections = match self.detector.infer(frame) {
            Ok(detections) => detections,
            Err(err) => {
                counters.detector_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("detector failed on frame {}: {}", frame.frame_id, err);
                return;
            }
        };

        for detection in detections {
            if !detection.passes(self.threshold) {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "frame {}: {} at {:.2} below threshold",
                    frame.frame_id,
                    detection.label,
                    detection.confidence
                );
                continue;
            }
            counters.accepted.fetch_add(1, Ordering::Relaxed);

            match self.recorder.record(frame, &detection) {
                Ok(event) => {
                    counters.events.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "event frame={} label={} conf={:.2} bbox={:?} artifact={}",
                        event.frame_id,
                        event.label,
                        event.confidence,
                        event.bbox,
                        event.artifact
                    );
                }
                Err(RecordError::Artifact(err)) => {
                    counters.record_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "frame {}: dropping {} detection: {}",
                        frame.frame_id,
                        detection.label,
                        err
                    );
                    continue;
                }
                Err(err @ RecordError::Log { .. }) => {
                    counters.record_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("frame {}: {}", frame.frame_id, err);
                }
            }

            if let Err(err) = self.actuator.center_on(&detection.bbox, frame.width) {
                log::warn!("ptz command not queued: {}", err);
            }
        }
    }

    fn log_health(&self, shared: &Shared) {
        let stats = shared.stats();
        let ptz = self.actuator.stats();
        log::info!(
            "pipeline state={} frames={} events={} rejected={} record_failures={} reconnects={} ptz_sent={} ptz_failed={} ptz_superseded={}",
            shared.state(),
            stats.frames,
            stats.events,
            stats.rejected,
            stats.record_failures,
            stats.reconnects,
            ptz.sent,
            ptz.failed,
            ptz.superseded
        );
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(STOP_POLL.min(deadline - now));
    }
}

/// Observe and stop a running pipeline.
pub struct PipelineHandle {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Ask the loop to drain and wait for it.
    pub fn stop(self) -> Result<PipelineStats> {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Wait for the loop to end on its own (end of stream, retries exhausted).
    pub fn join(mut self) -> Result<PipelineStats> {
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("pipeline thread panicked"))?;
        }
        Ok(self.shared.stats())
    }
}
