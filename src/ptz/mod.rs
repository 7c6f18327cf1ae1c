//! Pan/tilt/zoom actuation.
//!
//! `ActuatorController::center_on` turns a detection's horizontal offset into
//! a continuous-move command and hands it to a dispatcher thread through a
//! single-entry slot. The slot holds only the newest command: anything not yet
//! sent is overwritten, nothing is queued, nothing is retried. Dispatch
//! failures are counted and logged, never surfaced to the frame loop.

mod client;
mod digest;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::detect::BoundingBox;

pub use client::PtzClient;
pub use digest::{DigestAlgorithm, DigestChallenge};

/// Inclusive bound on every speed component.
pub const SPEED_LIMIT: i32 = 100;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("ptz transport error: {0}")]
    Transport(String),
    #[error("ptz endpoint answered HTTP {0}")]
    Status(u16),
    #[error("ptz authentication failed: {0}")]
    Auth(String),
    #[error("ptz control is disabled (no endpoint configured)")]
    Disabled,
    #[error("ptz dispatcher has stopped")]
    Stopped,
}

/// Continuous-velocity command. Components are clamped to `±SPEED_LIMIT`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PtzCommand {
    pub pan_speed: i32,
    pub tilt_speed: i32,
    pub zoom_speed: i32,
}

impl PtzCommand {
    pub fn new(pan_speed: i32, tilt_speed: i32, zoom_speed: i32) -> Self {
        Self {
            pan_speed: pan_speed.clamp(-SPEED_LIMIT, SPEED_LIMIT),
            tilt_speed: tilt_speed.clamp(-SPEED_LIMIT, SPEED_LIMIT),
            zoom_speed: zoom_speed.clamp(-SPEED_LIMIT, SPEED_LIMIT),
        }
    }

    /// All speeds zero: halts continuous movement.
    pub fn stop() -> Self {
        Self::default()
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<PTZData><pan>{}</pan><tilt>{}</tilt><zoom>{}</zoom></PTZData>",
            self.pan_speed, self.tilt_speed, self.zoom_speed
        )
    }
}

/// `round((center_x - frame_width / 2) / frame_width * 100)`, clamped.
pub fn pan_speed_for(bbox: &BoundingBox, frame_width: u32) -> i32 {
    if frame_width == 0 {
        return 0;
    }
    let width = frame_width as f64;
    let center_x = (bbox.x1 as f64 + bbox.x2 as f64) / 2.0;
    let offset = center_x - width / 2.0;
    let speed = (offset / width * 100.0).round();
    speed.clamp(-SPEED_LIMIT as f64, SPEED_LIMIT as f64) as i32
}

/// Maps a detection to a command. Tilt and zoom hook in here.
pub trait PtzPolicy: Send {
    fn command_for(&self, bbox: &BoundingBox, frame_width: u32) -> PtzCommand;
}

/// Pan toward the box centre; tilt and zoom stay at zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct CenteringPolicy;

impl PtzPolicy for CenteringPolicy {
    fn command_for(&self, bbox: &BoundingBox, frame_width: u32) -> PtzCommand {
        PtzCommand::new(pan_speed_for(bbox, frame_width), 0, 0)
    }
}

/// Camera endpoint settings.
#[derive(Clone, Debug, PartialEq)]
pub struct PtzConfig {
    /// e.g. "http://192.168.1.64/ISAPI/PTZCtrl/channels/1/continuous"
    pub url: String,
    pub username: String,
    pub password: String,
    /// Per-request transport timeout.
    pub timeout: Duration,
    /// Minimum spacing between dispatched commands.
    pub min_interval: Duration,
}

impl Default for PtzConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_millis(2000),
            min_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default)]
struct ActuatorStats {
    submitted: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    superseded: AtomicU64,
}

/// Counters for health logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActuatorStatsSnapshot {
    pub submitted: u64,
    pub sent: u64,
    pub failed: u64,
    pub superseded: u64,
}

#[derive(Default)]
struct SlotState {
    pending: Option<PtzCommand>,
    shutdown: bool,
}

/// Single-entry mailbox between the frame loop and the dispatcher.
#[derive(Default)]
struct CommandSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl CommandSlot {
    /// Returns true when an undispatched command was overwritten.
    fn submit(&self, command: PtzCommand) -> Result<bool, ActuatorError> {
        let mut state = self.state.lock().map_err(|_| ActuatorError::Stopped)?;
        if state.shutdown {
            return Err(ActuatorError::Stopped);
        }
        let superseded = state.pending.replace(command).is_some();
        self.ready.notify_one();
        Ok(superseded)
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.shutdown = true;
            state.pending = None;
        }
        self.ready.notify_all();
    }

    /// Block until a command is pending and `min_interval` has passed since
    /// `last_sent`. `None` once closed.
    fn next_due(&self, last_sent: Option<Instant>, min_interval: Duration) -> Option<PtzCommand> {
        let mut state = self.state.lock().ok()?;
        loop {
            if state.shutdown {
                return None;
            }
            if state.pending.is_none() {
                state = self.ready.wait(state).ok()?;
                continue;
            }
            let wait = last_sent
                .and_then(|sent| min_interval.checked_sub(sent.elapsed()))
                .filter(|wait| !wait.is_zero());
            match wait {
                Some(wait) => state = self.ready.wait_timeout(state, wait).ok()?.0,
                None => return state.pending.take(),
            }
        }
    }
}

/// Fire-and-forget PTZ controller.
pub struct ActuatorController {
    policy: Box<dyn PtzPolicy>,
    client: Option<Arc<PtzClient>>,
    slot: Arc<CommandSlot>,
    stats: Arc<ActuatorStats>,
    worker: Option<JoinHandle<()>>,
}

impl ActuatorController {
    /// Controller that computes commands but never sends them.
    pub fn disabled() -> Self {
        Self {
            policy: Box::new(CenteringPolicy),
            client: None,
            slot: Arc::new(CommandSlot::default()),
            stats: Arc::new(ActuatorStats::default()),
            worker: None,
        }
    }

    /// Start the dispatcher thread for `config`.
    pub fn spawn(config: PtzConfig) -> Result<Self, ActuatorError> {
        let client = Arc::new(PtzClient::new(
            &config.url,
            &config.username,
            &config.password,
            config.timeout,
        )?);
        let slot = Arc::new(CommandSlot::default());
        let stats = Arc::new(ActuatorStats::default());

        let worker = {
            let client = client.clone();
            let slot = slot.clone();
            let stats = stats.clone();
            std::thread::Builder::new()
                .name("ptz-dispatch".to_string())
                .spawn(move || dispatch_loop(&client, &slot, &stats, config.min_interval))
                .map_err(|e| ActuatorError::Transport(format!("spawn dispatcher: {e}")))?
        };

        Ok(Self {
            policy: Box::new(CenteringPolicy),
            client: Some(client),
            slot,
            stats,
            worker: Some(worker),
        })
    }

    /// `spawn` when an endpoint is configured, `disabled` otherwise.
    pub fn from_config(config: Option<PtzConfig>) -> Result<Self, ActuatorError> {
        match config {
            Some(config) => Self::spawn(config),
            None => Ok(Self::disabled()),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn PtzPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Compute the command for `bbox` and hand it to the dispatcher.
    ///
    /// Never waits on the network. Errors only when the dispatcher is gone.
    pub fn center_on(&self, bbox: &BoundingBox, frame_width: u32) -> Result<(), ActuatorError> {
        let command = self.policy.command_for(bbox, frame_width);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if self.client.is_none() {
            log::debug!("ptz disabled; computed {:?}", command);
            return Ok(());
        }
        if self.slot.submit(command)? {
            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Send `command` on the caller's thread, bypassing the slot.
    pub fn dispatch_now(&self, command: &PtzCommand) -> Result<(), ActuatorError> {
        let client = self.client.as_ref().ok_or(ActuatorError::Disabled)?;
        let result = client.send(command);
        match &result {
            Ok(()) => self.stats.sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn stats(&self) -> ActuatorStatsSnapshot {
        ActuatorStatsSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            superseded: self.stats.superseded.load(Ordering::Relaxed),
        }
    }

    /// Stop the dispatcher, dropping any unsent command, then halt the
    /// camera with a zero-velocity command. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.slot.close();
        if worker.join().is_err() {
            log::error!("ptz dispatcher thread panicked");
        }
        if let Err(err) = self.dispatch_now(&PtzCommand::stop()) {
            log::warn!("ptz stop command on shutdown failed: {}", err);
        }
    }
}

impl Drop for ActuatorController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(
    client: &PtzClient,
    slot: &CommandSlot,
    stats: &ActuatorStats,
    min_interval: Duration,
) {
    let mut last_sent = None;
    while let Some(command) = slot.next_due(last_sent, min_interval) {
        last_sent = Some(Instant::now());
        match client.send(&command) {
            Ok(()) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
                log::debug!("ptz command sent: {:?}", command);
            }
            Err(err) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("ptz command {:?} dropped: {}", command, err);
            }
        }
    }
    log::debug!("ptz dispatcher for {} stopped", client.url());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox_centered_at(cx: f32) -> BoundingBox {
        BoundingBox::new(cx - 10.0, 0.0, cx + 10.0, 20.0)
    }

    #[test]
    fn centered_box_yields_zero_pan() {
        assert_eq!(pan_speed_for(&bbox_centered_at(320.0), 640), 0);
    }

    #[test]
    fn left_edge_yields_minus_fifty() {
        let flush_left = BoundingBox::new(-10.0, 0.0, 10.0, 20.0);
        assert_eq!(flush_left.center_x(), 0.0);
        assert_eq!(pan_speed_for(&flush_left, 640), -50);
        assert_eq!(pan_speed_for(&bbox_centered_at(640.0), 640), 50);
    }

    #[test]
    fn out_of_range_offsets_are_clamped() {
        assert_eq!(pan_speed_for(&bbox_centered_at(5000.0), 640), 100);
        assert_eq!(pan_speed_for(&bbox_centered_at(-5000.0), 640), -100);
        assert_eq!(pan_speed_for(&bbox_centered_at(10.0), 0), 0);
    }

    #[test]
    fn pan_rounds_to_nearest() {
        assert_eq!(pan_speed_for(&bbox_centered_at(326.0), 640), 1);
        assert_eq!(pan_speed_for(&bbox_centered_at(322.0), 640), 0);
        assert_eq!(pan_speed_for(&bbox_centered_at(314.0), 640), -1);
    }

    #[test]
    fn command_clamps_and_serializes() {
        let cmd = PtzCommand::new(250, -7, -300);
        assert_eq!(cmd, PtzCommand::new(100, -7, -100));
        assert_eq!(
            cmd.to_xml(),
            "<PTZData><pan>100</pan><tilt>-7</tilt><zoom>-100</zoom></PTZData>"
        );
        assert_eq!(
            PtzCommand::stop().to_xml(),
            "<PTZData><pan>0</pan><tilt>0</tilt><zoom>0</zoom></PTZData>"
        );
    }

    #[test]
    fn disabled_controller_accepts_and_counts() {
        let controller = ActuatorController::disabled();
        controller
            .center_on(&bbox_centered_at(100.0), 640)
            .expect("disabled controller never fails center_on");
        assert!(!controller.is_enabled());
        assert_eq!(controller.stats().submitted, 1);
        assert!(matches!(
            controller.dispatch_now(&PtzCommand::stop()),
            Err(ActuatorError::Disabled)
        ));
    }

    #[test]
    fn slot_keeps_only_latest_command() {
        let slot = CommandSlot::default();
        assert!(!slot.submit(PtzCommand::new(10, 0, 0)).unwrap());
        assert!(slot.submit(PtzCommand::new(20, 0, 0)).unwrap());
        assert_eq!(
            slot.next_due(None, Duration::ZERO),
            Some(PtzCommand::new(20, 0, 0))
        );
        slot.close();
        assert_eq!(slot.next_due(None, Duration::ZERO), None);
        assert!(matches!(
            slot.submit(PtzCommand::stop()),
            Err(ActuatorError::Stopped)
        ));
    }

    #[test]
    fn slot_honours_min_interval() {
        let slot = CommandSlot::default();
        slot.submit(PtzCommand::new(5, 0, 0)).unwrap();
        let started = Instant::now();
        let cmd = slot.next_due(Some(Instant::now()), Duration::from_millis(60));
        assert_eq!(cmd, Some(PtzCommand::new(5, 0, 0)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
