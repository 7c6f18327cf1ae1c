use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Backends wrap the external inference capability: given a frame, return
/// every labelled box the model produced. They do not filter by class or by
/// confidence; `Detector` owns the class allow-list and the pipeline owns
/// the confidence policy.
///
/// Implementations must treat the frame as read-only and must not retain it
/// past the `detect` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
