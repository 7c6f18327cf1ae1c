use std::collections::VecDeque;

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend for testing. Replays scripted detections, one batch per
/// frame, then reports nothing (or repeats a fixed batch forever).
#[derive(Default)]
pub struct StubBackend {
    script: VecDeque<Vec<Detection>>,
    repeat: Option<Vec<Detection>>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// One entry per upcoming `detect` call.
    pub fn scripted(batches: Vec<Vec<Detection>>) -> Self {
        Self {
            script: batches.into(),
            ..Self::default()
        }
    }

    /// Same batch for every frame.
    pub fn repeating(batch: Vec<Detection>) -> Self {
        Self {
            repeat: Some(batch),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        if let Some(batch) = self.script.pop_front() {
            return Ok(batch);
        }
        Ok(self.repeat.clone().unwrap_or_default())
    }
}
