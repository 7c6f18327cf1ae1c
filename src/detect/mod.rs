//! Vehicle detection.
//!
//! `DetectorBackend` wraps the external model. `Detector` adds the fixed
//! class allow-list so that only vehicles of interest leave this module.
//! Confidence thresholding is deliberately left to the caller.

mod backend;
mod backends;
mod classes;
mod result;

use std::path::Path;

use anyhow::{anyhow, Result};

pub use backend::DetectorBackend;
pub use backends::{CpuBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use classes::{label_for_class, ClassFilter, COCO_LABELS, DEFAULT_VEHICLE_CLASSES};
pub use result::{BoundingBox, Detection, PixelRect};

use crate::frame::Frame;

/// Backend plus class filter.
pub struct Detector {
    backend: Box<dyn DetectorBackend>,
    filter: ClassFilter,
}

impl Detector {
    pub fn new(backend: Box<dyn DetectorBackend>, filter: ClassFilter) -> Self {
        Self { backend, filter }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn filter(&self) -> &ClassFilter {
        &self.filter
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.backend.warm_up()
    }

    /// Detections of allowed classes, in backend order, unthresholded.
    pub fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let raw = self.backend.detect(frame)?;
        Ok(self.filter.apply(raw))
    }
}

/// Build a backend by configured name.
pub fn build_backend(name: &str, model_path: Option<&Path>) -> Result<Box<dyn DetectorBackend>> {
    match name {
        "cpu" => Ok(Box::new(CpuBackend::new())),
        "stub" => Ok(Box::new(StubBackend::new())),
        "tract" => build_tract(model_path),
        other => Err(anyhow!(
            "unknown detector backend '{}'; expected cpu, stub or tract",
            other
        )),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(model_path: Option<&Path>) -> Result<Box<dyn DetectorBackend>> {
    let path = model_path.ok_or_else(|| anyhow!("tract backend requires detector.model_path"))?;
    Ok(Box::new(TractBackend::new(path)?))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_model_path: Option<&Path>) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!("tract backend requires the backend-tract feature"))
}
