#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::classes::label_for_class;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// YOLOv5 export: `[cx, cy, w, h, objectness, class scores...]` per row.
const BOX_FIELDS: usize = 5;
const DEFAULT_INPUT_SIZE: u32 = 640;
/// Same floor the YOLOv5 hub model applies before its own NMS.
const CANDIDATE_FLOOR: f32 = 0.25;
const NMS_IOU: f32 = 0.45;

/// Tract-based backend for YOLOv5 ONNX inference.
///
/// This backend loads a local model file and performs inference on RGB frames.
/// It does not perform any network I/O or write to disk beyond model loading.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_width: u32,
    input_height: u32,
    candidate_floor: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Self::with_input_size(model_path, DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE)
    }

    pub fn with_input_size<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width: width,
            input_height: height,
            candidate_floor: CANDIDATE_FLOOR,
            iou_threshold: NMS_IOU,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = image::imageops::resize(
            &image,
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, self.input_width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        let cols = *shape
            .last()
            .ok_or_else(|| anyhow!("model output has no dimensions"))?;
        if cols <= BOX_FIELDS {
            return Err(anyhow!("model output rows too short: {}", cols));
        }
        let values: Vec<f32> = view.iter().copied().collect();

        let sx = frame.width as f32 / self.input_width as f32;
        let sy = frame.height as f32 / self.input_height as f32;

        let mut candidates: Vec<(usize, Detection)> = Vec::new();
        for row in values.chunks_exact(cols) {
            let objectness = row[4];
            let Some((class_id, class_score)) = row[BOX_FIELDS..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            let confidence = objectness * class_score;
            if confidence < self.candidate_floor {
                continue;
            }
            let Some(label) = label_for_class(class_id) else {
                continue;
            };
            let bbox = BoundingBox::from_center(row[0] * sx, row[1] * sy, row[2] * sx, row[3] * sy);
            if !bbox.is_valid() {
                continue;
            }
            candidates.push((class_id, Detection::new(label, confidence.min(1.0), bbox)));
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Class-wise greedy NMS, highest confidence first.
fn non_max_suppression(mut xs: Vec<(usize, Detection)>, iou_threshold: f32) -> Vec<Detection> {
    xs.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));
    let mut kept: Vec<(usize, Detection)> = Vec::new();
    for (class_id, det) in xs {
        let overlaps = kept
            .iter()
            .any(|(k_class, k)| *k_class == class_id && k.bbox.iou(&det.bbox) > iou_threshold);
        if !overlaps {
            kept.push((class_id, det));
        }
    }
    kept.into_iter().map(|(_, det)| det).collect()
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}
