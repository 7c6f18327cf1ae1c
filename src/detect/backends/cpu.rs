use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const DEFAULT_LUMA_THRESHOLD: u8 = 200;
const DEFAULT_MIN_PIXELS: u64 = 16;

/// CPU backend for bright-region detection.
///
/// Reports the bounding box of all pixels brighter than a luma threshold as a
/// single `car`. Confidence grows with how densely the box is filled, so a
/// solid blob scores 1.0 and scattered glare scores low. This pairs with the
/// synthetic stream for end-to-end runs without a model.
pub struct CpuBackend {
    luma_threshold: u8,
    min_pixels: u64,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            luma_threshold: DEFAULT_LUMA_THRESHOLD,
            min_pixels: DEFAULT_MIN_PIXELS,
        }
    }

    pub fn with_threshold(mut self, luma_threshold: u8) -> Self {
        self.luma_threshold = luma_threshold;
        self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        let mut count = 0u64;

        for y in 0..frame.height {
            for x in 0..frame.width {
                if luma(frame.rgb_at(x, y)) >= self.luma_threshold {
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                    count += 1;
                }
            }
        }

        if count < self.min_pixels {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        );
        let fill = count as f32 / bbox.area();
        let confidence = (0.4 + 0.6 * fill).clamp(0.0, 1.0);
        Ok(vec![Detection::new("car", confidence, bbox)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_block(x0: u32, y0: u32, w: u32, h: u32) -> Frame {
        let (width, height) = (32u32, 24u32);
        let mut pixels = vec![10u8; (width * height * 3) as usize];
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                let idx = ((y * width + x) * 3) as usize;
                pixels[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        Frame::from_rgb(0, width, height, pixels).unwrap()
    }

    #[test]
    fn cpu_backend_boxes_bright_block() {
        let mut backend = CpuBackend::new();
        let dets = backend.detect(&frame_with_block(4, 6, 8, 5)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "car");
        assert_eq!(dets[0].bbox, BoundingBox::new(4.0, 6.0, 12.0, 11.0));
        assert!((dets[0].confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cpu_backend_ignores_dark_frames() {
        let mut backend = CpuBackend::new();
        let dets = backend.detect(&frame_with_block(0, 0, 2, 2)).unwrap();
        assert!(dets.is_empty());
    }
}
