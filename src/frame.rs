//! Decoded video frames.
//!
//! A `Frame` is an immutable RGB8 buffer tagged with the sequence number it
//! was read under. The pipeline owns each frame for exactly one processing
//! cycle: detection runs over it, accepted detections crop from it, and then
//! it is dropped.

use anyhow::{anyhow, Result};
use image::{imageops, RgbImage};

use crate::detect::BoundingBox;

/// Bytes per pixel for the packed RGB8 layout every source produces.
pub const RGB_CHANNELS: usize = 3;

/// One decoded image from the stream.
///
/// There is no `Clone`: a frame moves from the source into the pipeline and
/// dies there.
pub struct Frame {
    image: RgbImage,
    pub width: u32,
    pub height: u32,
    /// Monotonic per-run sequence number.
    pub frame_id: u64,
}

impl Frame {
    /// Wrap a packed RGB8 buffer. Fails when the length does not match the
    /// dimensions.
    pub fn from_rgb(frame_id: u64, width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", width, height))?;
        Ok(Self {
            image,
            width,
            height,
            frame_id,
        })
    }

    /// Read-only pixel access for detector backends.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// RGB triple at `(x, y)`. Caller guarantees bounds.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel(x, y).0
    }

    /// Extract the sub-image bounded by `bbox`, clamped to the frame.
    pub fn crop(&self, bbox: &BoundingBox) -> Result<RgbImage> {
        let rect = bbox
            .to_pixel_rect(self.width, self.height)
            .ok_or_else(|| anyhow!("bounding box {:?} lies outside the frame", bbox))?;
        let view = imageops::crop_imm(
            &self.image,
            rect.x1,
            rect.y1,
            rect.x2 - rect.x1,
            rect.y2 - rect.y1,
        );
        Ok(view.to_image())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        Frame::from_rgb(7, width, height, pixels).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::from_rgb(0, 4, 4, vec![0; 10]).is_err());
        assert!(Frame::from_rgb(0, 0, 4, vec![]).is_err());
    }

    #[test]
    fn crop_extracts_requested_region() {
        let frame = gradient_frame(16, 8);
        let crop = frame
            .crop(&BoundingBox::new(2.0, 1.0, 6.0, 4.0))
            .expect("crop");
        assert_eq!(crop.dimensions(), (4, 3));
        assert_eq!(crop.get_pixel(0, 0).0, [2, 1, 0]);
        assert_eq!(crop.get_pixel(3, 2).0, [5, 3, 0]);
    }

    #[test]
    fn crop_clamps_to_frame_edges() {
        let frame = gradient_frame(16, 8);
        let crop = frame
            .crop(&BoundingBox::new(-5.0, -2.0, 40.0, 3.0))
            .expect("crop");
        assert_eq!(crop.dimensions(), (16, 3));
    }

    #[test]
    fn crop_outside_frame_fails() {
        let frame = gradient_frame(16, 8);
        assert!(frame.crop(&BoundingBox::new(20.0, 0.0, 30.0, 4.0)).is_err());
    }
}
