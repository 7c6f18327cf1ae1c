use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame-pixel coordinates, `x1 < x2`, `y1 < y2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from centre/size form as emitted by YOLO heads.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection over union; 0 when either box is degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Integer pixel rectangle clamped to a `width`x`height` frame.
    ///
    /// Returns `None` when nothing of the box remains inside the frame.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> Option<PixelRect> {
        if !self.is_valid() {
            return None;
        }
        let clamp = |v: f32, max: u32| v.max(0.0).min(max as f32) as u32;
        let rect = PixelRect {
            x1: clamp(self.x1.floor(), width),
            y1: clamp(self.y1.floor(), height),
            x2: clamp(self.x2.ceil(), width),
            y2: clamp(self.y2.ceil(), height),
        };
        if rect.x2 <= rect.x1 || rect.y2 <= rect.y1 {
            return None;
        }
        Some(rect)
    }
}

/// Half-open integer rectangle `[x1, x2) x [y1, y2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn to_array(self) -> [u32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// One labelled, confidence-scored box for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    /// Acceptance is strictly greater than the threshold.
    pub fn passes(&self, threshold: f32) -> bool {
        self.confidence > threshold
    }
}
