use anyhow::{anyhow, Result};

use super::result::Detection;

/// COCO-80 category names, indexed by class id.
pub const COCO_LABELS: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// Vehicle classes: car, motorcycle, bus, truck.
pub const DEFAULT_VEHICLE_CLASSES: [usize; 4] = [2, 3, 5, 7];

pub fn label_for_class(class_id: usize) -> Option<&'static str> {
    COCO_LABELS.get(class_id).copied()
}

/// Fixed allow-list of labels applied before detections leave the detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassFilter {
    allowed: Vec<&'static str>,
}

impl ClassFilter {
    pub fn from_class_ids(ids: &[usize]) -> Result<Self> {
        if ids.is_empty() {
            return Err(anyhow!("class allow-list must not be empty"));
        }
        let allowed = ids
            .iter()
            .map(|&id| {
                label_for_class(id).ok_or_else(|| anyhow!("unknown COCO class id {}", id))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { allowed })
    }

    pub fn vehicles() -> Self {
        Self {
            allowed: DEFAULT_VEHICLE_CLASSES
                .iter()
                .filter_map(|&id| label_for_class(id))
                .collect(),
        }
    }

    pub fn allows(&self, label: &str) -> bool {
        self.allowed.iter().any(|allowed| *allowed == label)
    }

    pub fn labels(&self) -> &[&'static str] {
        &self.allowed
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|det| self.allows(&det.label))
            .collect()
    }
}

impl Default for ClassFilter {
    fn default() -> Self {
        Self::vehicles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn vehicle_filter_matches_default_ids() {
        let filter = ClassFilter::vehicles();
        assert_eq!(filter.labels(), &["car", "motorcycle", "bus", "truck"]);
        assert_eq!(
            ClassFilter::from_class_ids(&DEFAULT_VEHICLE_CLASSES).unwrap(),
            filter
        );
    }

    #[test]
    fn filter_drops_disallowed_labels_but_keeps_low_confidence() {
        let bbox = BoundingBox::new(0.0, 0.0, 4.0, 4.0);
        let kept = ClassFilter::vehicles().apply(vec![
            Detection::new("person", 0.99, bbox),
            Detection::new("truck", 0.1, bbox),
            Detection::new("bus", 0.8, bbox),
        ]);
        let labels: Vec<_> = kept.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["truck", "bus"]);
    }

    #[test]
    fn rejects_unknown_and_empty_ids() {
        assert!(ClassFilter::from_class_ids(&[]).is_err());
        assert!(ClassFilter::from_class_ids(&[80]).is_err());
    }
}
