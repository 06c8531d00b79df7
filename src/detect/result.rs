use serde::{Deserialize, Serialize};

/// Bounding box in frame pixel coordinates: top-left corner plus size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from corner coordinates (`x1,y1` top-left, `x2,y2` bottom-right).
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union; 0 when either box is empty.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One raw detector output for a single frame. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class: String,
    /// Confidence in `[0, 1]`.
    pub score: f32,
    pub bbox: BBox,
}

impl Prediction {
    pub fn new(class: impl Into<String>, score: f32, bbox: BBox) -> Self {
        Self {
            class: class.into(),
            score,
            bbox,
        }
    }

    /// Score as the integer percentage shown to users.
    pub fn score_percent(&self) -> u8 {
        (self.score * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

/// Per-class non-maximum suppression.
///
/// Keeps the highest-scoring prediction of every cluster of same-class boxes
/// overlapping by more than `iou_threshold`. Output is sorted by score,
/// highest first.
#[cfg_attr(not(feature = "backend-tract"), allow(dead_code))]
pub(crate) fn suppress_overlaps(
    mut predictions: Vec<Prediction>,
    iou_threshold: f32,
) -> Vec<Prediction> {
    predictions.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    let mut suppressed = vec![false; predictions.len()];
    for i in 0..predictions.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..predictions.len() {
            if !suppressed[j]
                && predictions[i].class == predictions[j].class
                && predictions[i].bbox.iou(&predictions[j].bbox) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
    }
    predictions
        .into_iter()
        .zip(suppressed)
        .filter_map(|(prediction, dropped)| (!dropped).then_some(prediction))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_percent_rounds_half_up() {
        let p = Prediction::new("cup", 0.875, BBox::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(p.score_percent(), 88);
        let p = Prediction::new("cup", 0.9, BBox::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(p.score_percent(), 90);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&BBox::new(20.0, 20.0, 5.0, 5.0)), 0.0);
        let half = BBox::new(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&half) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BBox::new(0.0, 0.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn overlapping_boxes_of_one_class_collapse_to_the_best() {
        let kept = suppress_overlaps(
            vec![
                Prediction::new("bottle", 0.88, BBox::new(101.0, 99.0, 40.0, 80.0)),
                Prediction::new("bottle", 0.9, BBox::new(100.0, 100.0, 40.0, 80.0)),
                Prediction::new("cup", 0.7, BBox::new(100.0, 100.0, 40.0, 80.0)),
                Prediction::new("bottle", 0.6, BBox::new(300.0, 100.0, 40.0, 80.0)),
            ],
            0.45,
        );
        let summary: Vec<(&str, f32)> = kept.iter().map(|p| (p.class.as_str(), p.score)).collect();
        assert_eq!(summary, vec![("bottle", 0.9), ("cup", 0.7), ("bottle", 0.6)]);
    }

    #[test]
    fn corners_never_produce_negative_size() {
        let b = BBox::from_corners(10.0, 10.0, 5.0, 20.0);
        assert_eq!(b.width, 0.0);
        assert_eq!(b.height, 10.0);
    }
}
