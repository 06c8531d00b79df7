#![cfg(feature = "backend-tract")]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{suppress_overlaps, BBox, Prediction};

/// COCO labels in model output order.
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Candidates below this score are dropped before they reach the dashboard
/// filter; keeps the per-frame list short.
const MIN_CANDIDATE_SCORE: f32 = 0.05;
const MAX_PREDICTIONS: usize = 100;
/// Same-class boxes overlapping more than this are one object.
const NMS_IOU_THRESHOLD: f32 = 0.45;

type Plan = TypedRunnableModel<TypedModel>;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects one input `[1, 3, S, S]` (RGB, 0..1) and one output
/// `[1, 4 + classes, N]` with `cx, cy, w, h` in input pixel space.
/// The model file is read in `initialize`, not in `new`.
pub struct TractBackend {
    model_path: PathBuf,
    input_size: u32,
    model: Option<Plan>,
}

impl TractBackend {
    pub fn new(model_path: impl Into<PathBuf>, input_size: u32) -> Self {
        Self {
            model_path: model_path.into(),
            input_size,
            model: None,
        }
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let frame = RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{} RGB", width, height))?;
        let size = self.input_size;
        let resized = image::imageops::resize(&frame, size, size, FilterType::Nearest);

        let side = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, width: u32, height: u32) -> Result<Vec<Prediction>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected [1, 4 + classes, N] output")?;

        let rows = view.shape()[1];
        let candidates = view.shape()[2];
        if rows <= 4 {
            return Err(anyhow!("model output has no class rows"));
        }
        let sx = width as f32 / self.input_size as f32;
        let sy = height as f32 / self.input_size as f32;

        let mut predictions = Vec::new();
        for i in 0..candidates {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in 4..rows {
                let score = view[[0, c, i]];
                if score > best.1 {
                    best = (c - 4, score);
                }
            }
            let (class_id, score) = best;
            if !(score >= MIN_CANDIDATE_SCORE) {
                continue;
            }
            let Some(label) = COCO_LABELS.get(class_id) else {
                continue;
            };
            let cx = view[[0, 0, i]];
            let cy = view[[0, 1, i]];
            let w = view[[0, 2, i]];
            let h = view[[0, 3, i]];
            predictions.push(Prediction::new(
                *label,
                score.min(1.0),
                BBox::new((cx - w / 2.0) * sx, (cy - h / 2.0) * sy, w * sx, h * sy),
            ));
        }

        let mut predictions = suppress_overlaps(predictions, NMS_IOU_THRESHOLD);
        predictions.truncate(MAX_PREDICTIONS);
        Ok(predictions)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn initialize(&mut self) -> Result<()> {
        let side = self.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .with_context(|| {
                format!(
                    "failed to load ONNX model from {}",
                    self.model_path.display()
                )
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        self.model = Some(model);
        Ok(())
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Prediction>> {
        let input = self.build_input(pixels, width, height)?;
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("tract model not initialized"))?;
        let outputs = model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, width, height)
    }
}
