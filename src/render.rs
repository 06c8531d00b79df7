//! Annotation rendering.
//!
//! - `Surface`: the drawing capability the dashboard renders into.
//! - `CanvasSurface`: an in-memory RGB canvas (boxes are rasterised, labels
//!   are kept as overlay metadata).
//! - `AnnotationRenderer`: draws the raw frame, then a box and label for each
//!   prediction admitted by the `DetectionFilter`.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;

use crate::detect::{BBox, Prediction};
use crate::frame::Frame;
use crate::DetectionFilter;

/// Box and label colour.
pub const LIME: Rgb<u8> = Rgb([0, 255, 0]);

/// Stroke width of bounding boxes in pixels.
pub const STROKE_WIDTH: u32 = 2;

/// Labels sit this far above the box's top edge.
const LABEL_OFFSET: f32 = 6.0;

pub trait Surface {
    fn resize(&mut self, width: u32, height: u32);

    fn clear(&mut self);

    fn draw_frame(&mut self, frame: &Frame);

    fn stroke_rect(&mut self, bbox: &BBox);

    fn fill_text(&mut self, text: &str, x: f32, y: f32);

    /// Horizontal mirroring of the whole display.
    fn set_mirrored(&mut self, mirrored: bool);
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OverlayLabel {
    pub text: String,
    pub x: f32,
    pub y: f32,
}

// ----------------------------------------------------------------------------
// CanvasSurface
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CanvasSurface {
    image: RgbImage,
    boxes: Vec<BBox>,
    labels: Vec<OverlayLabel>,
    mirrored: bool,
}

impl CanvasSurface {
    pub fn new() -> Self {
        Self {
            image: RgbImage::new(0, 0),
            boxes: Vec::new(),
            labels: Vec::new(),
            mirrored: false,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn boxes(&self) -> &[BBox] {
        &self.boxes
    }

    pub fn labels(&self) -> &[OverlayLabel] {
        &self.labels
    }

    pub fn mirrored(&self) -> bool {
        self.mirrored
    }
}

impl Default for CanvasSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Surface for CanvasSurface {
    fn resize(&mut self, width: u32, height: u32) {
        if self.image.dimensions() != (width, height) {
            self.image = RgbImage::new(width, height);
        }
    }

    fn clear(&mut self) {
        for px in self.image.pixels_mut() {
            *px = Rgb([0, 0, 0]);
        }
        self.boxes.clear();
        self.labels.clear();
    }

    fn draw_frame(&mut self, frame: &Frame) {
        match frame.to_rgb_image() {
            Some(image) if image.dimensions() == self.image.dimensions() => self.image = image,
            Some(_) => log::debug!(
                "CanvasSurface: frame {:?} does not match canvas {:?}",
                frame.dimensions(),
                self.image.dimensions()
            ),
            None => {}
        }
    }

    fn stroke_rect(&mut self, bbox: &BBox) {
        self.boxes.push(*bbox);
        let (cw, ch) = self.image.dimensions();
        for inset in 0..STROKE_WIDTH {
            let x = bbox.x.round() as i32 + inset as i32;
            let y = bbox.y.round() as i32 + inset as i32;
            let w = bbox.width.round() as i64 - 2 * inset as i64;
            let h = bbox.height.round() as i64 - 2 * inset as i64;
            if w <= 0 || h <= 0 || cw == 0 || ch == 0 {
                break;
            }
            let rect = Rect::at(x, y).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut self.image, rect, LIME);
        }
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32) {
        self.labels.push(OverlayLabel {
            text: text.to_string(),
            x,
            y,
        });
    }

    fn set_mirrored(&mut self, mirrored: bool) {
        self.mirrored = mirrored;
    }
}

// ----------------------------------------------------------------------------
// AnnotationRenderer
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct AnnotationRenderer;

impl AnnotationRenderer {
    /// Resize to the frame, clear, and draw the raw frame.
    pub fn passthrough<S: Surface>(&self, surface: &mut S, frame: &Frame, mirrored: bool) {
        surface.set_mirrored(mirrored);
        surface.resize(frame.width, frame.height);
        surface.clear();
        surface.draw_frame(frame);
    }

    /// Draw boxes and labels; returns the predictions that were drawn.
    ///
    /// The returned set is exactly what the aggregator must see.
    pub fn overlay<'p, S: Surface>(
        &self,
        surface: &mut S,
        predictions: &'p [Prediction],
        filter: &DetectionFilter<'_>,
    ) -> Vec<&'p Prediction> {
        let admitted: Vec<&Prediction> = predictions.iter().filter(|p| filter.admits(p)).collect();
        for prediction in &admitted {
            surface.stroke_rect(&prediction.bbox);
            surface.fill_text(
                &label_for(prediction),
                prediction.bbox.x,
                prediction.bbox.y - LABEL_OFFSET,
            );
        }
        admitted
    }

    pub fn render<'p, S: Surface>(
        &self,
        surface: &mut S,
        frame: &Frame,
        mirrored: bool,
        predictions: &'p [Prediction],
        filter: &DetectionFilter<'_>,
    ) -> Vec<&'p Prediction> {
        self.passthrough(surface, frame, mirrored);
        self.overlay(surface, predictions, filter)
    }
}

/// `"<class> <pct>%"`
pub fn label_for(prediction: &Prediction) -> String {
    format!("{} {}%", prediction.class, prediction.score_percent())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Threshold, TrashTypeSet};

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![40; (width * height * 3) as usize], width, height)
    }

    #[test]
    fn passthrough_resizes_to_frame() {
        let mut surface = CanvasSurface::new();
        let renderer = AnnotationRenderer;
        renderer.passthrough(&mut surface, &frame(8, 6), false);
        assert_eq!(surface.dimensions(), (8, 6));
        assert_eq!(surface.image().get_pixel(3, 3), &Rgb([40, 40, 40]));

        renderer.passthrough(&mut surface, &frame(4, 4), true);
        assert_eq!(surface.dimensions(), (4, 4));
        assert!(surface.mirrored());
    }

    #[test]
    fn overlay_draws_only_admitted_predictions() {
        let set = TrashTypeSet::new(["bottle", "cup"]).unwrap();
        let filter = DetectionFilter::new(&set, Threshold::from_percent(50).unwrap());
        let predictions = vec![
            Prediction::new("bottle", 0.91, BBox::new(2.0, 10.0, 6.0, 5.0)),
            Prediction::new("cup", 0.5, BBox::new(0.0, 0.0, 3.0, 3.0)),
            Prediction::new("person", 0.99, BBox::new(0.0, 0.0, 3.0, 3.0)),
        ];
        let mut surface = CanvasSurface::new();
        let drawn = AnnotationRenderer.render(&mut surface, &frame(20, 20), false, &predictions, &filter);

        assert_eq!(drawn.len(), 1);
        assert_eq!(drawn[0].class, "bottle");
        assert_eq!(surface.boxes().len(), 1);
        assert_eq!(
            surface.labels(),
            &[OverlayLabel {
                text: "bottle 91%".to_string(),
                x: 2.0,
                y: 4.0,
            }]
        );
        assert_eq!(surface.image().get_pixel(2, 10), &LIME);
        assert_eq!(surface.image().get_pixel(3, 11), &LIME);
        assert_eq!(surface.image().get_pixel(4, 12), &Rgb([40, 40, 40]));
    }

    #[test]
    fn degenerate_boxes_do_not_panic() {
        let mut surface = CanvasSurface::new();
        surface.resize(4, 4);
        surface.stroke_rect(&BBox::new(1.0, 1.0, 0.0, 0.2));
        surface.stroke_rect(&BBox::new(-10.0, -10.0, 50.0, 50.0));
        assert_eq!(surface.boxes().len(), 2);
    }

    #[test]
    fn clear_drops_previous_overlay() {
        let mut surface = CanvasSurface::new();
        surface.resize(4, 4);
        surface.fill_text("cup 80%", 0.0, 0.0);
        surface.clear();
        assert!(surface.labels().is_empty());
    }
}
