//! Detector adapter.
//!
//! `Detector` wraps a `DetectorBackend` with the model lifecycle the control
//! loop depends on: the model starts `NotReady`, a single `initialize` moves
//! it to `Ready` or `Failed(reason)`, and `detect` is only legal once ready.

mod backend;
mod backends;
mod result;

use anyhow::Result;
use serde::Serialize;

use crate::config::DetectorSettings;
use crate::error::DashboardError;
use crate::frame::Frame;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::tract::COCO_LABELS;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::ScriptedBackend;
pub use result::{BBox, Prediction};

/// Model lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModelState {
    NotReady,
    Ready,
    Failed(String),
}

pub struct Detector {
    backend: Box<dyn DetectorBackend>,
    state: ModelState,
}

impl Detector {
    pub fn new(backend: Box<dyn DetectorBackend>) -> Self {
        Self {
            backend,
            state: ModelState::NotReady,
        }
    }

    pub fn from_backend<B: DetectorBackend + 'static>(backend: B) -> Self {
        Self::new(Box::new(backend))
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ModelState::Ready
    }

    /// Load the model. A ready model is not reloaded.
    ///
    /// Failures leave the detector in `Failed` until the next explicit call.
    pub fn initialize(&mut self) -> Result<(), DashboardError> {
        if self.is_ready() {
            return Ok(());
        }
        match self.backend.initialize() {
            Ok(()) => {
                log::info!("detector {}: model ready", self.backend.name());
                self.state = ModelState::Ready;
                Ok(())
            }
            Err(err) => {
                let failure = DashboardError::model(&err);
                log::error!("detector {}: {}", self.backend.name(), failure);
                self.state = ModelState::Failed(format!("{err:#}"));
                Err(failure)
            }
        }
    }

    /// Run one detection. Callers treat an error as zero predictions.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Prediction>, DashboardError> {
        if !self.is_ready() {
            return Err(DashboardError::DetectionTickFailure(
                "model not ready".to_string(),
            ));
        }
        self.backend
            .detect(frame.pixels(), frame.width, frame.height)
            .map_err(|err| DashboardError::tick(&err))
    }
}

/// Build the configured backend. Nothing is loaded until `initialize`.
pub fn backend_from_settings(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend.as_str() {
        "scripted" => Ok(Box::new(ScriptedBackend::new())),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let path = settings
                .model_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("tract backend requires detector.model_path"))?;
            Ok(Box::new(TractBackend::new(path, settings.input_size)))
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => anyhow::bail!("tract backend requires the backend-tract feature"),
        other => anyhow::bail!("unknown detector backend '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new(vec![0; 12], 2, 2)
    }

    #[test]
    fn detector_starts_not_ready_and_refuses_detect() {
        let mut detector = Detector::from_backend(ScriptedBackend::new());
        assert_eq!(detector.state(), &ModelState::NotReady);
        assert!(matches!(
            detector.detect(&frame()),
            Err(DashboardError::DetectionTickFailure(_))
        ));
    }

    #[test]
    fn initialize_failure_is_model_load_failure() {
        let mut detector =
            Detector::from_backend(ScriptedBackend::new().failing_load("no weights"));
        let err = detector.initialize().unwrap_err();
        assert!(matches!(err, DashboardError::ModelLoadFailure(_)));
        assert_eq!(
            detector.state(),
            &ModelState::Failed("no weights".to_string())
        );
        assert!(!detector.is_ready());
    }

    #[test]
    fn initialize_success_allows_detect() {
        let mut detector = Detector::from_backend(ScriptedBackend::repeating(vec![
            Prediction::new("cup", 0.7, BBox::new(0.0, 0.0, 1.0, 1.0)),
        ]));
        detector.initialize().unwrap();
        assert!(detector.is_ready());
        assert_eq!(detector.detect(&frame()).unwrap().len(), 1);
    }

    #[test]
    fn tick_failure_maps_to_detection_tick_failure() {
        let mut detector = Detector::from_backend(ScriptedBackend::new().fail_on_call(0));
        detector.initialize().unwrap();
        assert!(matches!(
            detector.detect(&frame()),
            Err(DashboardError::DetectionTickFailure(_))
        ));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let settings = DetectorSettings {
            backend: "magic".to_string(),
            ..DetectorSettings::default()
        };
        assert!(backend_from_settings(&settings).is_err());
    }
}
