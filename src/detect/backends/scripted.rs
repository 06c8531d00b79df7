use anyhow::{anyhow, Result};
use std::collections::HashSet;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Prediction;

/// Deterministic backend for tests and demos.
///
/// Replays a script of per-frame predictions, cycling when it runs out.
/// Can be told to fail model load or to fail individual detect calls.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    script: Vec<Vec<Prediction>>,
    calls: usize,
    load_failure: Option<String>,
    failing_calls: HashSet<usize>,
    loaded: bool,
}

impl ScriptedBackend {
    /// A backend that never predicts anything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Same predictions on every frame.
    pub fn repeating(predictions: Vec<Prediction>) -> Self {
        Self::sequence(vec![predictions])
    }

    /// One entry per frame, cycled.
    pub fn sequence(frames: Vec<Vec<Prediction>>) -> Self {
        Self {
            script: frames,
            ..Self::default()
        }
    }

    /// Model load will fail with `reason`.
    pub fn failing_load(mut self, reason: &str) -> Self {
        self.load_failure = Some(reason.to_string());
        self
    }

    /// The detect call with this zero-based index will fail.
    pub fn fail_on_call(mut self, call: usize) -> Self {
        self.failing_calls.insert(call);
        self
    }

    /// Number of detect calls made so far.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn initialize(&mut self) -> Result<()> {
        if let Some(reason) = &self.load_failure {
            return Err(anyhow!("{}", reason));
        }
        self.loaded = true;
        Ok(())
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Prediction>> {
        if !self.loaded {
            return Err(anyhow!("scripted backend not initialized"));
        }
        let call = self.calls;
        self.calls += 1;
        if self.failing_calls.contains(&call) {
            return Err(anyhow!("scripted failure on call {}", call));
        }
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.script[call % self.script.len()].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BBox;

    fn bottle() -> Prediction {
        Prediction::new("bottle", 0.9, BBox::new(1.0, 2.0, 3.0, 4.0))
    }

    #[test]
    fn scripted_backend_cycles_script() -> Result<()> {
        let mut backend = ScriptedBackend::sequence(vec![vec![bottle()], vec![]]);
        backend.initialize()?;

        assert_eq!(backend.detect(b"", 0, 0)?.len(), 1);
        assert_eq!(backend.detect(b"", 0, 0)?.len(), 0);
        assert_eq!(backend.detect(b"", 0, 0)?.len(), 1);
        assert_eq!(backend.calls(), 3);
        Ok(())
    }

    #[test]
    fn scripted_backend_requires_initialize() {
        let mut backend = ScriptedBackend::repeating(vec![bottle()]);
        assert!(backend.detect(b"", 0, 0).is_err());
    }

    #[test]
    fn scripted_backend_reports_configured_failures() -> Result<()> {
        let mut failing = ScriptedBackend::new().failing_load("weights missing");
        let err = failing.initialize().unwrap_err();
        assert!(err.to_string().contains("weights missing"));

        let mut backend = ScriptedBackend::repeating(vec![bottle()]).fail_on_call(1);
        backend.initialize()?;
        assert!(backend.detect(b"", 0, 0).is_ok());
        assert!(backend.detect(b"", 0, 0).is_err());
        assert!(backend.detect(b"", 0, 0).is_ok());
        Ok(())
    }
}
