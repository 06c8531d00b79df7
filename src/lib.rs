//! Trash Tally
//!
//! This crate implements the detection-and-logging kernel of a real-time
//! object-detection dashboard.
//!
//! # Architecture
//!
//! Frames flow through a single cooperative control loop:
//!
//! 1. **FrameSource**: the active visual input (local camera or remote image stream).
//! 2. **Detector**: a pretrained backend that turns a frame into raw predictions.
//! 3. **AnnotationRenderer**: draws the frame and boxes for predictions passing the filter.
//! 4. **Aggregator**: rate-limits predictions into discrete detection events per class,
//!    keeps the counters and the event log, and persists the counters.
//!
//! The loop is the only writer of dashboard state. Every outside actor (the
//! control API, signal handlers) talks to it through a `ControlHandle`.
//!
//! # Module Structure
//!
//! - `frame`: Frame container handed from sources to the detector and renderer
//! - `ingest`: Frame sources (camera, remote stream, synthetic)
//! - `detect`: Detector backends and model lifecycle
//! - `aggregate`: Dedup state machine, counters, event log
//! - `storage`: Key-value persistence of the aggregate snapshot
//! - `render`: Annotation surface and renderer
//! - `control`: The control loop and its command surface
//! - `api`: Loopback HTTP control API
//! - Core types: TrashTypeSet, Threshold, DetectionFilter

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

pub mod aggregate;
pub mod api;
pub mod config;
pub mod control;
pub mod detect;
pub mod error;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod render;
pub mod storage;

pub use aggregate::{
    AggregateSnapshot, AggregateState, Aggregator, DetectionEvent, Observation,
    DEFAULT_DEDUP_WINDOW,
};
pub use control::{
    Command, ControlHandle, ControlLoop, DashboardStatus, LoopSettings, LoopStats, TickOutcome,
};
pub use detect::{BBox, Detector, DetectorBackend, ModelState, Prediction, ScriptedBackend};
pub use error::DashboardError;
pub use export::events_to_csv;
pub use frame::Frame;
pub use ingest::{
    camera::CameraConfig, remote::RemoteConfig, CameraSource, Facing, FrameSource,
    RemoteImageSource, SourceInfo, SourceVariant,
};
pub use render::{AnnotationRenderer, CanvasSurface, OverlayLabel, Surface};
pub use storage::{InMemoryKeyValueStore, KeyValueStore, PersistenceStore, SqliteKeyValueStore};

// -------------------- Trash Types --------------------

const DEFAULT_TRASH_TYPES: &[&str] = &["bottle", "cup", "bowl"];

/// Validate a class name of interest.
///
/// Class names are detector labels (COCO style): lowercase, may contain
/// spaces ("wine glass"), digits, `_` and `-`.
pub fn validate_class_name(class: &str) -> Result<()> {
    static CLASS_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = match CLASS_RE.get() {
        Some(re) => re,
        None => {
            let compiled = regex::Regex::new(r"^[a-z][a-z0-9 _-]{0,63}$")?;
            CLASS_RE.get_or_init(|| compiled)
        }
    };
    if !re.is_match(class) {
        return Err(anyhow!(
            "invalid class name '{}'; expected lowercase label like 'bottle'",
            class
        ));
    }
    Ok(())
}

/// Fixed set of class names the dashboard counts.
///
/// Configured once at construction; read-only afterwards. Order follows the
/// configuration so the counter panel lists classes the way they were given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrashTypeSet {
    classes: Vec<String>,
}

impl TrashTypeSet {
    pub fn new<I, S>(classes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for class in classes {
            let class = class.into().trim().to_lowercase();
            validate_class_name(&class)?;
            if !out.contains(&class) {
                out.push(class);
            }
        }
        if out.is_empty() {
            return Err(anyhow!("trash type set must contain at least one class"));
        }
        Ok(Self { classes: out })
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for TrashTypeSet {
    fn default() -> Self {
        Self {
            classes: DEFAULT_TRASH_TYPES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

// -------------------- Threshold --------------------

/// Confidence threshold in `[0, 1]`.
///
/// Users only ever see and set it as an integer percentage.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Threshold(f32);

impl Threshold {
    pub fn from_percent(percent: u8) -> Result<Self> {
        if percent > 100 {
            return Err(anyhow!("threshold must be within 0..=100 percent"));
        }
        Ok(Self(f32::from(percent) / 100.0))
    }

    /// Clamp an arbitrary value (e.g. from a persisted snapshot) into range.
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f32 {
        self.0
    }

    pub fn percent(self) -> u8 {
        (self.0 * 100.0).round() as u8
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(0.5)
    }
}

// -------------------- Detection Filter --------------------

/// The single predicate shared by rendering and aggregation.
///
/// A prediction qualifies when its class is in the set AND its score is
/// strictly greater than the threshold.
#[derive(Clone, Copy, Debug)]
pub struct DetectionFilter<'a> {
    trash_types: &'a TrashTypeSet,
    threshold: Threshold,
}

impl<'a> DetectionFilter<'a> {
    pub fn new(trash_types: &'a TrashTypeSet, threshold: Threshold) -> Self {
        Self {
            trash_types,
            threshold,
        }
    }

    pub fn admits(&self, prediction: &Prediction) -> bool {
        self.trash_types.contains(&prediction.class) && prediction.score > self.threshold.value()
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }
}

// -------------------- Tests --------------------
