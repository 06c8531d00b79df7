//! Control loop.
//!
//! `ControlLoop` is the single owner of dashboard state: frame source,
//! detector, aggregator and render surface. Each tick it reads one frame,
//! renders the passthrough, runs one detection, and feeds the admitted
//! predictions to the overlay and the aggregator. Ticks never overlap.
//!
//! State machine: `{Paused, Running} x {ModelNotReady, ModelReady}`. Only
//! `Running x ModelReady` performs inference. Pause takes effect at the next
//! tick boundary; a detection already in flight when pause is requested is
//! completed and its results are dropped.
//!
//! Everything outside the loop (HTTP API, signal handlers) goes through a
//! cloneable `ControlHandle`. The pause flag is shared atomically; every
//! other request is a `Command` processed between ticks.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use crate::aggregate::Aggregator;
use crate::config::DashboardConfig;
use crate::detect::{Detector, ModelState};
use crate::error::DashboardError;
use crate::export::events_to_csv;
use crate::ingest::{FrameSource, SourceInfo, SourceVariant};
use crate::render::{AnnotationRenderer, Surface};
use crate::storage::{KeyValueStore, PersistenceStore};
use crate::{DetectionFilter, Threshold, TrashTypeSet};

const DEFAULT_HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// Settings, stats, outcomes
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct LoopSettings {
    /// Pause between ticks (display refresh cadence).
    pub tick_interval: Duration,
    /// Draw the raw frame even while paused or before the model is ready.
    pub render_while_idle: bool,
    pub health_log_interval: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &DashboardConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            render_while_idle: config.render_while_idle,
            health_log_interval: DEFAULT_HEALTH_LOG_INTERVAL,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(16),
            render_while_idle: false,
            health_log_interval: DEFAULT_HEALTH_LOG_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub inferences: u64,
    pub tick_failures: u64,
    pub skipped_frames: u64,
    pub discarded: u64,
    pub events: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Paused or model not ready; no inference.
    Idle,
    /// No ready frame this tick.
    NoFrame,
    /// Paused while detection was in flight; results dropped.
    Discarded,
    Processed { drawn: usize, emitted: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorOrigin {
    Model,
    Source,
}

/// Counter panel and log, as shown to the user.
#[derive(Clone, Debug, Serialize)]
pub struct DashboardStatus {
    pub total: u64,
    pub counts: BTreeMap<String, u64>,
    pub threshold_percent: u8,
    pub paused: bool,
    pub model: ModelState,
    pub source: Option<SourceInfo>,
    pub mirrored: bool,
    pub last_detection: Option<String>,
    pub last_error: Option<String>,
    /// Newest first.
    pub log: Vec<String>,
    pub stats: LoopStats,
}

// ----------------------------------------------------------------------------
// Commands and handle
// ----------------------------------------------------------------------------

type Reply<T> = mpsc::Sender<T>;

pub enum Command {
    SetThreshold {
        threshold: Threshold,
        reply: Reply<Threshold>,
    },
    Reset {
        reply: Reply<()>,
    },
    SwitchCamera {
        reply: Reply<Result<(), DashboardError>>,
    },
    UseRemoteStream {
        url: String,
        reply: Reply<Result<(), DashboardError>>,
    },
    InitializeModel {
        reply: Reply<Result<(), DashboardError>>,
    },
    DownloadLog {
        reply: Reply<String>,
    },
    Status {
        reply: Reply<DashboardStatus>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Command>,
    paused: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl ControlHandle {
    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| anyhow!("control loop is not running"))?;
        reply_rx
            .recv_timeout(REQUEST_TIMEOUT)
            .map_err(|_| anyhow!("control loop did not answer"))
    }

    /// `percent` must be within 0..=100.
    pub fn set_threshold(&self, percent: u8) -> Result<Threshold> {
        let threshold = Threshold::from_percent(percent)?;
        self.request(|reply| Command::SetThreshold { threshold, reply })
    }

    /// Flip the pause flag; returns the new paused state.
    pub fn toggle_pause(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply })
    }

    /// `DashboardError` failures are returned inside the `anyhow::Error`.
    pub fn switch_camera(&self) -> Result<()> {
        self.request(|reply| Command::SwitchCamera { reply })?
            .map_err(Into::into)
    }

    pub fn use_remote_stream(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.request(|reply| Command::UseRemoteStream { url, reply })?
            .map_err(Into::into)
    }

    pub fn initialize_model(&self) -> Result<()> {
        self.request(|reply| Command::InitializeModel { reply })?
            .map_err(Into::into)
    }

    /// CSV export of the log, oldest first.
    pub fn download_log(&self) -> Result<String> {
        self.request(|reply| Command::DownloadLog { reply })
    }

    pub fn status(&self) -> Result<DashboardStatus> {
        self.request(|reply| Command::Status { reply })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// ControlLoop
// ----------------------------------------------------------------------------

pub struct ControlLoop<S: Surface> {
    detector: Detector,
    source: FrameSource,
    aggregator: Aggregator,
    surface: S,
    renderer: AnnotationRenderer,
    trash_types: TrashTypeSet,
    settings: LoopSettings,
    paused: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    commands: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    last_error: Option<(ErrorOrigin, String)>,
    stats: LoopStats,
}

impl<S: Surface> ControlLoop<S> {
    pub fn new(
        detector: Detector,
        source: FrameSource,
        aggregator: Aggregator,
        surface: S,
        trash_types: TrashTypeSet,
        settings: LoopSettings,
    ) -> Self {
        let (command_tx, commands) = mpsc::channel();
        Self {
            detector,
            source,
            aggregator,
            surface,
            renderer: AnnotationRenderer,
            trash_types,
            settings,
            paused: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            commands,
            command_tx,
            last_error: None,
            stats: LoopStats::default(),
        }
    }

    /// Wire a loop from configuration. No model is loaded and no source is
    /// acquired yet.
    pub fn from_config(
        config: &DashboardConfig,
        store: Box<dyn KeyValueStore>,
        detector: Detector,
        surface: S,
    ) -> Self {
        let aggregator = Aggregator::new(
            PersistenceStore::new(store, &config.state_key),
            &config.trash_types,
            config.threshold,
            config.dedup_window,
        );
        Self::new(
            detector,
            FrameSource::new(config.camera.clone()),
            aggregator,
            surface,
            config.trash_types.clone(),
            LoopSettings::from_config(config),
        )
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.command_tx.clone(),
            paused: Arc::clone(&self.paused),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    // -------------------- user actions --------------------

    pub fn initialize_model(&mut self) -> Result<(), DashboardError> {
        let result = self.detector.initialize();
        self.record(ErrorOrigin::Model, &result);
        result
    }

    /// Switch the frame source (camera facing or remote stream).
    pub fn activate(&mut self, variant: SourceVariant) -> Result<(), DashboardError> {
        let result = self.source.switch_to(variant);
        self.record(ErrorOrigin::Source, &result);
        result
    }

    pub fn switch_camera(&mut self) -> Result<(), DashboardError> {
        let result = self.source.switch_camera();
        self.record(ErrorOrigin::Source, &result);
        result
    }

    pub fn set_threshold(&mut self, threshold: Threshold) {
        log::info!("threshold set to {}%", threshold.percent());
        self.aggregator.set_threshold(threshold);
    }

    pub fn toggle_pause(&mut self) -> bool {
        !self.paused.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Full wipe: persisted snapshot, counters, log, cooldowns, pause flag.
    pub fn reset(&mut self) {
        self.aggregator.reset();
        self.paused.store(false, Ordering::SeqCst);
        self.last_error = None;
        self.stats = LoopStats::default();
    }

    pub fn export_csv(&self) -> String {
        events_to_csv(self.aggregator.log())
    }

    fn record(&mut self, origin: ErrorOrigin, result: &Result<(), DashboardError>) {
        match result {
            Ok(()) => {
                if matches!(&self.last_error, Some((o, _)) if *o == origin) {
                    self.last_error = None;
                }
            }
            Err(err) => {
                log::error!("{}", err);
                self.last_error = Some((origin, err.to_string()));
            }
        }
    }

    // -------------------- loop --------------------

    /// One tick at monotonic `now` / wall-clock `wall`.
    pub fn tick(&mut self, now: Instant, wall: DateTime<Local>) -> TickOutcome {
        self.stats.ticks += 1;

        if !self.detector.is_ready() || self.is_paused() {
            if self.settings.render_while_idle {
                if let Some(frame) = self.source.current() {
                    self.renderer
                        .passthrough(&mut self.surface, &frame, self.source.mirrored());
                }
            }
            return TickOutcome::Idle;
        }

        let Some(frame) = self.source.current() else {
            self.stats.skipped_frames += 1;
            return TickOutcome::NoFrame;
        };
        self.renderer
            .passthrough(&mut self.surface, &frame, self.source.mirrored());

        let predictions = match self.detector.detect(&frame) {
            Ok(predictions) => {
                self.stats.inferences += 1;
                predictions
            }
            Err(err) => {
                log::error!("{}", err);
                self.stats.tick_failures += 1;
                Vec::new()
            }
        };

        if self.is_paused() {
            self.stats.discarded += 1;
            log::debug!("paused during detection; dropped {} predictions", predictions.len());
            return TickOutcome::Discarded;
        }

        let filter = DetectionFilter::new(&self.trash_types, self.aggregator.threshold());
        let admitted = self
            .renderer
            .overlay(&mut self.surface, &predictions, &filter);
        let mut emitted = 0;
        for prediction in &admitted {
            if self.aggregator.observe(prediction, now, wall).is_emitted() {
                emitted += 1;
            }
        }
        self.stats.events += emitted as u64;
        TickOutcome::Processed {
            drawn: admitted.len(),
            emitted,
        }
    }

    /// Apply every queued command. Returns false once shutdown was requested.
    pub fn process_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        !self.shutdown.load(Ordering::SeqCst)
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::SetThreshold { threshold, reply } => {
                self.set_threshold(threshold);
                let _ = reply.send(self.aggregator.threshold());
            }
            Command::Reset { reply } => {
                self.reset();
                let _ = reply.send(());
            }
            Command::SwitchCamera { reply } => {
                let result = self.switch_camera();
                let _ = reply.send(result);
            }
            Command::UseRemoteStream { url, reply } => {
                let result = self.activate(SourceVariant::RemoteImage(url));
                let _ = reply.send(result);
            }
            Command::InitializeModel { reply } => {
                let result = self.initialize_model();
                let _ = reply.send(result);
            }
            Command::DownloadLog { reply } => {
                let _ = reply.send(self.export_csv());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {
                self.shutdown.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Run until shutdown. Never exits on a tick error.
    pub fn run(&mut self) {
        log::info!(
            "control loop running (tick every {:?}, detector {})",
            self.settings.tick_interval,
            self.detector.name()
        );
        let mut last_health = Instant::now();
        while self.process_commands() {
            self.tick(Instant::now(), Local::now());

            if last_health.elapsed() >= self.settings.health_log_interval {
                log::debug!(
                    "loop health: ticks={} inferences={} failures={} events={} total={}",
                    self.stats.ticks,
                    self.stats.inferences,
                    self.stats.tick_failures,
                    self.stats.events,
                    self.aggregator.total()
                );
                last_health = Instant::now();
            }
            std::thread::sleep(self.settings.tick_interval);
        }
        self.source.stop();
        log::info!("control loop stopped");
    }

    // -------------------- views --------------------

    pub fn status(&self) -> DashboardStatus {
        let counts = self
            .trash_types
            .iter()
            .map(|class| (class.to_string(), self.aggregator.count(class)))
            .collect();
        DashboardStatus {
            total: self.aggregator.total(),
            counts,
            threshold_percent: self.aggregator.threshold().percent(),
            paused: self.is_paused(),
            model: self.detector.state().clone(),
            source: self.source.describe(),
            mirrored: self.source.mirrored(),
            last_detection: self.aggregator.last_detection().map(|e| e.headline()),
            last_error: self.last_error.as_ref().map(|(_, msg)| msg.clone()),
            log: self.aggregator.log().iter().map(|e| e.log_line()).collect(),
            stats: self.stats.clone(),
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraSettings;
    use crate::detect::{BBox, Prediction, ScriptedBackend};
    use crate::ingest::Facing;
    use crate::render::CanvasSurface;
    use crate::storage::InMemoryKeyValueStore;

    fn control_loop(backend: ScriptedBackend) -> ControlLoop<CanvasSurface> {
        let trash_types = TrashTypeSet::new(["bottle"]).unwrap();
        let aggregator = Aggregator::new(
            PersistenceStore::in_memory(InMemoryKeyValueStore::new()),
            &trash_types,
            Threshold::default(),
            crate::DEFAULT_DEDUP_WINDOW,
        );
        let source = FrameSource::new(CameraSettings {
            width: 16,
            height: 12,
            ..CameraSettings::default()
        });
        ControlLoop::new(
            Detector::from_backend(backend),
            source,
            aggregator,
            CanvasSurface::new(),
            trash_types,
            LoopSettings::default(),
        )
    }

    fn bottle() -> Prediction {
        Prediction::new("bottle", 0.9, BBox::new(1.0, 1.0, 4.0, 4.0))
    }

    #[test]
    fn idle_until_model_ready() {
        let mut cl = control_loop(ScriptedBackend::repeating(vec![bottle()]));
        cl.activate(SourceVariant::Camera(Facing::Environment)).unwrap();
        assert_eq!(cl.tick(Instant::now(), Local::now()), TickOutcome::Idle);
        assert_eq!(cl.surface().dimensions(), (0, 0));

        cl.initialize_model().unwrap();
        assert_eq!(
            cl.tick(Instant::now(), Local::now()),
            TickOutcome::Processed {
                drawn: 1,
                emitted: 1
            }
        );
        assert_eq!(cl.surface().dimensions(), (16, 12));
    }

    #[test]
    fn render_while_idle_draws_passthrough() {
        let mut cl = control_loop(ScriptedBackend::new());
        cl.settings.render_while_idle = true;
        cl.activate(SourceVariant::Camera(Facing::Environment)).unwrap();
        assert_eq!(cl.tick(Instant::now(), Local::now()), TickOutcome::Idle);
        assert_eq!(cl.surface().dimensions(), (16, 12));
    }

    #[test]
    fn no_source_means_no_frame() {
        let mut cl = control_loop(ScriptedBackend::new());
        cl.initialize_model().unwrap();
        assert_eq!(cl.tick(Instant::now(), Local::now()), TickOutcome::NoFrame);
        assert_eq!(cl.stats().skipped_frames, 1);
    }

    #[test]
    fn failed_model_load_is_surfaced_then_cleared() {
        let mut cl = control_loop(ScriptedBackend::new().failing_load("missing weights"));
        assert!(cl.initialize_model().is_err());
        let status = cl.status();
        assert!(status.last_error.unwrap().contains("missing weights"));
        assert!(matches!(status.model, ModelState::Failed(_)));
    }

    #[test]
    fn source_success_does_not_clear_model_error() {
        let mut cl = control_loop(ScriptedBackend::new().failing_load("missing weights"));
        let _ = cl.initialize_model();
        cl.activate(SourceVariant::Camera(Facing::Environment)).unwrap();
        assert!(cl.status().last_error.is_some());
    }

    #[test]
    fn commands_are_applied_between_ticks() {
        let mut cl = control_loop(ScriptedBackend::new());
        let handle = cl.handle();
        let worker = std::thread::spawn(move || handle.set_threshold(80));
        while !worker.is_finished() {
            cl.process_commands();
            std::thread::sleep(Duration::from_millis(1));
        }
        let applied = worker.join().unwrap().unwrap();
        assert_eq!(applied.percent(), 80);
        assert_eq!(cl.status().threshold_percent, 80);
    }

    #[test]
    fn toggle_pause_is_shared_with_handles() {
        let mut cl = control_loop(ScriptedBackend::new());
        let handle = cl.handle();
        assert!(handle.toggle_pause());
        assert!(cl.is_paused());
        assert!(!cl.toggle_pause());
        assert!(!handle.is_paused());
    }

    #[test]
    fn shutdown_stops_processing() {
        let mut cl = control_loop(ScriptedBackend::new());
        cl.handle().shutdown();
        assert!(!cl.process_commands());
    }
}
