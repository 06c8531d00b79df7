//! Detection aggregation.
//!
//! `Aggregator` turns the per-tick stream of admitted predictions into
//! discrete `DetectionEvent`s. Each class has its own cooldown clock: a
//! prediction emits an event only when no event of that class was emitted
//! within the dedup window. Emission bumps the counters, prepends the event
//! to the newest-first log, and persists `{counts, total, threshold}`.
//!
//! Known limitation: distinct physical objects of the same class appearing
//! within one window are counted once.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::detect::Prediction;
use crate::storage::PersistenceStore;
use crate::{Threshold, TrashTypeSet};

/// Minimum time between two logged events of the same class.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(2000);

const TIME_OF_DAY_FORMAT: &str = "%H:%M:%S";

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// One logged, deduplicated detection. Immutable once created.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionEvent {
    pub class: String,
    pub score_percent: u8,
    pub timestamp: DateTime<Local>,
}

impl DetectionEvent {
    pub fn time_of_day(&self) -> String {
        self.timestamp.format(TIME_OF_DAY_FORMAT).to_string()
    }

    /// `"<class> (<pct>%)"`, the `Event` column of the CSV export.
    pub fn describe(&self) -> String {
        format!("{} ({}%)", self.class, self.score_percent)
    }

    /// `"[<time>] Detected <class> (<pct>%)"`
    pub fn log_line(&self) -> String {
        format!("[{}] Detected {}", self.time_of_day(), self.describe())
    }

    /// `"<class> <pct>% at <time>"`
    pub fn headline(&self) -> String {
        format!(
            "{} {}% at {}",
            self.class,
            self.score_percent,
            self.time_of_day()
        )
    }
}

/// Outcome of feeding one admitted prediction to the aggregator.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Emitted(DetectionEvent),
    /// Class is cooling down; `remaining` until the next event may be emitted.
    Suppressed { remaining: Duration },
}

impl Observation {
    pub fn is_emitted(&self) -> bool {
        matches!(self, Observation::Emitted(_))
    }
}

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// The persisted subset of the aggregate state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
    pub threshold: f32,
}

impl AggregateSnapshot {
    pub fn empty(threshold: Threshold) -> Self {
        Self {
            counts: BTreeMap::new(),
            total: 0,
            threshold: threshold.value(),
        }
    }
}

/// Counters, cooldown clocks, and the live threshold.
#[derive(Clone, Debug)]
pub struct AggregateState {
    counts: BTreeMap<String, u64>,
    total: u64,
    last_logged: HashMap<String, Instant>,
    threshold: Threshold,
}

impl AggregateState {
    fn fresh(trash_types: &TrashTypeSet, threshold: Threshold) -> Self {
        Self {
            counts: trash_types.iter().map(|c| (c.to_string(), 0)).collect(),
            total: 0,
            last_logged: HashMap::new(),
            threshold,
        }
    }

    fn restore(snapshot: AggregateSnapshot, trash_types: &TrashTypeSet) -> Self {
        let mut state = Self::fresh(trash_types, Threshold::clamped(snapshot.threshold));
        for (class, count) in snapshot.counts {
            if trash_types.contains(&class) {
                state.counts.insert(class, count);
            } else {
                log::warn!(
                    "dropping persisted count for '{}' ({}): not a configured trash type",
                    class,
                    count
                );
            }
        }
        let sum: u64 = state.counts.values().sum();
        if snapshot.total != sum {
            log::warn!(
                "persisted total {} disagrees with counts (sum {}); using sum",
                snapshot.total,
                sum
            );
        }
        state.total = sum;
        state
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn count(&self, class: &str) -> u64 {
        self.counts.get(class).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            counts: self.counts.clone(),
            total: self.total,
            threshold: self.threshold.value(),
        }
    }
}

// ----------------------------------------------------------------------------
// Aggregator
// ----------------------------------------------------------------------------

pub struct Aggregator {
    state: AggregateState,
    log: VecDeque<DetectionEvent>,
    window: Duration,
    store: PersistenceStore,
    trash_types: TrashTypeSet,
    default_threshold: Threshold,
}

impl Aggregator {
    /// Restore counters and threshold from `store`.
    ///
    /// A persisted threshold overrides `default_threshold`; the log and the
    /// cooldown clocks always start empty.
    pub fn new(
        mut store: PersistenceStore,
        trash_types: &TrashTypeSet,
        default_threshold: Threshold,
        window: Duration,
    ) -> Self {
        let snapshot = store.load(default_threshold);
        let state = AggregateState::restore(snapshot, trash_types);
        log::info!(
            "aggregator: restored total={} threshold={}%",
            state.total,
            state.threshold.percent()
        );
        Self {
            state,
            log: VecDeque::new(),
            window,
            store,
            trash_types: trash_types.clone(),
            default_threshold,
        }
    }

    /// Feed one prediction that already passed the detection filter.
    pub fn observe(
        &mut self,
        prediction: &Prediction,
        now: Instant,
        wall: DateTime<Local>,
    ) -> Observation {
        if let Some(last) = self.state.last_logged.get(&prediction.class) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.window {
                let remaining = self.window - elapsed;
                log::debug!(
                    "suppressed {} ({}%): cooling for {:?}",
                    prediction.class,
                    prediction.score_percent(),
                    remaining
                );
                return Observation::Suppressed { remaining };
            }
        }

        let event = DetectionEvent {
            class: prediction.class.clone(),
            score_percent: prediction.score_percent(),
            timestamp: wall,
        };
        self.state
            .last_logged
            .insert(event.class.clone(), now);
        *self.state.counts.entry(event.class.clone()).or_insert(0) += 1;
        self.state.total += 1;
        self.log.push_front(event.clone());

        log::info!("{}", event.log_line());
        self.persist();
        Observation::Emitted(event)
    }

    fn persist(&mut self) {
        let snapshot = self.state.snapshot();
        if let Err(err) = self.store.save(&snapshot) {
            log::warn!("failed to persist aggregate state: {:#}", err);
        }
    }

    pub fn threshold(&self) -> Threshold {
        self.state.threshold
    }

    /// Takes effect immediately; persisted with the next emitted event.
    pub fn set_threshold(&mut self, threshold: Threshold) {
        self.state.threshold = threshold;
    }

    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        self.state.counts()
    }

    pub fn count(&self, class: &str) -> u64 {
        self.state.count(class)
    }

    pub fn total(&self) -> u64 {
        self.state.total()
    }

    /// Newest first.
    pub fn log(&self) -> &VecDeque<DetectionEvent> {
        &self.log
    }

    pub fn last_detection(&self) -> Option<&DetectionEvent> {
        self.log.front()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.state.snapshot()
    }

    /// Wipe persisted and in-memory state back to a fresh dashboard.
    pub fn reset(&mut self) {
        if let Err(err) = self.store.clear() {
            log::warn!("failed to clear persisted state: {:#}", err);
        }
        self.state = AggregateState::fresh(&self.trash_types, self.default_threshold);
        self.log.clear();
        log::info!("aggregator: state reset");
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
