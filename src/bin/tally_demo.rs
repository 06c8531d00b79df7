//! tally_demo - synthetic end-to-end run of the dashboard kernel
//!
//! Drives the control loop with a synthetic camera and a scripted detector,
//! then prints the counter panel and the CSV export.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[path = "../ui.rs"]
mod ui;

use trash_tally::config::CameraSettings;
use trash_tally::storage::DEFAULT_STATE_KEY;
use trash_tally::{
    Aggregator, BBox, CanvasSurface, ControlLoop, Detector, Facing, FrameSource,
    InMemoryKeyValueStore, KeyValueStore, LoopSettings, PersistenceStore, Prediction,
    ScriptedBackend, SourceVariant, SqliteKeyValueStore, Threshold, TickOutcome, TrashTypeSet,
    DEFAULT_DEDUP_WINDOW,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Duration of the run in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Ticks per second.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Confidence threshold in percent.
    #[arg(long, default_value_t = 50)]
    threshold: u8,
    /// Persist counters to this SQLite file instead of memory.
    #[arg(long)]
    db: Option<String>,
    /// Write the CSV export here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Progress output: auto, plain, or pretty.
    #[arg(long, default_value = "auto")]
    ui: String,
}

/// A short scene: a bottle held in view, a cup passing by, a person, and
/// some low-confidence noise.
fn demo_script() -> Vec<Vec<Prediction>> {
    let bottle = Prediction::new("bottle", 0.91, BBox::new(40.0, 60.0, 80.0, 160.0));
    let cup = Prediction::new("cup", 0.74, BBox::new(300.0, 200.0, 90.0, 90.0));
    let faint_bowl = Prediction::new("bowl", 0.31, BBox::new(420.0, 300.0, 120.0, 60.0));
    let person = Prediction::new("person", 0.97, BBox::new(200.0, 20.0, 180.0, 420.0));
    vec![
        vec![bottle.clone(), person.clone()],
        vec![bottle.clone(), faint_bowl],
        vec![bottle, cup.clone()],
        vec![person],
        vec![cup],
        vec![],
    ]
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    let ui = ui::Ui::from_flag(&args.ui);

    let store: Box<dyn KeyValueStore> = match &args.db {
        Some(path) => Box::new(SqliteKeyValueStore::open(path)?),
        None => Box::new(InMemoryKeyValueStore::new()),
    };
    let trash_types = TrashTypeSet::default();
    let threshold = Threshold::from_percent(args.threshold)?;
    let aggregator = Aggregator::new(
        PersistenceStore::new(store, DEFAULT_STATE_KEY),
        &trash_types,
        threshold,
        DEFAULT_DEDUP_WINDOW,
    );
    let tick_interval = Duration::from_millis((1000 / u64::from(args.fps)).max(1));
    let mut control = ControlLoop::new(
        Detector::from_backend(ScriptedBackend::sequence(demo_script())),
        FrameSource::new(CameraSettings::default()),
        aggregator,
        CanvasSurface::new(),
        trash_types,
        LoopSettings {
            tick_interval,
            ..LoopSettings::default()
        },
    );

    {
        let stage = ui.stage(ui::STAGE_MODEL);
        control.initialize_model()?;
        drop(stage);
    }
    {
        let stage = ui.stage(ui::STAGE_CAMERA);
        control.activate(SourceVariant::Camera(Facing::Environment))?;
        drop(stage);
    }

    let stage = ui.stage("Running synthetic scene");
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut emitted = 0;
    while Instant::now() < deadline {
        if let TickOutcome::Processed { emitted: n, .. } = control.tick(Instant::now(), Local::now())
        {
            emitted += n;
        }
        std::thread::sleep(tick_interval);
    }
    drop(stage);

    let status = control.status();
    println!("total: {}", status.total);
    for (class, count) in &status.counts {
        println!("  {}: {}", class, count);
    }
    if let Some(last) = &status.last_detection {
        println!("last: {}", last);
    }
    println!(
        "ticks={} inferences={} events this run={}",
        status.stats.ticks, status.stats.inferences, emitted
    );

    let csv = control.export_csv();
    match &args.out {
        Some(path) => {
            std::fs::write(path, &csv)
                .with_context(|| format!("write csv export to {}", path.display()))?;
            println!("log written to {}", path.display());
        }
        None => println!("{csv}"),
    }
    Ok(())
}
