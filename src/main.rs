// Headless demo: a small physics workload (throttle control, force
// computation, integration, hash reduction) driven at a fixed rate. The
// parallel tasks write disjoint index ranges into bit-stored f64 buffers, so
// the final state and hash are identical for any worker count.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lockstep::{Profiler, Settings, SimDriver};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Target micro-step rate in Hz
    #[arg(long)]
    hz: Option<f64>,

    /// Frame budget; -1 runs until ctrl-c
    #[arg(long)]
    frames: Option<i64>,

    /// Worker thread count
    #[arg(long)]
    threads: Option<usize>,

    /// Elements per chunk when splitting a range task
    #[arg(long)]
    chunk: Option<usize>,

    /// Extra catch-up frames per scheduler tick
    #[arg(long)]
    max_catch_up: Option<i32>,

    /// Enable drift-driven catch-up
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    adaptive: Option<bool>,

    /// Fine-wait budget near a deadline, in microseconds
    #[arg(long)]
    spin_micros: Option<i64>,

    /// Element count of the physics domain
    #[arg(long, default_value_t = 5000)]
    elements: usize,

    /// Inject a 5 ms stall every 750 frames
    #[arg(long, default_value_t = false)]
    stress: bool,

    /// Path to settings TOML
    #[arg(long, default_value = "lockstep.toml")]
    config: String,
}

/// Body state shared between phases. f64 values are stored as bits so the
/// parallel tasks can write disjoint indices without locks.
struct Bodies {
    pos: Vec<AtomicU64>,
    vel: Vec<AtomicU64>,
    thr: Vec<AtomicU64>,
    force: Vec<AtomicU64>,
}

impl Bodies {
    fn new(count: usize) -> Self {
        let filled = |value: f64| {
            (0..count)
                .map(|_| AtomicU64::new(value.to_bits()))
                .collect()
        };
        Self {
            pos: filled(0.0),
            vel: filled(10.0),
            thr: filled(0.5),
            force: filled(0.0),
        }
    }
}

#[inline]
fn get(slot: &AtomicU64) -> f64 {
    f64::from_bits(slot.load(Ordering::Relaxed))
}

#[inline]
fn set(slot: &AtomicU64, value: f64) {
    slot.store(value.to_bits(), Ordering::Relaxed);
}

fn fnv1a(bits: impl Iterator<Item = u64>) -> u64 {
    let mut hash = 1469598103934665603u64;
    for b in bits {
        hash ^= b;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing/logging (honors RUST_LOG). Info default when unset;
    // no wall-clock timestamps (drift observations carry sim time instead).
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .without_time()
        .try_init();

    let args = Args::parse();
    let mut settings = Settings::load_or_default(&args.config);
    settings.hz = args.hz.unwrap_or(settings.hz);
    settings.max_frames = args.frames.unwrap_or(settings.max_frames);
    settings.threads = args.threads.unwrap_or(settings.threads);
    settings.chunk_size = args.chunk.unwrap_or(settings.chunk_size);
    settings.max_catch_up = args.max_catch_up.unwrap_or(settings.max_catch_up);
    settings.adaptive = args.adaptive.unwrap_or(settings.adaptive);
    settings.spin_micros = args.spin_micros.unwrap_or(settings.spin_micros);

    let elements = args.elements;
    let stress = args.stress;

    let mut driver = SimDriver::new(settings);
    let profiler = Arc::new(Profiler::new());
    driver.set_profiler(profiler.clone());

    let exit_handle = driver.handle();
    ctrlc::set_handler(move || {
        exit_handle.request_exit();
    })
    .context("set ctrl-c handler")?;

    let input = driver.add_phase("Input", 0);
    let physics = driver.add_phase("Physics", elements);

    let bodies = Arc::new(Bodies::new(elements));

    // Serial control phase: throttle modulation, plus optional stalls to
    // exercise the catch-up path.
    let control_bodies = bodies.clone();
    driver.add_serial_subsystem(input, move |frame, dt| {
        let t = frame as f64 * dt;
        for (i, thr) in control_bodies.thr.iter().enumerate() {
            set(thr, 0.5 + 0.05 * (t + i as f64 * 0.0005).sin());
        }
        if stress && frame > 0 && frame % 750 == 0 {
            thread::sleep(Duration::from_millis(5));
            info!("stall 5ms frame={frame}");
        }
    })?;

    // Force computation (parallel).
    let force_bodies = bodies.clone();
    driver.add_parallel_range_task(physics, move |begin, end, _frame, _dt| {
        for i in begin..end {
            set(&force_bodies.force[i], get(&force_bodies.thr[i]) * 1000.0);
        }
    })?;

    // Integration (parallel).
    let integrate_bodies = bodies.clone();
    driver.add_parallel_range_task(physics, move |begin, end, _frame, dt| {
        for i in begin..end {
            let vel = get(&integrate_bodies.vel[i]) + get(&integrate_bodies.force[i]) / 1200.0 * dt;
            set(&integrate_bodies.vel[i], vel);
            set(&integrate_bodies.pos[i], get(&integrate_bodies.pos[i]) + vel * dt);
        }
    })?;

    // Deterministic reduction: periodic velocity fingerprint and progress.
    let reduce_bodies = bodies.clone();
    let reduce_handle = driver.handle();
    driver.add_reduction_task(physics, move |frame, _dt| {
        if frame % 1000 == 0 {
            let hash = fnv1a(reduce_bodies.vel.iter().map(|v| v.load(Ordering::Relaxed)));
            reduce_handle.set_deterministic_hash(hash);
            let sum: f64 = reduce_bodies.vel.iter().map(get).sum();
            let avg = sum / reduce_bodies.vel.len().max(1) as f64;
            info!("reduce frame={frame} avg_vel={avg:.6} hash={hash:#018x}");
        }
    })?;

    driver.run();
    profiler.log_summary();

    println!(
        "final frame={} pos0={:.6} vel0={:.6} drift_ms={:.2} hash={:#018x}",
        driver.frame(),
        get(&bodies.pos[0]),
        get(&bodies.vel[0]),
        driver.last_drift_ms(),
        driver.deterministic_hash()
    );
    Ok(())
}
