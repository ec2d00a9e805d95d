use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use lockstep::{Settings, SimDriver};

fn run_coverage(threads: usize, chunk_size: usize, elements: usize, frames: i64) -> Vec<u32> {
    let settings = Settings {
        hz: 100_000.0,
        max_frames: frames,
        threads,
        chunk_size,
        adaptive: false,
        drift_log_interval: 0,
        ..Settings::default()
    };

    let mut driver = SimDriver::new(settings);
    let phase = driver.add_phase("Scan", elements);

    let hits: Arc<Vec<AtomicU32>> = Arc::new((0..elements).map(|_| AtomicU32::new(0)).collect());
    let hits_task = hits.clone();
    driver
        .add_parallel_range_task(phase, move |begin, end, _frame, _dt| {
            for i in begin..end {
                hits_task[i].fetch_add(1, Ordering::Relaxed);
            }
        })
        .expect("valid phase handle");

    driver.run();
    hits.iter().map(|h| h.load(Ordering::Relaxed)).collect()
}

#[test]
fn every_index_visited_once_per_frame() {
    for threads in [1, 2, 8] {
        for chunk_size in [1, 100, 256, 4096, 10_000] {
            let frames = 3;
            let hits = run_coverage(threads, chunk_size, 5000, frames);
            for (i, &hit) in hits.iter().enumerate() {
                assert_eq!(
                    hit, frames as u32,
                    "index {i} (threads={threads} chunk={chunk_size})"
                );
            }
        }
    }
}

#[test]
fn oversized_chunk_runs_as_a_single_invocation() {
    let elements = 100;
    let settings = Settings {
        hz: 100_000.0,
        max_frames: 1,
        threads: 4,
        chunk_size: 1000,
        adaptive: false,
        drift_log_interval: 0,
        ..Settings::default()
    };

    let mut driver = SimDriver::new(settings);
    let phase = driver.add_phase("Whole", elements);

    let invocations = Arc::new(AtomicU32::new(0));
    let invocations_task = invocations.clone();
    driver
        .add_parallel_range_task(phase, move |begin, end, _frame, _dt| {
            invocations_task.fetch_add(1, Ordering::Relaxed);
            assert_eq!((begin, end), (0, 100));
        })
        .expect("valid phase handle");

    driver.run();
    assert_eq!(invocations.load(Ordering::Relaxed), 1);
}
