use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::core::phase::RangeFn;

/// Fallback chunk size when the configured one is zero.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Descriptor for the one in-flight range task. Written by the dispatching
/// thread before the token publish, read-only to workers for the duration of
/// the dispatch.
struct DispatchSlot {
    task: Option<RangeFn>,
    element_count: usize,
    chunk_size: usize,
    total_chunks: usize,
    frame: i64,
    dt: f64,
}

struct PoolShared {
    slot: UnsafeCell<DispatchSlot>,
    /// Monotonic dispatch token; a changed value releases workers onto the
    /// current slot contents.
    token: AtomicU64,
    /// Next chunk index to claim. Pure allocator of disjoint indices.
    next_chunk: AtomicUsize,
    /// Chunks not yet acknowledged complete for the current dispatch.
    remaining: AtomicUsize,
    /// Workers that have left the current dispatch and returned to the token
    /// spin. The dispatcher waits for all of them before rewriting `slot`.
    checked_in: AtomicUsize,
    /// Set when a chunk panicked; later chunks of the dispatch are claimed
    /// and acknowledged without executing.
    poisoned: AtomicBool,
    shutdown: AtomicBool,
    panic_tx: Sender<Box<dyn Any + Send>>,
}

// SAFETY: `slot` is written only by the dispatching thread, and only while
// every worker is checked in. Workers read it only between an acquire load of
// a fresh `token` (which happens-after the write, released by the token bump)
// and their release increment of `checked_in` (which happens-before the
// dispatcher's next write, acquired in its check-in wait). The descriptor is
// therefore never read and written concurrently.
unsafe impl Sync for PoolShared {}

impl PoolShared {
    /// Claim-and-execute loop shared by workers and a helping dispatcher.
    fn run_chunks(&self) {
        // SAFETY: see the `Sync` impl; the slot is immutable for the duration
        // of one dispatch.
        let slot = unsafe { &*self.slot.get() };
        let Some(task) = slot.task.as_deref() else {
            return;
        };
        loop {
            // Mid-range shutdown is allowed between chunks; the driver has
            // stopped dispatching by then, so unclaimed chunks are moot.
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let idx = self.next_chunk.fetch_add(1, Ordering::Relaxed);
            if idx >= slot.total_chunks {
                break;
            }
            let begin = idx * slot.chunk_size;
            let end = (begin + slot.chunk_size).min(slot.element_count);
            if !self.poisoned.load(Ordering::Acquire) {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    task(begin, end, slot.frame, slot.dt);
                }));
                if let Err(payload) = outcome {
                    self.poisoned.store(true, Ordering::Release);
                    let _ = self.panic_tx.try_send(payload);
                }
            }
            // The claimed chunk is acknowledged even when poisoned or when the
            // task panicked, so the dispatcher's wait always unblocks.
            if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    debug!("worker {index} start");
    // Baseline is the construction-time token, not a load at thread start: a
    // worker scheduled late would otherwise treat an already-published
    // dispatch as old and never check in for it.
    let mut seen = 0u64;
    loop {
        let mut current = shared.token.load(Ordering::Acquire);
        while current == seen && !shared.shutdown.load(Ordering::Acquire) {
            thread::yield_now();
            current = shared.token.load(Ordering::Acquire);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        seen = current;
        shared.run_chunks();
        shared.checked_in.fetch_add(1, Ordering::Release);
    }
    debug!("worker {index} exit");
}

/// Persistent worker threads plus the chunk-dispatch protocol for executing
/// one range task at a time across them.
///
/// `parallel_for` splits `[0, element_count)` into contiguous chunks; every
/// index is processed exactly once by exactly one task invocation regardless
/// of worker count, so a commutative task body yields identical results for
/// any pool size.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    panic_rx: Receiver<Box<dyn Any + Send>>,
    main_helps: bool,
}

impl WorkerPool {
    pub fn new(worker_count: usize, main_helps: bool) -> Self {
        let worker_count = worker_count.max(1);
        let (shared, workers, panic_rx) = Self::start(worker_count);
        Self {
            shared,
            workers,
            panic_rx,
            main_helps,
        }
    }

    fn start(
        worker_count: usize,
    ) -> (
        Arc<PoolShared>,
        Vec<JoinHandle<()>>,
        Receiver<Box<dyn Any + Send>>,
    ) {
        let (panic_tx, panic_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(PoolShared {
            slot: UnsafeCell::new(DispatchSlot {
                task: None,
                element_count: 0,
                chunk_size: DEFAULT_CHUNK_SIZE,
                total_chunks: 0,
                frame: 0,
                dt: 0.0,
            }),
            token: AtomicU64::new(0),
            next_chunk: AtomicUsize::new(0),
            remaining: AtomicUsize::new(0),
            // All workers start quiescent.
            checked_in: AtomicUsize::new(worker_count),
            poisoned: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            panic_tx,
        });
        let workers = (0..worker_count)
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(shared, i))
                    .expect("spawn worker thread")
            })
            .collect();
        info!("worker pool started count={worker_count}");
        (shared, workers, panic_rx)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn main_helps(&self) -> bool {
        self.main_helps
    }

    pub fn set_main_helps(&mut self, main_helps: bool) {
        self.main_helps = main_helps;
    }

    /// Full stop/start with a new worker count. No-op when unchanged.
    pub fn resize(&mut self, worker_count: usize) {
        let worker_count = worker_count.max(1);
        if worker_count == self.workers.len() {
            return;
        }
        self.stop();
        let (shared, workers, panic_rx) = Self::start(worker_count);
        self.shared = shared;
        self.workers = workers;
        self.panic_rx = panic_rx;
    }

    /// Execute `task` over `[0, element_count)` in chunks of `chunk_size`,
    /// returning once every chunk has completed. `frame` and `dt` are passed
    /// through to each invocation.
    ///
    /// A panic inside the task is re-raised here, on the dispatching thread,
    /// after the dispatch has drained.
    pub fn parallel_for(
        &self,
        element_count: usize,
        chunk_size: usize,
        frame: i64,
        dt: f64,
        task: &RangeFn,
    ) {
        if element_count == 0 {
            return;
        }
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let total_chunks = element_count.div_ceil(chunk_size);
        let shared = &self.shared;

        // Quiescence: no worker may still be inside the previous dispatch
        // when the slot is rewritten.
        while shared.checked_in.load(Ordering::Acquire) < self.workers.len() {
            thread::yield_now();
        }

        // SAFETY: every worker is checked in and will not read the slot again
        // until the token bump below publishes it.
        unsafe {
            let slot = &mut *shared.slot.get();
            slot.task = Some(task.clone());
            slot.element_count = element_count;
            slot.chunk_size = chunk_size;
            slot.total_chunks = total_chunks;
            slot.frame = frame;
            slot.dt = dt;
        }
        shared.checked_in.store(0, Ordering::Relaxed);
        shared.poisoned.store(false, Ordering::Relaxed);
        shared.next_chunk.store(0, Ordering::Relaxed);
        shared.remaining.store(total_chunks, Ordering::Relaxed);
        shared.token.fetch_add(1, Ordering::Release);

        if self.main_helps {
            shared.run_chunks();
        }
        while shared.remaining.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }

        if let Ok(payload) = self.panic_rx.try_recv() {
            panic::resume_unwind(payload);
        }
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.token.fetch_add(1, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn coverage_counters(n: usize) -> Arc<Vec<AtomicU32>> {
        Arc::new((0..n).map(|_| AtomicU32::new(0)).collect())
    }

    #[test]
    fn every_index_visited_exactly_once() {
        for workers in [1, 2, 4, 8] {
            for chunk_size in [1, 7, 64, 256, 5000, 10_000] {
                let n = 5000;
                let pool = WorkerPool::new(workers, true);
                let hits = coverage_counters(n);
                let hits_task = hits.clone();
                let task: RangeFn = Arc::new(move |begin, end, _frame, _dt| {
                    for i in begin..end {
                        hits_task[i].fetch_add(1, Ordering::Relaxed);
                    }
                });
                pool.parallel_for(n, chunk_size, 0, 0.001, &task);
                for (i, hit) in hits.iter().enumerate() {
                    assert_eq!(
                        hit.load(Ordering::Relaxed),
                        1,
                        "index {i} (workers={workers} chunk={chunk_size})"
                    );
                }
            }
        }
    }

    #[test]
    fn chunk_ranges_are_contiguous_multiples_of_chunk_size() {
        let n = 1000;
        let chunk_size = 128;
        let pool = WorkerPool::new(4, true);
        let ranges = Arc::new(std::sync::Mutex::new(Vec::new()));
        let ranges_task = ranges.clone();
        let task: RangeFn = Arc::new(move |begin, end, _f, _dt| {
            ranges_task.lock().expect("lock ranges").push((begin, end));
        });
        pool.parallel_for(n, chunk_size, 0, 0.001, &task);

        let mut seen = ranges.lock().expect("lock ranges").clone();
        seen.sort_unstable();
        assert_eq!(seen.len(), n.div_ceil(chunk_size));
        for (i, &(begin, end)) in seen.iter().enumerate() {
            assert_eq!(begin, i * chunk_size);
            assert_eq!(end, (begin + chunk_size).min(n));
        }
    }

    #[test]
    fn zero_elements_return_immediately() {
        let pool = WorkerPool::new(2, true);
        let task: RangeFn = Arc::new(|_b, _e, _f, _dt| panic!("must not run"));
        pool.parallel_for(0, 256, 0, 0.001, &task);
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        let n = DEFAULT_CHUNK_SIZE * 2 + 10;
        let pool = WorkerPool::new(2, true);
        let invocations = Arc::new(AtomicU32::new(0));
        let invocations_task = invocations.clone();
        let task: RangeFn = Arc::new(move |begin, end, _f, _dt| {
            invocations_task.fetch_add(1, Ordering::Relaxed);
            assert!(end - begin <= DEFAULT_CHUNK_SIZE);
        });
        pool.parallel_for(n, 0, 0, 0.001, &task);
        assert_eq!(invocations.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn repeated_dispatches_reuse_the_pool() {
        let n = 2048;
        let pool = WorkerPool::new(4, true);
        let hits = coverage_counters(n);
        for round in 0..50 {
            let hits_task = hits.clone();
            let task: RangeFn = Arc::new(move |begin, end, frame, _dt| {
                assert_eq!(frame, round);
                for i in begin..end {
                    hits_task[i].fetch_add(1, Ordering::Relaxed);
                }
            });
            pool.parallel_for(n, 100, round, 0.001, &task);
        }
        for hit in hits.iter() {
            assert_eq!(hit.load(Ordering::Relaxed), 50);
        }
    }

    #[test]
    fn resize_restarts_workers() {
        let mut pool = WorkerPool::new(2, true);
        assert_eq!(pool.worker_count(), 2);
        pool.resize(5);
        assert_eq!(pool.worker_count(), 5);

        let n = 512;
        let hits = coverage_counters(n);
        let hits_task = hits.clone();
        let task: RangeFn = Arc::new(move |begin, end, _f, _dt| {
            for i in begin..end {
                hits_task[i].fetch_add(1, Ordering::Relaxed);
            }
        });
        pool.parallel_for(n, 32, 0, 0.001, &task);
        for hit in hits.iter() {
            assert_eq!(hit.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn task_panic_is_reraised_on_the_dispatching_thread() {
        let pool = WorkerPool::new(4, true);
        let task: RangeFn = Arc::new(|begin, _end, _f, _dt| {
            if begin == 0 {
                panic!("chunk zero failed");
            }
        });
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.parallel_for(4096, 64, 0, 0.001, &task);
        }));
        assert!(outcome.is_err());

        // The pool stays usable after a poisoned dispatch.
        let ok: RangeFn = Arc::new(|_b, _e, _f, _dt| {});
        pool.parallel_for(1024, 64, 1, 0.001, &ok);
    }
}
