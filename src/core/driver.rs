use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::config::Settings;
use crate::core::phase::{DriverError, Phase, PhaseId};
use crate::core::pool::WorkerPool;
use crate::core::timing::FrameTiming;
use crate::profile::Profiler;

/// Control state reachable from user callbacks through [`DriverHandle`]
/// while `run` holds the driver.
struct ControlState {
    terminate: AtomicBool,
    hash: AtomicU64,
    hz_bits: AtomicU64,
}

/// Cloneable handle into a running driver. Callbacks capture one to request
/// exit or publish a determinism fingerprint from inside a frame.
#[derive(Clone)]
pub struct DriverHandle {
    control: Arc<ControlState>,
}

impl DriverHandle {
    /// Cooperative exit: the in-flight frame completes, then the run loop
    /// terminates.
    pub fn request_exit(&self) {
        self.control.terminate.store(true, Ordering::SeqCst);
    }

    /// Publish a fingerprint for test oracles, typically from a reduction.
    pub fn set_deterministic_hash(&self, hash: u64) {
        self.control.hash.store(hash, Ordering::Relaxed);
    }

    pub fn deterministic_hash(&self) -> u64 {
        self.control.hash.load(Ordering::Relaxed)
    }

    /// Currently configured micro-step rate.
    pub fn hz(&self) -> f64 {
        f64::from_bits(self.control.hz_bits.load(Ordering::Relaxed))
    }
}

/// Deterministic fixed-timestep simulation driver.
///
/// The outer loop fires one frame per `1/hz` seconds of wall time, sleeping
/// coarsely and then yield-spinning to each deadline. A frame walks the
/// phase list in insertion order; within a phase, serial subsystems run on
/// the calling thread, parallel range tasks are chunked across the worker
/// pool, and reductions run serially afterwards. With `adaptive` enabled,
/// up to `max_catch_up` extra frames per tick recover accumulated drift.
pub struct SimDriver {
    settings: Settings,
    timing: FrameTiming,
    phases: Vec<Phase>,
    pool: WorkerPool,
    control: Arc<ControlState>,
    frame: i64,
    start_real: Instant,
    next_frame_target: Instant,
    last_drift_ms: f64,
    profiler: Option<Arc<Profiler>>,
}

impl SimDriver {
    pub fn new(settings: Settings) -> Self {
        let settings = settings.clamped();
        let timing = FrameTiming::from_hz(settings.hz);
        let control = Arc::new(ControlState {
            terminate: AtomicBool::new(false),
            hash: AtomicU64::new(0),
            hz_bits: AtomicU64::new(timing.hz.to_bits()),
        });
        let pool = WorkerPool::new(settings.threads, settings.main_helps);
        let now = Instant::now();
        log_config(&settings);
        Self {
            settings,
            timing,
            phases: Vec::new(),
            pool,
            control,
            frame: 0,
            start_real: now,
            next_frame_target: now,
            last_drift_ms: 0.0,
            profiler: None,
        }
    }

    /// Validate and store settings, recompute timing, and resize the worker
    /// pool when the thread count changed. Re-applying identical settings is
    /// a no-op apart from the log line (no worker churn).
    pub fn apply_settings(&mut self, settings: Settings) {
        let settings = settings.clamped();
        self.set_timing(FrameTiming::from_hz(settings.hz));
        self.pool.set_main_helps(settings.main_helps);
        self.pool.resize(settings.threads);
        log_config(&settings);
        self.settings = settings;
    }

    pub fn set_hz(&mut self, hz: f64) {
        let timing = FrameTiming::from_hz(hz);
        self.settings.hz = timing.hz;
        self.set_timing(timing);
    }

    pub fn set_max_frames(&mut self, max_frames: i64) {
        self.settings.max_frames = max_frames.max(-1);
    }

    pub fn set_adaptive(&mut self, adaptive: bool) {
        self.settings.adaptive = adaptive;
    }

    pub fn set_max_catch_up(&mut self, max_catch_up: i32) {
        self.settings.max_catch_up = max_catch_up.max(0);
    }

    /// Attach a profiler receiving `Frame`/`Phase:*`/`RangeTask:*`/
    /// `Reduction:*` scopes. Absence changes nothing.
    pub fn set_profiler(&mut self, profiler: Arc<Profiler>) {
        self.profiler = Some(profiler);
    }

    fn set_timing(&mut self, timing: FrameTiming) {
        self.control
            .hz_bits
            .store(timing.hz.to_bits(), Ordering::Relaxed);
        self.timing = timing;
    }

    pub fn add_phase(&mut self, name: &str, element_count: usize) -> PhaseId {
        self.phases.push(Phase::new(name, element_count));
        debug!("add phase '{name}' element_count={element_count}");
        PhaseId(self.phases.len() - 1)
    }

    fn phase_mut(&mut self, id: PhaseId) -> Result<&mut Phase, DriverError> {
        self.phases
            .get_mut(id.0)
            .ok_or(DriverError::InvalidHandle(id.0))
    }

    pub fn set_phase_element_count(
        &mut self,
        id: PhaseId,
        count: usize,
    ) -> Result<(), DriverError> {
        let phase = self.phase_mut(id)?;
        phase.element_count = count;
        debug!("phase '{}' set element_count={count}", phase.name);
        Ok(())
    }

    /// Disable or re-enable a phase without removing it; a disabled phase is
    /// skipped entirely for the frame.
    pub fn set_phase_enabled(&mut self, id: PhaseId, enabled: bool) -> Result<(), DriverError> {
        let phase = self.phase_mut(id)?;
        phase.enabled = enabled;
        debug!("phase '{}' enabled={enabled}", phase.name);
        Ok(())
    }

    pub fn add_serial_subsystem(
        &mut self,
        id: PhaseId,
        subsystem: impl FnMut(i64, f64) + Send + 'static,
    ) -> Result<(), DriverError> {
        let phase = self.phase_mut(id)?;
        phase.serial.push(Box::new(subsystem));
        trace!("add serial subsystem to phase '{}'", phase.name);
        Ok(())
    }

    pub fn add_parallel_range_task(
        &mut self,
        id: PhaseId,
        task: impl Fn(usize, usize, i64, f64) + Send + Sync + 'static,
    ) -> Result<(), DriverError> {
        let phase = self.phase_mut(id)?;
        phase.range_tasks.push(Arc::new(task));
        trace!("add parallel range task to phase '{}'", phase.name);
        Ok(())
    }

    pub fn add_reduction_task(
        &mut self,
        id: PhaseId,
        reduction: impl FnMut(i64, f64) + Send + 'static,
    ) -> Result<(), DriverError> {
        let phase = self.phase_mut(id)?;
        phase.reductions.push(Box::new(reduction));
        trace!("add reduction task to phase '{}'", phase.name);
        Ok(())
    }

    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            control: self.control.clone(),
        }
    }

    pub fn request_exit(&self) {
        self.control.terminate.store(true, Ordering::SeqCst);
    }

    pub fn frame(&self) -> i64 {
        self.frame
    }

    pub fn hz(&self) -> f64 {
        self.timing.hz
    }

    pub fn dt_seconds(&self) -> f64 {
        self.timing.dt_micro
    }

    pub fn last_drift_ms(&self) -> f64 {
        self.last_drift_ms
    }

    pub fn deterministic_hash(&self) -> u64 {
        self.control.hash.load(Ordering::Relaxed)
    }

    pub fn set_deterministic_hash(&self, hash: u64) {
        self.control.hash.store(hash, Ordering::Relaxed);
    }

    /// Live worker count of the pool.
    pub fn workers(&self) -> usize {
        self.pool.worker_count()
    }

    /// Drive frames until a stop condition holds: `request_exit` observed or
    /// `max_frames` reached.
    pub fn run(&mut self) {
        info!(
            "run loop start hz={} max_frames={} threads={}",
            self.timing.hz,
            self.settings.max_frames,
            self.pool.worker_count()
        );
        self.start_real = Instant::now();
        self.next_frame_target = self.start_real;
        while self.advance() {}
        info!("run loop end frame={}", self.frame);
    }

    /// One scheduler tick: execute a frame, wait out the deadline, then
    /// recover drift if adaptive. Returns `false` once the stop condition
    /// holds.
    pub fn advance(&mut self) -> bool {
        if self.control.terminate.load(Ordering::SeqCst) {
            return false;
        }
        if self.reached_max_frames() {
            return false;
        }

        self.step_frame();
        self.next_frame_target += self.timing.dt();

        // Two-tier wait: coarse sleeps while the deadline is further away
        // than the spin budget, then a yield spin over the last stretch.
        let spin_budget = Duration::from_micros(self.settings.spin_micros as u64);
        loop {
            let now = Instant::now();
            if now + spin_budget >= self.next_frame_target {
                while Instant::now() < self.next_frame_target {
                    thread::yield_now();
                }
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }

        self.observe_drift();
        if self.settings.adaptive
            && let Some(behind) = Instant::now().checked_duration_since(self.next_frame_target)
        {
            let extra = ((behind.as_secs_f64() / self.timing.dt_micro) as i64)
                .min(self.settings.max_catch_up as i64);
            if extra > 0 {
                debug!(
                    "catch-up burst extra={extra} behind_ms={:.2}",
                    behind.as_secs_f64() * 1e3
                );
            }
            // Catch-up frames run back to back and deliberately do not move
            // the deadline; the next normal tick re-anchors to now.
            for _ in 0..extra {
                if self.reached_max_frames() {
                    break;
                }
                self.step_frame();
            }
        }

        !self.reached_max_frames()
    }

    fn reached_max_frames(&self) -> bool {
        self.settings.max_frames >= 0 && self.frame >= self.settings.max_frames
    }

    /// Execute one frame through the phase pipeline, then bump the counter.
    fn step_frame(&mut self) {
        let frame = self.frame;
        let dt = self.timing.dt_micro;
        let profiler = self.profiler.clone();
        let _frame_scope = profiler.as_ref().map(|p| p.scope("Frame"));

        for phase in &mut self.phases {
            if !phase.enabled {
                continue;
            }
            debug!("phase begin '{}' frame={frame}", phase.name);
            let _phase_scope = profiler
                .as_ref()
                .map(|p| p.scope(format!("Phase:{}", phase.name)));

            for subsystem in &mut phase.serial {
                subsystem(frame, dt);
            }

            if phase.element_count > 0 {
                if self.pool.worker_count() > 1 {
                    for (index, task) in phase.range_tasks.iter().enumerate() {
                        trace!("dispatch range task {index} of phase '{}'", phase.name);
                        let _task_scope = profiler
                            .as_ref()
                            .map(|p| p.scope(format!("RangeTask:{}:{index}", phase.name)));
                        self.pool.parallel_for(
                            phase.element_count,
                            self.settings.chunk_size,
                            frame,
                            dt,
                            task,
                        );
                    }
                } else {
                    for (index, task) in phase.range_tasks.iter().enumerate() {
                        let _task_scope = profiler
                            .as_ref()
                            .map(|p| p.scope(format!("RangeTask:{}:{index}", phase.name)));
                        (**task)(0, phase.element_count, frame, dt);
                    }
                }
            } else if !phase.range_tasks.is_empty() {
                trace!("phase '{}' is empty; range tasks skipped", phase.name);
            }

            for reduction in &mut phase.reductions {
                let _reduction_scope = profiler
                    .as_ref()
                    .map(|p| p.scope(format!("Reduction:{}", phase.name)));
                reduction(frame, dt);
            }
            debug!("phase end   '{}' frame={frame}", phase.name);
        }

        self.frame += 1;
        if self.frame & 0x3FF == 0 {
            info!("progress frame={}", self.frame);
        }
    }

    /// Compare simulated time against wall clock every `drift_log_interval`
    /// frames. Drift is an observation, not an error; nothing is corrected
    /// here.
    fn observe_drift(&mut self) {
        let interval = self.settings.drift_log_interval;
        if interval <= 0 || self.frame % interval != 0 {
            return;
        }
        let sim_t = self.frame as f64 * self.timing.dt_micro;
        let real_t = self.start_real.elapsed().as_secs_f64();
        let drift_ms = (sim_t - real_t) * 1e3;
        self.last_drift_ms = drift_ms;
        info!(
            "drift frame={} sim_t={sim_t:.3}s real_t={real_t:.3}s drift={drift_ms:.2}ms",
            self.frame
        );
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

fn log_config(s: &Settings) {
    info!(
        "config hz={} max_frames={} threads={} main_helps={} chunk={} adaptive={} drift_interval={} spin_micros={}",
        s.hz,
        s.max_frames,
        s.threads,
        s.main_helps,
        s.chunk_size,
        s.adaptive,
        s.drift_log_interval,
        s.spin_micros
    );
}
