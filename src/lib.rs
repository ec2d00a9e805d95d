//! Deterministic fixed-timestep simulation driver.
//!
//! `lockstep` advances a user-defined world through discrete frames at a
//! configured rate, dispatching work across a persistent pool of worker
//! threads while keeping wall-clock progress aligned with simulated time.
//! It is built for physics-style inner loops (control, force integration,
//! reductions) where reproducibility and stable cadence matter more than
//! raw throughput.
//!
//! A frame runs an ordered list of phases: serial subsystems on the
//! scheduling thread, then parallel range tasks chunked across the worker
//! pool, then serial reductions. Range tasks receive
//! disjoint half-open sub-ranges of the phase's element domain, so the
//! result of a frame is bit-identical for any worker count as long as the
//! task bodies are commutative across chunks.

pub mod config;
pub mod core;
pub mod profile;

pub use crate::config::Settings;
pub use crate::core::driver::{DriverHandle, SimDriver};
pub use crate::core::phase::{DriverError, PhaseId, RangeFn};
pub use crate::core::pool::WorkerPool;
pub use crate::core::timing::FrameTiming;
pub use crate::profile::Profiler;
