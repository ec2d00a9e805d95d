use std::sync::Arc;

use thiserror::Error;

/// Serial subsystem: runs on the scheduling thread, may mutate captured state.
pub type SerialFn = Box<dyn FnMut(i64, f64) + Send>;

/// Parallel range task over a half-open sub-range of the phase's element
/// domain. Invoked concurrently on disjoint chunks, so the body must be
/// `Fn` and commutative across chunks; any shared state is the closure's
/// responsibility to partition by index or synchronize.
pub type RangeFn = Arc<dyn Fn(usize, usize, i64, f64) + Send + Sync>;

/// Reduction: runs serially on the scheduling thread after all range tasks
/// of the phase have completed.
pub type ReduceFn = Box<dyn FnMut(i64, f64) + Send>;

/// Opaque handle returned by `SimDriver::add_phase`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseId(pub(crate) usize);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("invalid phase handle: index {0} out of range")]
    InvalidHandle(usize),
}

/// A named unit of intra-frame work. Within a frame, serial subsystems run
/// strictly before parallel range tasks, which run strictly before
/// reductions; phases execute in insertion order.
pub struct Phase {
    pub(crate) name: String,
    pub(crate) serial: Vec<SerialFn>,
    pub(crate) range_tasks: Vec<RangeFn>,
    pub(crate) reductions: Vec<ReduceFn>,
    pub(crate) element_count: usize,
    pub(crate) enabled: bool,
}

impl Phase {
    pub(crate) fn new(name: &str, element_count: usize) -> Self {
        Self {
            name: name.to_string(),
            serial: Vec::new(),
            range_tasks: Vec::new(),
            reductions: Vec::new(),
            element_count,
            enabled: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}
