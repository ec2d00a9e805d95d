use std::time::Duration;

/// Timing quantities derived from the configured micro-step rate.
///
/// One frame advances the simulation by `dt_micro` seconds. Above 1 kHz the
/// outer scheduler cadence would drop below what OS sleep primitives can
/// honor, so `sub_steps` groups micro-steps such that `outer_dt` stays at or
/// above one millisecond; the executor still advances exactly one micro-step
/// per tick and the catch-up path absorbs the difference under load.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameTiming {
    pub hz: f64,
    pub dt_micro: f64,
    pub sub_steps: u32,
    pub outer_dt: f64,
}

impl FrameTiming {
    /// Derive timing from a micro-step rate. Non-positive rates clamp to 1 Hz.
    pub fn from_hz(hz: f64) -> Self {
        let hz = if hz > 0.0 { hz } else { 1.0 };
        let sub_steps = if hz > 1000.0 {
            (hz / 1000.0).ceil() as u32
        } else {
            1
        };
        let dt_micro = 1.0 / hz;
        Self {
            hz,
            dt_micro,
            sub_steps,
            outer_dt: dt_micro * sub_steps as f64,
        }
    }

    pub fn dt(&self) -> Duration {
        Duration::from_secs_f64(self.dt_micro)
    }
}
