use std::fs;
use std::path::Path;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::core::pool::DEFAULT_CHUNK_SIZE;

/// Driver settings. An immutable snapshot is taken per frame; re-applying
/// swaps it. Invalid values are clamped rather than rejected (see
/// [`Settings::clamped`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Target micro-step rate in Hz. Non-positive values clamp to 1.
    #[serde(default = "Settings::default_hz")]
    pub hz: f64,
    /// Stop after this many frames; -1 means endless.
    #[serde(default = "Settings::default_max_frames")]
    pub max_frames: i64,
    /// Enable drift-driven catch-up.
    #[serde(default)]
    pub adaptive: bool,
    /// Upper bound on extra frames per scheduler tick.
    #[serde(default = "Settings::default_max_catch_up")]
    pub max_catch_up: i32,
    /// Worker thread count. Zero clamps to 1.
    #[serde(default = "Settings::default_threads")]
    pub threads: usize,
    /// Whether the scheduling thread participates in chunk execution.
    #[serde(default = "Settings::default_main_helps")]
    pub main_helps: bool,
    /// Elements per chunk when splitting a range task. Zero substitutes 256.
    #[serde(default = "Settings::default_chunk_size")]
    pub chunk_size: usize,
    /// Frames between drift observations; non-positive disables them.
    #[serde(default = "Settings::default_drift_log_interval")]
    pub drift_log_interval: i64,
    /// Fine-wait budget in microseconds near a deadline before yielding.
    #[serde(default = "Settings::default_spin_micros")]
    pub spin_micros: i64,
}

impl Settings {
    fn default_hz() -> f64 {
        500.0
    }
    fn default_max_frames() -> i64 {
        2500
    }
    fn default_max_catch_up() -> i32 {
        4
    }
    fn default_threads() -> usize {
        thread::available_parallelism().map_or(1, |n| n.get())
    }
    fn default_main_helps() -> bool {
        true
    }
    fn default_chunk_size() -> usize {
        DEFAULT_CHUNK_SIZE
    }
    fn default_drift_log_interval() -> i64 {
        250
    }
    fn default_spin_micros() -> i64 {
        200
    }

    /// Apply the clamping policies: out-of-range values are coerced to the
    /// nearest usable ones, never rejected.
    pub fn clamped(mut self) -> Self {
        if self.hz <= 0.0 {
            self.hz = 1.0;
        }
        if self.threads == 0 {
            self.threads = 1;
        }
        if self.max_catch_up < 0 {
            self.max_catch_up = 0;
        }
        if self.max_frames < -1 {
            self.max_frames = -1;
        }
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.spin_micros < 0 {
            self.spin_micros = 0;
        }
        self
    }

    /// Read settings from a TOML file, or write the defaults there and return
    /// them when the file does not exist yet.
    pub fn load_or_default(path: &str) -> Self {
        let path_obj = Path::new(path);
        if path_obj.exists() {
            match fs::read_to_string(path_obj) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(settings) => return settings,
                    Err(err) => {
                        eprintln!("Failed to parse settings {path}: {err}. Using defaults.");
                    }
                },
                Err(err) => {
                    eprintln!("Failed to read settings {path}: {err}. Using defaults.");
                }
            }
            return Self::default();
        }

        // File does not exist: write defaults and return them.
        let defaults = Self::default();
        match toml::to_string_pretty(&defaults) {
            Ok(text) => {
                if let Err(err) = fs::write(path_obj, text) {
                    eprintln!("Failed to write default settings to {path}: {err}");
                }
            }
            Err(err) => {
                eprintln!("Failed to serialize default settings: {err}");
            }
        }
        defaults
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hz: Self::default_hz(),
            max_frames: Self::default_max_frames(),
            adaptive: false,
            max_catch_up: Self::default_max_catch_up(),
            threads: Self::default_threads(),
            main_helps: Self::default_main_helps(),
            chunk_size: Self::default_chunk_size(),
            drift_log_interval: Self::default_drift_log_interval(),
            spin_micros: Self::default_spin_micros(),
        }
    }
}
