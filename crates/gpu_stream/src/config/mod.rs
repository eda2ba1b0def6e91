//! Configuration system
//!
//! Streaming settings are plain serde structs. Any [`Config`] can be loaded
//! from or saved to a `.toml` or `.ron` file.

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is outside its valid range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

/// How a [`GrowableBuffer`](crate::GrowableBuffer) picks a new capacity when it must grow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrowthPolicy {
    /// Allocate exactly the requested number of elements
    Exact,
    /// Double the current capacity until the request fits
    Doubling {
        /// Capacity used when growing from empty
        min_elements: u64,
    },
}

impl GrowthPolicy {
    /// Capacity to allocate so that `required` elements fit, starting from `current`
    pub fn grow(self, current: u64, required: u64) -> u64 {
        if required <= current {
            return current;
        }
        match self {
            Self::Exact => required,
            Self::Doubling { min_elements } => {
                let mut capacity = if current == 0 { min_elements.max(1) } else { current };
                while capacity < required {
                    capacity = capacity.saturating_mul(2);
                }
                capacity
            }
        }
    }
}

/// Settings for command pools, growable buffers and deferred reclamation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Frames the device may have queued or executing at once
    pub frames_in_flight: u64,
    /// Recording threads; `None` uses the hardware concurrency
    pub worker_threads: Option<usize>,
    /// Upper bound for blocking fence and queue waits, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Growth used by explicit `reserve`/`resize` calls
    pub reserve_growth: GrowthPolicy,
    /// Growth used when a write or flush overruns capacity
    pub flush_growth: GrowthPolicy,
}

impl StreamingConfig {
    /// Set frames in flight
    pub fn with_frames_in_flight(mut self, frames: u64) -> Self {
        self.frames_in_flight = frames.clamp(1, 8);
        self
    }

    /// Set an explicit worker thread count
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Number of per-thread command pools to create
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Reject values the subsystem cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid {
                field: "frames_in_flight",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.worker_threads == Some(0) {
            return Err(ConfigError::Invalid {
                field: "worker_threads",
                reason: "must be at least 1 when set".to_string(),
            });
        }
        if self.fence_timeout_ns == 0 {
            return Err(ConfigError::Invalid {
                field: "fence_timeout_ns",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            worker_threads: None,
            fence_timeout_ns: 10_000_000_000,
            reserve_growth: GrowthPolicy::Exact,
            flush_growth: GrowthPolicy::Doubling { min_elements: 64 },
        }
    }
}

impl Config for StreamingConfig {}
