//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::{KillMode, DEFAULT_GRACE_PERIOD, DEFAULT_OUTPUT_BUFFER};

/// How the supervisor terminates a process, as written in config files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KillModeConfig {
    #[default]
    Force,
    Graceful,
}

/// Configuration for a supervised process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Kill the process after this many milliseconds. No limit when unset.
    pub timeout_ms: Option<u64>,
    /// How to terminate on cancellation or timeout.
    pub kill_mode: KillModeConfig,
    /// Milliseconds between SIGTERM and SIGKILL in graceful mode.
    pub grace_period_ms: u64,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// Lines buffered between the child and the output consumer.
    pub output_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            kill_mode: KillModeConfig::default(),
            grace_period_ms: duration_millis(DEFAULT_GRACE_PERIOD),
            working_dir: None,
            env: HashMap::new(),
            output_buffer: DEFAULT_OUTPUT_BUFFER,
        }
    }
}

impl SupervisorConfig {
    /// The timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// The grace period as a `Duration`.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// The kill mode with its grace period applied.
    #[must_use]
    pub fn kill_mode(&self) -> KillMode {
        match self.kill_mode {
            KillModeConfig::Force => KillMode::Force,
            KillModeConfig::Graceful => KillMode::Graceful {
                grace: self.grace_period(),
            },
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
