//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::executor::ExecLimits;

/// Instance lifetime (20 minutes)
pub const DEFAULT_INSTANCE_TTL_SECS: u64 = 20 * 60;
/// How often the sweeper looks for expired instances
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 100 * 1024;
pub const DEFAULT_MAX_COMMAND_LEN: usize = 200;

/// Everything the core needs to know at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory under which every instance gets its own subdirectory.
    pub sandbox_root: PathBuf,
    pub instance_ttl: Duration,
    pub sweep_interval: Duration,
    pub command_timeout: Duration,
    pub max_output_bytes: usize,
    /// Maximum command length, in characters, after trimming.
    pub max_command_len: usize,
}

impl Config {
    pub fn exec_limits(&self) -> ExecLimits {
        ExecLimits {
            timeout: self.command_timeout,
            max_output_bytes: self.max_output_bytes,
        }
    }
}

pub fn default_sandbox_root() -> PathBuf {
    std::env::temp_dir().join("flagbox-sandbox")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            instance_ttl: Duration::from_secs(DEFAULT_INSTANCE_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
        }
    }
}
