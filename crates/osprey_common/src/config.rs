//! Library configuration.
//!
//! A small, enumerated surface: every knob can be set programmatically or
//! picked up from the environment (`OSPREY_*` variables). Unknown or
//! malformed environment values fall back to the default for that knob.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default accounted-memory limit: 1 GiB.
pub const DEFAULT_MEMORY_LIMIT: u64 = 1 << 30;

/// Default block size hint for newly created streams: 2 MiB.
pub const DEFAULT_BLOCK_SIZE_HINT: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Accounted-memory budget in bytes for the process.
    pub memory_limit: u64,
    /// Directory for temporary files. Empty = OS temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Preferred block size in bytes when creating new streams. Rounded up
    /// to the 4096-byte boundary by the stream layer.
    pub block_size_hint: u64,
    /// Reject streams whose header says the last close was not clean.
    pub validate_cleanclose: bool,
    /// Worker threads for data-parallel operators. 0 = one per CPU.
    pub worker_count: usize,
    /// Whether progress indicators render at all (false = null sink).
    pub progress_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            temp_dir: None,
            block_size_hint: DEFAULT_BLOCK_SIZE_HINT,
            validate_cleanclose: true,
            worker_count: 0,
            progress_enabled: true,
        }
    }
}

impl Config {
    /// Build a config from the `OSPREY_*` environment variables, starting
    /// from `Default` for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Some(v) = env_u64("OSPREY_MEMORY_LIMIT") {
            cfg.memory_limit = v;
        }
        if let Ok(v) = std::env::var("OSPREY_TEMP_DIR") {
            if !v.is_empty() {
                cfg.temp_dir = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = env_u64("OSPREY_BLOCK_SIZE_HINT") {
            cfg.block_size_hint = v;
        }
        if let Some(v) = env_bool("OSPREY_VALIDATE_CLEANCLOSE") {
            cfg.validate_cleanclose = v;
        }
        if let Some(v) = env_u64("OSPREY_WORKER_COUNT") {
            cfg.worker_count = v as usize;
        }
        if let Some(v) = env_bool("OSPREY_PROGRESS_ENABLED") {
            cfg.progress_enabled = v;
        }
        cfg
    }

    /// Effective worker count: `worker_count`, or the CPU count when 0.
    pub fn effective_workers(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Resolved temporary directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
