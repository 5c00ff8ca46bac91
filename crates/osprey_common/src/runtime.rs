//! The explicit context value threaded through constructors.
//!
//! The memory manager, configuration, and time predictor are process-wide
//! concerns, but they are carried as an explicit `Runtime` value rather than
//! reached through ambient statics. `Runtime` is cheap to clone (everything
//! shared lives behind `Arc`).

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::memory::{ExhaustionPolicy, MemoryManager};
use crate::progress::TimePredictor;

#[derive(Debug, Clone)]
pub struct Runtime {
    config: Arc<Config>,
    memory: Arc<MemoryManager>,
    predictor: Arc<TimePredictor>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let memory = MemoryManager::new(config.memory_limit, ExhaustionPolicy::Error);
        let predictor = TimePredictor::with_store(
            config.temp_dir().join("osprey_time_predictions.json"),
        );
        Self {
            config: Arc::new(config),
            memory: Arc::new(memory),
            predictor: Arc::new(predictor),
        }
    }

    /// A runtime configured from the `OSPREY_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(Config::from_env())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn predictor(&self) -> &TimePredictor {
        &self.predictor
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.config.temp_dir()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
