use common::normalize_string::NormalizeString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("thread_count must be positive")]
    ZeroThreads,
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Runs ready nodes on a thread pool. When off, every node runs on the calling thread.
    pub multi_threading: bool,
    /// Size of a dedicated thread pool. `None` uses the global rayon pool.
    pub thread_count: Option<usize>,
    /// Node states are created in parallel for graphs with at least this many nodes.
    pub parallel_state_init_threshold: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            multi_threading: true,
            thread_count: None,
            parallel_state_init_threshold: 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn single_threaded() -> Self {
        ExecutorConfig {
            multi_threading: false,
            ..Default::default()
        }
    }

    pub fn to_yaml(&self) -> String {
        serde_yml::to_string(self)
            .expect("Failed to serialize executor config to YAML")
            .normalize()
    }

    pub fn from_yaml(yaml: &str) -> Result<ExecutorConfig> {
        let config: ExecutorConfig = serde_yml::from_str(yaml)?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_yaml_file(path: &str) -> Result<ExecutorConfig> {
        let yaml = std::fs::read_to_string(path)?;

        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_count == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }

        Ok(())
    }
}
