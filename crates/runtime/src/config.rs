//! Runtime configuration

use warden_durable::{ExecutorConfig, WorkerConfig};

/// Configuration for a [`WorkflowService`](crate::service::WorkflowService)
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Scatter collections longer than this are written to the object store
    pub scatter_inline_limit: usize,

    /// Gathered lists longer than this are written to the object store
    pub gather_inline_limit: usize,

    /// Executor settings (event limit)
    pub executor: ExecutorConfig,

    /// Activity worker settings
    pub worker: WorkerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scatter_inline_limit: 100,
            gather_inline_limit: 1_000,
            executor: ExecutorConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from `WARDEN_SCATTER_INLINE_LIMIT` and `WARDEN_GATHER_INLINE_LIMIT`,
    /// plus the executor and worker variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            scatter_inline_limit: std::env::var("WARDEN_SCATTER_INLINE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.scatter_inline_limit),
            gather_inline_limit: std::env::var("WARDEN_GATHER_INLINE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.gather_inline_limit),
            executor: ExecutorConfig::from_env(),
            worker: WorkerConfig::from_env(),
        }
    }

    pub fn with_scatter_inline_limit(mut self, limit: usize) -> Self {
        self.scatter_inline_limit = limit;
        self
    }

    pub fn with_gather_inline_limit(mut self, limit: usize) -> Self {
        self.gather_inline_limit = limit;
        self
    }

    pub fn with_max_events(mut self, max: usize) -> Self {
        self.executor.max_events_per_workflow = max;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}
