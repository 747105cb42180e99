//! Engine configuration, initialized at startup and frozen thereafter.

use serde::{Deserialize, Serialize};

/// Lock acquisition order for contended instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockFairness {
    /// Waiters are served in arrival order (tokio mutex default).
    #[default]
    Fifo,
    Unfair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Enables ScriptTask execution through a registered script engine.
    pub script_tasks_enabled: bool,
    /// Interval of the background timer poll loop.
    pub timer_poll_interval_ms: u64,
    /// How long one worker may hold a claimed timer job before the lease
    /// can be stolen.
    pub timer_lease_ttl_ms: u64,
    /// Default timeout for HTTP topic handlers without an explicit one.
    pub handler_http_default_timeout_ms: u64,
    /// Default retry budget for HTTP topic handlers.
    pub handler_http_max_retries: u32,
    /// Upper bound on a single string variable value.
    pub variable_max_bytes: usize,
    pub instance_lock_fairness: LockFairness,
    /// Upper bound on instances advanced concurrently by background
    /// resumption paths (timers, async callbacks).
    pub max_concurrent_workers: usize,
    /// Timer job retry budget before the job is abandoned.
    pub timer_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_tasks_enabled: false,
            timer_poll_interval_ms: 1_000,
            timer_lease_ttl_ms: 60_000,
            handler_http_default_timeout_ms: 30_000,
            handler_http_max_retries: 0,
            variable_max_bytes: 1024 * 1024,
            instance_lock_fairness: LockFairness::Fifo,
            max_concurrent_workers: 8,
            timer_max_attempts: 3,
        }
    }
}
