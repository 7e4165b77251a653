use std::time::Duration;

use envconfig::Envconfig;

use crate::controller::queue::{BucketLimiter, ItemExponentialLimiter, MaxOfLimiter};

#[derive(Envconfig, Clone, Debug)]
pub struct AgentConfig {
    /// Identity under which imported endpoints are republished.
    /// Env: OPRC_MCS_CLUSTER_ID
    #[envconfig(from = "OPRC_MCS_CLUSTER_ID")]
    pub cluster_id: String,

    /// Namespace watched for ServiceImport objects.
    #[envconfig(from = "OPRC_MCS_NAMESPACE", default = "submariner-operator")]
    pub namespace: String,

    /// Number of reconciliation worker loops.
    #[envconfig(from = "OPRC_MCS_WORKERS", default = "1")]
    pub workers: usize,

    /// Default log directive, merged with RUST_LOG.
    #[envconfig(from = "OPRC_MCS_LOG", default = "info")]
    pub log_level: String,

    #[envconfig(nested)]
    pub retry: RetryConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryConfig {
    #[envconfig(from = "OPRC_MCS_RETRY_BASE_DELAY_MS", default = "5")]
    pub base_delay_ms: u64,
    #[envconfig(from = "OPRC_MCS_RETRY_MAX_DELAY_SECS", default = "1000")]
    pub max_delay_secs: u64,
    /// Overall requeue rate shared by every key
    #[envconfig(from = "OPRC_MCS_RETRY_QPS", default = "10")]
    pub qps: f64,
    #[envconfig(from = "OPRC_MCS_RETRY_BURST", default = "100")]
    pub burst: u32,
}

impl AgentConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

impl RetryConfig {
    /// Per-key exponential backoff bounded by an overall token bucket,
    /// whichever asks for the longer wait.
    pub fn limiter(&self) -> MaxOfLimiter {
        MaxOfLimiter::new(vec![
            Box::new(ItemExponentialLimiter::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_secs(self.max_delay_secs),
            )),
            Box::new(BucketLimiter::new(self.qps, self.burst)),
        ])
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_secs: 1000,
            qps: 10.0,
            burst: 100,
        }
    }
}
