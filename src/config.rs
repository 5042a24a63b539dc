//! Runtime configuration for the coordination services.
//!
//! Every polling interval, liveness window and retry policy is a first-class
//! configuration value with spec defaults, loadable from a TOML file so
//! deployments can tune timing without a rebuild.

use crate::constants::DEFAULT_HEALTH_PORT;
use crate::error::{CadForgeError, CadForgeResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before the given retry attempt (0-based), with jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }
}

/// Timing and retry knobs for clearance, index fan-out and pod tracking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinationConfig {
    /// How many times the per-pod poller refreshes a still-Pending pod
    pub pending_poll_attempts: u32,
    /// Sleep between per-pod poll passes, in milliseconds
    pub poll_interval_ms: u64,
    /// A tracked pod is considered stale after this many seconds without
    /// a status refresh
    pub liveness_window_secs: i64,
    /// Sleep between reconciliation sweep passes, in milliseconds
    pub sweep_interval_ms: u64,
    /// Terminal pods older than this many seconds are purged by the sweep
    pub retention_secs: i64,
    /// Timeout for the pod-internal health probe, in milliseconds
    pub health_probe_timeout_ms: u64,
    /// Port of the pod-internal health endpoint
    pub health_probe_port: u16,
    /// Retry policy for delivery-ensured mutations
    pub delivery_retry: RetryPolicy,
    /// How many times initialization polls for the platform ingress
    pub ingress_poll_attempts: u32,
    /// Sleep between ingress resolution attempts, in milliseconds
    pub ingress_poll_interval_ms: u64,
    /// Namespace in which conversion pods are created
    pub pod_namespace: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            pending_poll_attempts: 60,
            poll_interval_ms: 2_000,
            liveness_window_secs: 60,
            sweep_interval_ms: 10_000,
            retention_secs: 3_600,
            health_probe_timeout_ms: 5_000,
            health_probe_port: DEFAULT_HEALTH_PORT,
            delivery_retry: RetryPolicy::default(),
            ingress_poll_attempts: 30,
            ingress_poll_interval_ms: 1_000,
            pod_namespace: "conversion".to_string(),
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any omitted field.
    pub fn from_file(path: &Path) -> CadForgeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| CadForgeError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Sleep between per-pod poll passes.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Sleep between reconciliation sweep passes.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Timeout for the pod-internal health probe.
    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    /// How long terminal pod snapshots stay readable.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs.max(0) as u64)
    }
}
