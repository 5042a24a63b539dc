//! Batch processing domain types: pod phases, status snapshots, conversion
//! pipeline entries and worker VM records.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Observed lifecycle phase of an external worker pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The pod disappeared before reaching a terminal phase; candidate for
    /// re-registration by the reconciliation sweep.
    Unknown,
}

impl PodPhase {
    /// Parse a platform-reported phase string. `Completed` is accepted as a
    /// success synonym; anything unrecognized maps to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" | "Completed" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Kind of work a pod performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodType {
    Process,
    Optimizer,
}

impl fmt::Display for PodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Optimizer => write!(f, "optimizer"),
        }
    }
}

/// Per-pod tracking snapshot kept in the shared memory store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodStatusSnapshot {
    pub pod_name: String,
    pub pod_type: PodType,
    pub phase: PodPhase,
    pub bucket: String,
    pub filename: String,
    pub zip_assembly_hint: Option<String>,
    /// Unix seconds when tracking started
    pub started_at: i64,
    /// Unix seconds of the last refresh by a poller or sweep
    pub last_update: i64,
}

impl PodStatusSnapshot {
    pub fn new(
        pod_name: &str,
        pod_type: PodType,
        bucket: &str,
        filename: &str,
        zip_assembly_hint: Option<&str>,
    ) -> Self {
        let now = Utc::now().timestamp();
        Self {
            pod_name: pod_name.to_string(),
            pod_type,
            phase: PodPhase::Pending,
            bucket: bucket.to_string(),
            filename: filename.to_string(),
            zip_assembly_hint: zip_assembly_hint.map(|s| s.to_string()),
            started_at: now,
            last_update: now,
        }
    }

    /// Refresh the last-update timestamp.
    pub fn touch(&mut self) {
        self.last_update = Utc::now().timestamp();
    }

    /// Seconds since the last refresh, clamped at zero.
    pub fn staleness_secs(&self, now: i64) -> i64 {
        (now - self.last_update).max(0)
    }
}

/// Pipeline status of one file conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionStatus {
    Queued,
    Processing,
    ProcessFailed,
    ProcessComplete,
}

/// Tracks one file's conversion pipeline stage and status.
/// Rows are keyed by the percent-encoded raw-file relative path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileConversionEntry {
    pub file_key: String,
    pub stage: String,
    pub status: ConversionStatus,
    pub updated_at: i64,
}

impl FileConversionEntry {
    pub fn new(file_key: &str, stage: &str, status: ConversionStatus) -> Self {
        Self {
            file_key: file_key.to_string(),
            stage: stage.to_string(),
            status,
            updated_at: Utc::now().timestamp(),
        }
    }
}

/// Availability of a long-lived VM worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerVmStatus {
    Available,
    Busy,
    Stopped,
}

/// Tracks one VM worker and the process currently assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerVmEntry {
    pub vm_id: String,
    pub status: WorkerVmStatus,
    pub assigned_process: Option<String>,
    pub updated_at: i64,
}

impl WorkerVmEntry {
    pub fn new(vm_id: &str) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            status: WorkerVmStatus::Available,
            assigned_process: None,
            updated_at: Utc::now().timestamp(),
        }
    }
}

/// A pod as reported by the container orchestration platform.
#[derive(Debug, Clone, PartialEq)]
pub struct PodObject {
    pub name: String,
    pub phase: PodPhase,
    pub ip: Option<String>,
    /// Exit codes of containers that have terminated
    pub container_exit_codes: Vec<i32>,
}

impl PodObject {
    /// Whether any container terminated with a non-zero exit code.
    pub fn has_failed_container(&self) -> bool {
        self.container_exit_codes.iter().any(|code| *code != 0)
    }
}

/// Creation request handed to the orchestration platform.
#[derive(Debug, Clone, PartialEq)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    pub pod_type: PodType,
    pub environment: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parse_accepts_completed_as_success() {
        assert_eq!(PodPhase::parse("Succeeded"), PodPhase::Succeeded);
        assert_eq!(PodPhase::parse("Completed"), PodPhase::Succeeded);
        assert_eq!(PodPhase::parse("Evicted"), PodPhase::Unknown);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
        assert!(!PodPhase::Unknown.is_terminal());
    }

    #[test]
    fn test_failed_container_detection() {
        let pod = PodObject {
            name: "conv-a".to_string(),
            phase: PodPhase::Running,
            ip: None,
            container_exit_codes: vec![0, 2],
        };
        assert!(pod.has_failed_container());
    }
}
