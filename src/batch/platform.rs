//! Container platform, health probe and file store collaborators.
//!
//! The coordination layer never talks to Kubernetes or object storage
//! directly; it goes through these traits. Pod names are derived
//! deterministically from the bucket and filename so a retried "start"
//! request targets the same pod instead of creating a duplicate.

use crate::batch::types::{PodObject, PodSpec};
use crate::error::{CadForgeError, CadForgeResult};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Length of the hash suffix in derived pod names.
const POD_NAME_HASH_LEN: usize = 16;

/// Orchestration platform operations used by the batch services.
pub trait ContainerPlatform: Send + Sync {
    fn create_pod(&self, spec: &PodSpec) -> CadForgeResult<()>;
    fn get_pod(&self, name: &str, namespace: &str) -> CadForgeResult<Option<PodObject>>;
    fn delete_pod(&self, name: &str, namespace: &str) -> CadForgeResult<bool>;
    fn list_services(&self) -> CadForgeResult<Vec<ServiceEndpoint>>;
}

/// One platform service and its externally reachable ingress, when resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEndpoint {
    pub name: String,
    pub ingress: Option<String>,
}

/// Verdict of a pod-internal health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Failed,
}

/// Probe into a pod's own status endpoint.
pub trait PodHealthProbe: Send + Sync {
    /// Query the pod at the given IP. A transport error means the pod is
    /// unreachable and is surfaced as Err; callers treat it as pod failure.
    fn probe(&self, ip: &str) -> CadForgeResult<HealthVerdict>;
}

/// HTTP health probe against `http://<ip>:<port>/healthcheck`.
///
/// `Failed` is the only distinguished response body; everything else counts
/// as healthy.
pub struct HttpHealthProbe {
    client: reqwest::blocking::Client,
    port: u16,
}

impl HttpHealthProbe {
    pub fn new(port: u16, timeout: Duration) -> CadForgeResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client, port })
    }
}

impl PodHealthProbe for HttpHealthProbe {
    fn probe(&self, ip: &str) -> CadForgeResult<HealthVerdict> {
        let url = format!("http://{}:{}/healthcheck", ip, self.port);
        let body = self.client.get(&url).send()?.text()?;
        if body.trim() == "Failed" {
            Ok(HealthVerdict::Failed)
        } else {
            Ok(HealthVerdict::Healthy)
        }
    }
}

/// Signed URL issuance for source downloads and artifact uploads.
pub trait FileStore: Send + Sync {
    fn signed_download_url(&self, bucket: &str, key: &str) -> CadForgeResult<String>;
    fn signed_upload_url(&self, bucket: &str, key: &str) -> CadForgeResult<String>;
}

fn hashed_pod_name(prefix: &str, bucket: &str, filename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bucket.as_bytes());
    hasher.update(b"/");
    hasher.update(filename.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", prefix, &digest[..POD_NAME_HASH_LEN])
}

/// Deterministic name for the conversion pod of one (bucket, file) pair.
pub fn conversion_pod_name(bucket: &str, filename: &str) -> String {
    hashed_pod_name("conv", bucket, filename)
}

/// Deterministic name for the optimizer pod tied to the same job.
pub fn optimizer_pod_name(bucket: &str, filename: &str) -> String {
    hashed_pod_name("opt", bucket, filename)
}

/// Validate that a pod IP is present before probing.
pub fn require_pod_ip<'a>(pod: &'a PodObject) -> CadForgeResult<&'a str> {
    pod.ip
        .as_deref()
        .ok_or_else(|| CadForgeError::Batch(format!("Pod {} has no IP to probe", pod.name)))
}
