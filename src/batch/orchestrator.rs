//! Batch conversion pod creation.
//!
//! Pod names are a hash of (bucket, filename), which makes "start" naturally
//! idempotent: a retried or concurrent request targets the same pod name,
//! finds the existing pod and re-registers it with the tracker instead of
//! creating a duplicate. No distributed lock is needed at creation time.

use crate::batch::conversion::ConversionStore;
use crate::batch::platform::{
    conversion_pod_name, optimizer_pod_name, ContainerPlatform, FileStore,
};
use crate::batch::tracker::PodLifecycleTracker;
use crate::batch::types::{PodSpec, PodType};
use crate::clearance::OperationContext;
use crate::config::CoordinationConfig;
use crate::error::{CadForgeError, CadForgeResult};
use log::{info, warn};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

/// Downstream artifact kinds a conversion pod uploads when it finishes.
pub const ARTIFACT_KINDS: [&str; 6] = [
    "glb",
    "usdz",
    "thumbnail",
    "hierarchy",
    "materials",
    "report",
];

/// Decides when to create a new conversion pod and wires its environment.
pub struct BatchCreationOrchestrator {
    platform: Arc<dyn ContainerPlatform>,
    files: Arc<dyn FileStore>,
    tracker: Arc<PodLifecycleTracker>,
    conversion: Arc<ConversionStore>,
    config: CoordinationConfig,
    ingress: OnceCell<String>,
}

impl BatchCreationOrchestrator {
    pub fn new(
        platform: Arc<dyn ContainerPlatform>,
        files: Arc<dyn FileStore>,
        tracker: Arc<PodLifecycleTracker>,
        conversion: Arc<ConversionStore>,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            platform,
            files,
            tracker,
            conversion,
            config,
            ingress: OnceCell::new(),
        }
    }

    /// Block until the platform ingress endpoint resolves. Persistent
    /// failure is reported through `on_fatal`; the caller decides whether
    /// to retry or abort the process.
    pub fn initialize(&self, on_fatal: &dyn Fn(&str)) -> bool {
        for attempt in 0..self.config.ingress_poll_attempts {
            match self.platform.list_services() {
                Ok(services) => {
                    if let Some(ingress) = services.into_iter().find_map(|s| s.ingress) {
                        info!("Resolved platform ingress: {}", ingress);
                        let _ = self.ingress.set(ingress);
                        return true;
                    }
                }
                Err(e) => warn!("Service listing failed (attempt {}): {}", attempt + 1, e),
            }
            thread::sleep(std::time::Duration::from_millis(
                self.config.ingress_poll_interval_ms,
            ));
        }
        on_fatal("Could not resolve the orchestration platform ingress");
        false
    }

    /// Resolved ingress endpoint, once initialization succeeded.
    pub fn ingress(&self) -> Option<&str> {
        self.ingress.get().map(String::as_str)
    }

    /// Start (or resume) the batch conversion of one file. Returns the
    /// deterministic pod name handling the job.
    pub fn start_batch_process(
        &self,
        bucket: &str,
        filename: &str,
        zip_assembly_hint: Option<&str>,
    ) -> CadForgeResult<String> {
        let ingress = self.ingress.get().ok_or_else(|| {
            CadForgeError::Batch("Orchestrator is not initialized".to_string())
        })?;

        let pod_name = conversion_pod_name(bucket, filename);

        let ctx = OperationContext::new();
        self.conversion.ensure_queued(&ctx, filename)?;

        if self
            .platform
            .get_pod(&pod_name, &self.config.pod_namespace)?
            .is_some()
        {
            // Idempotent re-entry: the pod already exists, resume tracking.
            info!("Pod {} already exists; re-registering with tracker", pod_name);
            self.tracker.register_new_pod(
                &pod_name,
                PodType::Process,
                bucket,
                filename,
                zip_assembly_hint,
            );
            return Ok(pod_name);
        }

        let environment =
            self.build_environment(ingress, bucket, filename, zip_assembly_hint)?;
        let spec = PodSpec {
            name: pod_name.clone(),
            namespace: self.config.pod_namespace.clone(),
            pod_type: PodType::Process,
            environment,
        };
        self.platform.create_pod(&spec)?;
        info!("Created conversion pod {} for {}/{}", pod_name, bucket, filename);

        if !self.tracker.register_new_pod(
            &pod_name,
            PodType::Process,
            bucket,
            filename,
            zip_assembly_hint,
        ) {
            warn!("Pod {} created but registration failed; sweep will pick it up", pod_name);
        }

        self.conversion.mark_processing(&ctx, filename)?;
        Ok(pod_name)
    }

    fn build_environment(
        &self,
        ingress: &str,
        bucket: &str,
        filename: &str,
        zip_assembly_hint: Option<&str>,
    ) -> CadForgeResult<HashMap<String, String>> {
        let mut environment = HashMap::new();
        environment.insert("PLATFORM_INGRESS".to_string(), ingress.to_string());
        environment.insert("SOURCE_BUCKET".to_string(), bucket.to_string());
        environment.insert("SOURCE_FILE".to_string(), filename.to_string());
        environment.insert(
            "SOURCE_URL".to_string(),
            self.files.signed_download_url(bucket, filename)?,
        );
        if let Some(hint) = zip_assembly_hint {
            environment.insert("ZIP_ASSEMBLY".to_string(), hint.to_string());
        }
        for kind in ARTIFACT_KINDS {
            let upload_key = format!("converted/{}/{}.{}", filename, filename, kind);
            environment.insert(
                format!("UPLOAD_URL_{}", kind.to_uppercase()),
                self.files.signed_upload_url(bucket, &upload_key)?,
            );
        }
        Ok(environment)
    }

    /// Stop the conversion of one file and clean up both pods.
    pub fn stop_batch_process(&self, bucket: &str, filename: &str) {
        let pod_name = conversion_pod_name(bucket, filename);
        self.tracker.stop_tracking(&pod_name);
        self.cleanup_optimizer(bucket, filename);
    }

    /// Record a successful conversion reported out-of-band.
    pub fn notify_pod_succeeded(&self, bucket: &str, filename: &str) {
        let pod_name = conversion_pod_name(bucket, filename);
        self.tracker.handle_pod_success(&pod_name, bucket, filename);
        self.cleanup_optimizer(bucket, filename);
    }

    /// Route a conversion failure through the canonical failure path.
    pub fn pod_failure(&self, bucket: &str, filename: &str, reason: &str) {
        let pod_name = conversion_pod_name(bucket, filename);
        self.tracker
            .handle_pod_failure(&pod_name, bucket, filename, reason);
        self.cleanup_optimizer(bucket, filename);
    }

    /// Best-effort deletion of the optimizer pod tied to the same job.
    fn cleanup_optimizer(&self, bucket: &str, filename: &str) {
        let optimizer = optimizer_pod_name(bucket, filename);
        match self
            .platform
            .delete_pod(&optimizer, &self.config.pod_namespace)
        {
            Ok(true) => info!("Deleted optimizer pod {}", optimizer),
            Ok(false) => {}
            Err(e) => warn!("Failed to delete optimizer pod {}: {}", optimizer, e),
        }
    }
}
