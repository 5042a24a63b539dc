//! Pod lifecycle tracking and reconciliation.
//!
//! Every registered pod gets its own polling thread walking the
//! `Pending -> Running -> terminal` state machine against the orchestration
//! platform, with an HTTP probe into the pod's own health endpoint while it
//! runs. A reconciliation sweep repairs whatever the pollers miss: stale
//! snapshots of running pods are re-registered for polling (self-healing
//! after a crashed poller or a process restart) and terminal snapshots past
//! the retention window are purged. Pods reaching a terminal outcome are
//! deregistered right away; their snapshot stays readable for the retention
//! window and then expires from the memory store.
//!
//! All failure detection routes converge on one canonical failure path.
//! That path is idempotent, because with at-least-once delivery the same
//! logical failure can be reported more than once.

use crate::batch::conversion::ConversionStore;
use crate::batch::platform::{require_pod_ip, ContainerPlatform, HealthVerdict, PodHealthProbe};
use crate::batch::types::{PodObject, PodPhase, PodStatusSnapshot, PodType};
use crate::clearance::{KeyClearanceRegistry, OperationContext};
use crate::config::CoordinationConfig;
use crate::constants::{
    MEMORY_DOMAIN_BATCH, MEMORY_SUB_POD_REGISTRY, MEMORY_SUB_POD_STATUS, POD_REGISTRY_KEY,
    POD_REGISTRY_LOCK, POD_SWEEP_LOCK,
};
use crate::db_operations::MemoryStore;
use crate::events::{BatchProcessFailed, BatchProcessSucceeded, MessageBus, PodRegistered};
use chrono::Utc;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Attempts to take the registry named lock before giving up.
const REGISTRY_LOCK_ATTEMPTS: u32 = 100;
const REGISTRY_LOCK_RETRY: Duration = Duration::from_millis(5);

/// Tracks the set of in-flight conversion pods and reconciles their state.
pub struct PodLifecycleTracker {
    platform: Arc<dyn ContainerPlatform>,
    probe: Arc<dyn PodHealthProbe>,
    memory: Arc<dyn MemoryStore>,
    conversion: Arc<ConversionStore>,
    bus: Arc<MessageBus>,
    clearance: Arc<KeyClearanceRegistry>,
    config: CoordinationConfig,
    shutdown: Arc<AtomicBool>,
}

impl PodLifecycleTracker {
    pub fn new(
        platform: Arc<dyn ContainerPlatform>,
        probe: Arc<dyn PodHealthProbe>,
        memory: Arc<dyn MemoryStore>,
        conversion: Arc<ConversionStore>,
        bus: Arc<MessageBus>,
        clearance: Arc<KeyClearanceRegistry>,
        config: CoordinationConfig,
    ) -> Self {
        Self {
            platform,
            probe,
            memory,
            conversion,
            bus,
            clearance,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask every polling thread and the sweeper to wind down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    // ---- registry and snapshot persistence -------------------------------

    fn load_registry(&self) -> Vec<String> {
        self.memory
            .get_key_value(MEMORY_DOMAIN_BATCH, MEMORY_SUB_POD_REGISTRY, POD_REGISTRY_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn store_registry(&self, names: &[String]) {
        match serde_json::to_string(names) {
            Ok(raw) => self.memory.set_key_value(
                MEMORY_DOMAIN_BATCH,
                MEMORY_SUB_POD_REGISTRY,
                POD_REGISTRY_KEY,
                &raw,
            ),
            Err(e) => error!("Failed to serialize pod registry: {}", e),
        }
    }

    fn with_registry_lock<R>(&self, mutate: impl FnOnce(&Self) -> R) -> Option<R> {
        for _ in 0..REGISTRY_LOCK_ATTEMPTS {
            if self.clearance.acquire_named(POD_REGISTRY_LOCK) {
                let result = mutate(self);
                self.clearance.release_named(POD_REGISTRY_LOCK);
                return Some(result);
            }
            thread::sleep(REGISTRY_LOCK_RETRY);
        }
        warn!("Could not take the pod registry lock");
        None
    }

    fn add_to_registry(&self, pod_name: &str) -> bool {
        self.with_registry_lock(|tracker| {
            let mut names = tracker.load_registry();
            if !names.iter().any(|n| n == pod_name) {
                names.push(pod_name.to_string());
                tracker.store_registry(&names);
            }
        })
        .is_some()
    }

    fn remove_from_registry(&self, pod_name: &str) {
        self.with_registry_lock(|tracker| {
            let mut names = tracker.load_registry();
            names.retain(|n| n != pod_name);
            tracker.store_registry(&names);
        });
    }

    /// Pod names currently being tracked.
    pub fn tracked_pods(&self) -> Vec<String> {
        self.load_registry()
    }

    fn load_snapshot(&self, pod_name: &str) -> Option<PodStatusSnapshot> {
        self.memory
            .get_key_value(MEMORY_DOMAIN_BATCH, MEMORY_SUB_POD_STATUS, pod_name)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    fn store_snapshot(&self, snapshot: &PodStatusSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(raw) => self.memory.set_key_value(
                MEMORY_DOMAIN_BATCH,
                MEMORY_SUB_POD_STATUS,
                &snapshot.pod_name,
                &raw,
            ),
            Err(e) => error!("Failed to serialize snapshot for {}: {}", snapshot.pod_name, e),
        }
    }

    /// Snapshot for a tracked pod, if any.
    pub fn pod_snapshot(&self, pod_name: &str) -> Option<PodStatusSnapshot> {
        self.load_snapshot(pod_name)
    }

    fn update_phase(&self, pod_name: &str, phase: PodPhase) {
        if let Some(mut snapshot) = self.load_snapshot(pod_name) {
            snapshot.phase = phase;
            snapshot.touch();
            self.store_snapshot(&snapshot);
        }
    }

    /// Keep a terminal snapshot readable for the retention window, after
    /// which it expires. Terminal pods leave the registry immediately, so
    /// expiry is what ultimately frees their snapshot.
    fn expire_snapshot_after_retention(&self, pod_name: &str) {
        self.memory.set_key_expire_time(
            MEMORY_DOMAIN_BATCH,
            MEMORY_SUB_POD_STATUS,
            pod_name,
            self.config.retention(),
        );
    }

    // ---- registration and polling ----------------------------------------

    /// Persist an initial status snapshot, add the pod to the tracked
    /// registry and spawn its polling thread.
    pub fn register_new_pod(
        self: &Arc<Self>,
        pod_name: &str,
        pod_type: PodType,
        bucket: &str,
        filename: &str,
        zip_assembly_hint: Option<&str>,
    ) -> bool {
        let snapshot =
            PodStatusSnapshot::new(pod_name, pod_type, bucket, filename, zip_assembly_hint);
        self.store_snapshot(&snapshot);

        if !self.add_to_registry(pod_name) {
            return false;
        }

        self.spawn_poll_thread(pod_name, bucket, filename);
        if let Err(e) = self
            .bus
            .publish(PodRegistered::new(pod_name, &pod_type.to_string()))
        {
            warn!("Failed to publish PodRegistered for {}: {}", pod_name, e);
        }
        info!("Registered pod {} for {} of {}/{}", pod_name, pod_type, bucket, filename);
        true
    }

    fn spawn_poll_thread(self: &Arc<Self>, pod_name: &str, bucket: &str, filename: &str) {
        let tracker = Arc::clone(self);
        let pod_name = pod_name.to_string();
        let bucket = bucket.to_string();
        let filename = filename.to_string();
        thread::spawn(move || tracker.poll_pod(&pod_name, &bucket, &filename));
    }

    fn poll_pod(&self, pod_name: &str, bucket: &str, filename: &str) {
        // Phase 1: wait out Pending, refreshing the snapshot each pass.
        for _ in 0..self.config.pending_poll_attempts {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match self.platform.get_pod(pod_name, &self.config.pod_namespace) {
                Ok(Some(pod)) if pod.phase == PodPhase::Pending => {
                    self.update_phase(pod_name, PodPhase::Pending);
                    thread::sleep(self.config.poll_interval());
                }
                _ => break,
            }
        }

        // Phase 2: liveness loop until the pod reaches a terminal outcome.
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match self.platform.get_pod(pod_name, &self.config.pod_namespace) {
                Err(e) => {
                    warn!("Liveness check for {} failed: {}; presuming pod dead", pod_name, e);
                    self.handle_pod_failure(pod_name, bucket, filename, "liveness check failed");
                    return;
                }
                Ok(None) => {
                    // Pod object is gone. If the stored status is not
                    // terminal, the reconciliation sweep decides what to do.
                    if let Some(snapshot) = self.load_snapshot(pod_name) {
                        if !snapshot.phase.is_terminal() {
                            warn!("Pod {} disappeared before terminating; marking Unknown", pod_name);
                            self.update_phase(pod_name, PodPhase::Unknown);
                        }
                    }
                    return;
                }
                Ok(Some(pod)) => {
                    if pod.phase == PodPhase::Succeeded {
                        self.handle_pod_success(pod_name, bucket, filename);
                        return;
                    }
                    if pod.has_failed_container() {
                        self.handle_pod_failure(
                            pod_name,
                            bucket,
                            filename,
                            "container exited non-zero",
                        );
                        return;
                    }
                    match pod.phase {
                        PodPhase::Running => {
                            if !self.probe_running_pod(&pod, pod_name, bucket, filename) {
                                return;
                            }
                            self.update_phase(pod_name, PodPhase::Running);
                            thread::sleep(self.config.poll_interval());
                        }
                        PodPhase::Pending => {
                            // The bounded refresh loop already ran its
                            // course; the reconciliation sweep takes over
                            // once the snapshot goes stale.
                            info!(
                                "Pod {} still Pending after bounded refresh; deferring to sweep",
                                pod_name
                            );
                            return;
                        }
                        other => {
                            // Terminated without container-status detail:
                            // record what was observed and clean up.
                            info!("Pod {} ended in phase {}; recording and deleting", pod_name, other);
                            self.update_phase(pod_name, other);
                            self.expire_snapshot_after_retention(pod_name);
                            self.remove_from_registry(pod_name);
                            self.delete_pod_object(pod_name);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Probe a running pod's internal health endpoint. Returns false when
    /// the pod was routed to the failure path and polling should stop.
    fn probe_running_pod(
        &self,
        pod: &PodObject,
        pod_name: &str,
        bucket: &str,
        filename: &str,
    ) -> bool {
        let ip = match require_pod_ip(pod) {
            Ok(ip) => ip,
            Err(_) => return true, // no IP yet; keep polling
        };
        match self.probe.probe(ip) {
            Ok(HealthVerdict::Healthy) => true,
            Ok(HealthVerdict::Failed) => {
                self.handle_pod_failure(pod_name, bucket, filename, "internal health check Failed");
                false
            }
            Err(e) => {
                warn!("Health probe for {} errored: {}; presuming pod dead", pod_name, e);
                self.handle_pod_failure(pod_name, bucket, filename, "health probe unreachable");
                false
            }
        }
    }

    // ---- terminal outcomes ------------------------------------------------

    /// Canonical failure path. Idempotent: only the transition that
    /// actually moved the conversion entry to failed broadcasts the action.
    pub fn handle_pod_failure(&self, pod_name: &str, bucket: &str, filename: &str, reason: &str) {
        let ctx = OperationContext::new();
        match self.conversion.mark_process_failed(&ctx, filename) {
            Ok(true) => {
                if let Err(e) = self
                    .bus
                    .publish(BatchProcessFailed::new(pod_name, bucket, filename, reason))
                {
                    error!("Failed to publish BatchProcessFailed for {}: {}", pod_name, e);
                }
                error!("Pod {} failed: {}", pod_name, reason);
            }
            Ok(false) => {
                info!("Pod {} failure already recorded; skipping broadcast", pod_name);
            }
            Err(e) => {
                // Another detection route holds the entry right now; it
                // will finish the transition.
                warn!("Could not record failure of {}: {}", pod_name, e);
            }
        }

        self.remove_from_registry(pod_name);
        self.update_phase(pod_name, PodPhase::Failed);
        self.expire_snapshot_after_retention(pod_name);
        self.delete_pod_object(pod_name);
    }

    /// Success path: conversion entry, broadcast, cleanup.
    pub fn handle_pod_success(&self, pod_name: &str, bucket: &str, filename: &str) {
        let ctx = OperationContext::new();
        match self.conversion.mark_process_complete(&ctx, filename) {
            Ok(true) => {
                if let Err(e) = self
                    .bus
                    .publish(BatchProcessSucceeded::new(pod_name, bucket, filename))
                {
                    error!("Failed to publish BatchProcessSucceeded for {}: {}", pod_name, e);
                }
                info!("Pod {} succeeded for {}/{}", pod_name, bucket, filename);
            }
            Ok(false) => {
                info!("Pod {} success already recorded", pod_name);
            }
            Err(e) => {
                warn!("Could not record success of {}: {}", pod_name, e);
            }
        }

        self.remove_from_registry(pod_name);
        self.update_phase(pod_name, PodPhase::Succeeded);
        self.expire_snapshot_after_retention(pod_name);
        self.delete_pod_object(pod_name);
    }

    /// Stop tracking a pod immediately and clean up its state.
    pub fn stop_tracking(&self, pod_name: &str) {
        self.remove_from_registry(pod_name);
        self.memory
            .delete_key(MEMORY_DOMAIN_BATCH, MEMORY_SUB_POD_STATUS, pod_name);
        self.delete_pod_object(pod_name);
        info!("Stopped tracking pod {}", pod_name);
    }

    fn delete_pod_object(&self, pod_name: &str) {
        if let Err(e) = self.platform.delete_pod(pod_name, &self.config.pod_namespace) {
            warn!("Failed to delete pod object {}: {}", pod_name, e);
        }
    }

    // ---- reconciliation sweep ---------------------------------------------

    /// One reconciliation pass over the tracked-pod registry. Returns the
    /// number of pods re-registered for polling. Only one sweep runs
    /// process-wide at a time; a pass that cannot take the sweep lock is
    /// skipped.
    pub fn sweep_once(self: &Arc<Self>) -> usize {
        if !self.clearance.acquire_named(POD_SWEEP_LOCK) {
            return 0;
        }
        let reregistered = self.sweep_registry();
        self.clearance.release_named(POD_SWEEP_LOCK);
        reregistered
    }

    fn sweep_registry(self: &Arc<Self>) -> usize {
        let now = Utc::now().timestamp();
        let mut reregistered = 0;

        for pod_name in self.load_registry() {
            let Some(snapshot) = self.load_snapshot(&pod_name) else {
                // Registry entry without a snapshot carries no information
                self.remove_from_registry(&pod_name);
                continue;
            };

            if snapshot.staleness_secs(now) < self.config.liveness_window_secs {
                continue;
            }

            if snapshot.phase.is_terminal() {
                if snapshot.staleness_secs(now) > self.config.retention_secs {
                    info!("Purging terminal pod {} past retention", pod_name);
                    self.memory
                        .delete_key(MEMORY_DOMAIN_BATCH, MEMORY_SUB_POD_STATUS, &pod_name);
                    self.remove_from_registry(&pod_name);
                }
                continue;
            }

            match self.platform.get_pod(&pod_name, &self.config.pod_namespace) {
                Ok(Some(pod)) if matches!(pod.phase, PodPhase::Running | PodPhase::Pending) => {
                    info!("Re-registering stale pod {} for polling", pod_name);
                    let mut refreshed = snapshot.clone();
                    refreshed.phase = pod.phase;
                    refreshed.touch();
                    self.store_snapshot(&refreshed);
                    self.spawn_poll_thread(&pod_name, &snapshot.bucket, &snapshot.filename);
                    reregistered += 1;
                }
                Ok(Some(pod)) => {
                    self.update_phase(&pod_name, pod.phase);
                }
                Ok(None) => {
                    warn!("Stale pod {} is gone from the platform", pod_name);
                    self.handle_pod_failure(
                        &pod_name,
                        &snapshot.bucket,
                        &snapshot.filename,
                        "pod disappeared while stale",
                    );
                }
                Err(e) => {
                    // Platform hiccup; the next pass retries
                    warn!("Could not refresh stale pod {}: {}", pod_name, e);
                }
            }
        }
        reregistered
    }

    /// Spawn the background sweep loop.
    pub fn spawn_sweeper(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let tracker = Arc::clone(self);
        thread::spawn(move || {
            info!("Pod reconciliation sweeper started");
            while !tracker.shutdown.load(Ordering::SeqCst) {
                tracker.sweep_once();
                thread::sleep(tracker.config.sweep_interval());
            }
        })
    }
}
