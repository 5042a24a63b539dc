//! Consolidated testing utilities: mock collaborators and environment
//! factories shared by unit and integration tests.

use crate::batch::conversion::ConversionStore;
use crate::batch::platform::{
    ContainerPlatform, FileStore, HealthVerdict, PodHealthProbe, ServiceEndpoint,
};
use crate::batch::tracker::PodLifecycleTracker;
use crate::batch::types::{PodObject, PodPhase, PodSpec};
use crate::clearance::KeyClearanceRegistry;
use crate::config::{CoordinationConfig, RetryPolicy};
use crate::db_operations::{DbOperations, EnsuredDeliveryWriter, InMemoryStore, MemoryStore};
use crate::error::CadForgeResult;
use crate::events::MessageBus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory orchestration platform recording every call.
#[derive(Default)]
pub struct MockPlatform {
    pods: Mutex<HashMap<String, PodObject>>,
    created: Mutex<Vec<PodSpec>>,
    deleted: Mutex<Vec<String>>,
    services: Mutex<Vec<ServiceEndpoint>>,
    pod_queries: AtomicUsize,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the platform with an existing pod.
    pub fn put_pod(&self, pod: PodObject) {
        self.pods.lock().unwrap().insert(pod.name.clone(), pod);
    }

    /// Change the phase of a seeded pod.
    pub fn set_phase(&self, name: &str, phase: PodPhase) {
        if let Some(pod) = self.pods.lock().unwrap().get_mut(name) {
            pod.phase = phase;
        }
    }

    /// Remove a pod as if the platform lost it.
    pub fn drop_pod(&self, name: &str) {
        self.pods.lock().unwrap().remove(name);
    }

    pub fn set_services(&self, services: Vec<ServiceEndpoint>) {
        *self.services.lock().unwrap() = services;
    }

    pub fn created_specs(&self) -> Vec<PodSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Number of `get_pod` calls served so far.
    pub fn pod_query_count(&self) -> usize {
        self.pod_queries.load(Ordering::SeqCst)
    }
}

impl ContainerPlatform for MockPlatform {
    fn create_pod(&self, spec: &PodSpec) -> CadForgeResult<()> {
        self.created.lock().unwrap().push(spec.clone());
        self.pods.lock().unwrap().insert(
            spec.name.clone(),
            PodObject {
                name: spec.name.clone(),
                phase: PodPhase::Pending,
                ip: None,
                container_exit_codes: Vec::new(),
            },
        );
        Ok(())
    }

    fn get_pod(&self, name: &str, _namespace: &str) -> CadForgeResult<Option<PodObject>> {
        self.pod_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.pods.lock().unwrap().get(name).cloned())
    }

    fn delete_pod(&self, name: &str, _namespace: &str) -> CadForgeResult<bool> {
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(self.pods.lock().unwrap().remove(name).is_some())
    }

    fn list_services(&self) -> CadForgeResult<Vec<ServiceEndpoint>> {
        Ok(self.services.lock().unwrap().clone())
    }
}

/// File store returning predictable signed URLs.
#[derive(Default)]
pub struct MockFileStore;

impl FileStore for MockFileStore {
    fn signed_download_url(&self, bucket: &str, key: &str) -> CadForgeResult<String> {
        Ok(format!("https://files.test/{}/{}?sig=download", bucket, key))
    }

    fn signed_upload_url(&self, bucket: &str, key: &str) -> CadForgeResult<String> {
        Ok(format!("https://files.test/{}/{}?sig=upload", bucket, key))
    }
}

/// Health probe returning a configurable verdict.
pub struct MockProbe {
    verdict: Mutex<HealthVerdict>,
}

impl MockProbe {
    pub fn healthy() -> Self {
        Self {
            verdict: Mutex::new(HealthVerdict::Healthy),
        }
    }

    pub fn set_verdict(&self, verdict: HealthVerdict) {
        *self.verdict.lock().unwrap() = verdict;
    }
}

impl PodHealthProbe for MockProbe {
    fn probe(&self, _ip: &str) -> CadForgeResult<HealthVerdict> {
        Ok(*self.verdict.lock().unwrap())
    }
}

/// Everything a batch-layer test needs, wired together.
pub struct BatchTestEnvironment {
    pub db: Arc<DbOperations>,
    pub bus: Arc<MessageBus>,
    pub clearance: Arc<KeyClearanceRegistry>,
    pub memory: Arc<InMemoryStore>,
    pub platform: Arc<MockPlatform>,
    pub probe: Arc<MockProbe>,
    pub conversion: Arc<ConversionStore>,
    pub tracker: Arc<PodLifecycleTracker>,
    pub config: CoordinationConfig,
}

/// Initialize env_logger once for test output. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Factory for temporary databases and fully wired test environments.
pub struct TestEnvironmentFactory;

impl TestEnvironmentFactory {
    /// Create a temporary sled-backed DbOperations.
    pub fn create_temp_db_ops() -> Arc<DbOperations> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("Failed to open temporary database");
        Arc::new(DbOperations::new(db).expect("Failed to create DbOperations"))
    }

    /// Fast retry policy so tests never sleep long.
    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    /// Coordination config with millisecond-scale loops for tests.
    pub fn fast_config() -> CoordinationConfig {
        CoordinationConfig {
            pending_poll_attempts: 3,
            poll_interval_ms: 10,
            sweep_interval_ms: 20,
            ingress_poll_attempts: 3,
            ingress_poll_interval_ms: 5,
            delivery_retry: Self::fast_retry(),
            ..CoordinationConfig::default()
        }
    }

    /// Delivery writer over a fresh temporary database.
    pub fn create_writer(
        db: &Arc<DbOperations>,
        bus: &Arc<MessageBus>,
    ) -> Arc<EnsuredDeliveryWriter> {
        Arc::new(EnsuredDeliveryWriter::new(
            Arc::clone(db),
            Arc::clone(bus),
            Self::fast_retry(),
        ))
    }

    /// Fully wired batch environment with mock collaborators.
    pub fn create_batch_environment() -> BatchTestEnvironment {
        Self::create_batch_environment_with(Self::fast_config())
    }

    /// Batch environment with a caller-tuned config.
    pub fn create_batch_environment_with(config: CoordinationConfig) -> BatchTestEnvironment {
        init_test_logging();
        let db = Self::create_temp_db_ops();
        let bus = Arc::new(MessageBus::new());
        let clearance = Arc::new(KeyClearanceRegistry::new());
        let memory = Arc::new(InMemoryStore::new());
        let platform = Arc::new(MockPlatform::new());
        let probe = Arc::new(MockProbe::healthy());
        let conversion = Arc::new(ConversionStore::new(
            Arc::clone(&db),
            Arc::clone(&clearance),
        ));
        let tracker = Arc::new(PodLifecycleTracker::new(
            Arc::clone(&platform) as Arc<dyn ContainerPlatform>,
            Arc::clone(&probe) as Arc<dyn PodHealthProbe>,
            Arc::clone(&memory) as Arc<dyn MemoryStore>,
            Arc::clone(&conversion),
            Arc::clone(&bus),
            Arc::clone(&clearance),
            config.clone(),
        ));

        BatchTestEnvironment {
            db,
            bus,
            clearance,
            memory,
            platform,
            probe,
            conversion,
            tracker,
            config,
        }
    }
}
