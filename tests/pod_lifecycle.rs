//! Pod lifecycle integration: creation idempotence, the canonical failure
//! path and the reconciliation sweep.

use cadforge::batch::conversion_pod_name;
use cadforge::batch::platform::{FileStore, ServiceEndpoint};
use cadforge::batch::types::{PodObject, PodPhase, PodStatusSnapshot, PodType};
use cadforge::batch::BatchCreationOrchestrator;
use cadforge::constants::{
    MEMORY_DOMAIN_BATCH, MEMORY_SUB_POD_REGISTRY, MEMORY_SUB_POD_STATUS, POD_REGISTRY_KEY,
};
use cadforge::events::{BatchProcessFailed, BatchProcessSucceeded};
use cadforge::testing_utils::{BatchTestEnvironment, MockFileStore, TestEnvironmentFactory};
use cadforge::{ConversionStatus, MemoryStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Seed a tracked pod directly through the memory store, bypassing the
/// polling threads, so sweep behavior can be tested in isolation.
fn seed_tracked_pod(
    env: &BatchTestEnvironment,
    pod_name: &str,
    phase: PodPhase,
    staleness_secs: i64,
) {
    let mut snapshot =
        PodStatusSnapshot::new(pod_name, PodType::Process, "models", "gear.step", None);
    snapshot.phase = phase;
    snapshot.last_update = Utc::now().timestamp() - staleness_secs;
    env.memory.set_key_value(
        MEMORY_DOMAIN_BATCH,
        MEMORY_SUB_POD_STATUS,
        pod_name,
        &serde_json::to_string(&snapshot).unwrap(),
    );
    env.memory.set_key_value(
        MEMORY_DOMAIN_BATCH,
        MEMORY_SUB_POD_REGISTRY,
        POD_REGISTRY_KEY,
        &serde_json::to_string(&vec![pod_name.to_string()]).unwrap(),
    );
}

fn orchestrator(env: &BatchTestEnvironment) -> BatchCreationOrchestrator {
    env.platform.set_services(vec![ServiceEndpoint {
        name: "gateway".to_string(),
        ingress: Some("https://ingress.test".to_string()),
    }]);
    let orchestrator = BatchCreationOrchestrator::new(
        Arc::clone(&env.platform) as Arc<dyn cadforge::ContainerPlatform>,
        Arc::new(MockFileStore) as Arc<dyn FileStore>,
        Arc::clone(&env.tracker),
        Arc::clone(&env.conversion),
        env.config.clone(),
    );
    assert!(orchestrator.initialize(&|msg| panic!("fatal: {}", msg)));
    orchestrator
}

#[test]
fn test_start_is_idempotent_for_the_same_file() {
    let env = TestEnvironmentFactory::create_batch_environment();
    let orchestrator = orchestrator(&env);

    let first = orchestrator
        .start_batch_process("models", "gear.step", None)
        .unwrap();
    let second = orchestrator
        .start_batch_process("models", "gear.step", None)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first, conversion_pod_name("models", "gear.step"));
    // Only one pod was ever created
    assert_eq!(env.platform.created_specs().len(), 1);

    env.tracker.shutdown();
}

#[test]
fn test_created_pod_carries_source_and_upload_urls() {
    let env = TestEnvironmentFactory::create_batch_environment();
    let orchestrator = orchestrator(&env);

    orchestrator
        .start_batch_process("models", "gear.step", Some("assembly.zip"))
        .unwrap();

    let specs = env.platform.created_specs();
    let environment = &specs[0].environment;
    assert_eq!(
        environment.get("PLATFORM_INGRESS").map(String::as_str),
        Some("https://ingress.test")
    );
    assert_eq!(
        environment.get("SOURCE_BUCKET").map(String::as_str),
        Some("models")
    );
    assert_eq!(
        environment.get("ZIP_ASSEMBLY").map(String::as_str),
        Some("assembly.zip")
    );
    assert!(environment.contains_key("SOURCE_URL"));
    for kind in ["GLB", "USDZ", "THUMBNAIL", "HIERARCHY", "MATERIALS", "REPORT"] {
        assert!(
            environment.contains_key(&format!("UPLOAD_URL_{}", kind)),
            "missing upload url for {}",
            kind
        );
    }

    env.tracker.shutdown();
}

#[test]
fn test_failed_container_routes_through_canonical_failure_path_once() {
    let env = TestEnvironmentFactory::create_batch_environment();
    let mut failures = env.bus.subscribe::<BatchProcessFailed>();

    let pod_name = conversion_pod_name("models", "gear.step");
    env.platform.put_pod(PodObject {
        name: pod_name.clone(),
        phase: PodPhase::Running,
        ip: None,
        container_exit_codes: vec![0, 2],
    });
    assert!(env
        .tracker
        .register_new_pod(&pod_name, PodType::Process, "models", "gear.step", None));

    let event = failures
        .recv_timeout(Duration::from_secs(5))
        .expect("failure action was never broadcast");
    assert_eq!(event.pod_name, pod_name);
    assert_eq!(event.filename, "gear.step");

    // The conversion entry reached the failed state and the pod is gone
    let entry = env.conversion.get_entry("gear.step").unwrap().unwrap();
    assert_eq!(entry.status, ConversionStatus::ProcessFailed);
    assert!(env.platform.deleted_names().contains(&pod_name));

    // The snapshot stays readable inside the retention window
    let snapshot = env.tracker.pod_snapshot(&pod_name).unwrap();
    assert_eq!(snapshot.phase, PodPhase::Failed);

    // A second report of the same failure does not broadcast again
    env.tracker
        .handle_pod_failure(&pod_name, "models", "gear.step", "duplicate report");
    assert!(failures.recv_timeout(Duration::from_millis(100)).is_err());

    env.tracker.shutdown();
}

#[test]
fn test_succeeded_pod_broadcasts_and_cleans_up() {
    let env = TestEnvironmentFactory::create_batch_environment();
    let mut successes = env.bus.subscribe::<BatchProcessSucceeded>();

    let pod_name = conversion_pod_name("models", "gear.step");
    env.platform.put_pod(PodObject {
        name: pod_name.clone(),
        phase: PodPhase::Succeeded,
        ip: None,
        container_exit_codes: vec![0],
    });
    assert!(env
        .tracker
        .register_new_pod(&pod_name, PodType::Process, "models", "gear.step", None));

    let event = successes
        .recv_timeout(Duration::from_secs(5))
        .expect("success action was never broadcast");
    assert_eq!(event.pod_name, pod_name);

    let entry = env.conversion.get_entry("gear.step").unwrap().unwrap();
    assert_eq!(entry.status, ConversionStatus::ProcessComplete);
    assert!(!env.tracker.tracked_pods().contains(&pod_name));

    env.tracker.shutdown();
}

#[test]
fn test_succeeded_snapshot_expires_after_retention() {
    let mut config = TestEnvironmentFactory::fast_config();
    config.retention_secs = 0;
    let env = TestEnvironmentFactory::create_batch_environment_with(config);
    let mut successes = env.bus.subscribe::<BatchProcessSucceeded>();

    let pod_name = conversion_pod_name("models", "gear.step");
    env.platform.put_pod(PodObject {
        name: pod_name.clone(),
        phase: PodPhase::Succeeded,
        ip: None,
        container_exit_codes: vec![0],
    });
    assert!(env
        .tracker
        .register_new_pod(&pod_name, PodType::Process, "models", "gear.step", None));
    successes
        .recv_timeout(Duration::from_secs(5))
        .expect("success action was never broadcast");

    // With a zero retention window the snapshot expires right away
    std::thread::sleep(Duration::from_millis(50));
    assert!(env.tracker.pod_snapshot(&pod_name).is_none());
    assert!(!env.tracker.tracked_pods().contains(&pod_name));

    env.tracker.shutdown();
}

#[test]
fn test_failed_snapshot_expires_after_retention() {
    let mut config = TestEnvironmentFactory::fast_config();
    config.retention_secs = 0;
    let env = TestEnvironmentFactory::create_batch_environment_with(config);
    let mut failures = env.bus.subscribe::<BatchProcessFailed>();

    let pod_name = conversion_pod_name("models", "gear.step");
    env.platform.put_pod(PodObject {
        name: pod_name.clone(),
        phase: PodPhase::Running,
        ip: None,
        container_exit_codes: vec![2],
    });
    assert!(env
        .tracker
        .register_new_pod(&pod_name, PodType::Process, "models", "gear.step", None));
    failures
        .recv_timeout(Duration::from_secs(5))
        .expect("failure action was never broadcast");

    std::thread::sleep(Duration::from_millis(50));
    assert!(env.tracker.pod_snapshot(&pod_name).is_none());

    env.tracker.shutdown();
}

#[test]
fn test_pending_pod_polling_stops_after_bounded_refresh() {
    let env = TestEnvironmentFactory::create_batch_environment();

    let pod_name = conversion_pod_name("models", "gear.step");
    env.platform.put_pod(PodObject {
        name: pod_name.clone(),
        phase: PodPhase::Pending,
        ip: None,
        container_exit_codes: Vec::new(),
    });
    assert!(env
        .tracker
        .register_new_pod(&pod_name, PodType::Process, "models", "gear.step", None));

    // Let the bounded refresh loop run its course
    std::thread::sleep(Duration::from_millis(300));
    let settled = env.platform.pod_query_count();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(env.platform.pod_query_count(), settled);

    // The pod stays tracked; the reconciliation sweep owns it from here
    assert!(env.tracker.tracked_pods().contains(&pod_name));
    assert_eq!(
        env.tracker.pod_snapshot(&pod_name).unwrap().phase,
        PodPhase::Pending
    );

    env.tracker.shutdown();
}

#[test]
fn test_sweep_reregisters_a_stale_running_pod_exactly_once() {
    let env = TestEnvironmentFactory::create_batch_environment();

    let pod_name = conversion_pod_name("models", "gear.step");
    seed_tracked_pod(&env, &pod_name, PodPhase::Running, 120);
    env.platform.put_pod(PodObject {
        name: pod_name.clone(),
        phase: PodPhase::Running,
        ip: None,
        container_exit_codes: Vec::new(),
    });

    assert_eq!(env.tracker.sweep_once(), 1);
    // The re-registration refreshed the snapshot, so the next pass skips it
    assert_eq!(env.tracker.sweep_once(), 0);

    let snapshot = env.tracker.pod_snapshot(&pod_name).unwrap();
    assert!(snapshot.staleness_secs(Utc::now().timestamp()) < 60);

    env.tracker.shutdown();
}

#[test]
fn test_sweep_purges_terminal_pods_only_past_retention() {
    let env = TestEnvironmentFactory::create_batch_environment();

    let pod_name = conversion_pod_name("models", "gear.step");

    // Terminal for ten minutes: kept
    seed_tracked_pod(&env, &pod_name, PodPhase::Failed, 600);
    env.tracker.sweep_once();
    assert!(env.tracker.pod_snapshot(&pod_name).is_some());

    // Terminal past the one-hour retention: purged
    seed_tracked_pod(&env, &pod_name, PodPhase::Failed, 4000);
    env.tracker.sweep_once();
    assert!(env.tracker.pod_snapshot(&pod_name).is_none());
    assert!(env.tracker.tracked_pods().is_empty());

    env.tracker.shutdown();
}

#[test]
fn test_sweep_fails_a_stale_pod_missing_from_the_platform() {
    let env = TestEnvironmentFactory::create_batch_environment();
    let mut failures = env.bus.subscribe::<BatchProcessFailed>();

    let pod_name = conversion_pod_name("models", "gear.step");
    seed_tracked_pod(&env, &pod_name, PodPhase::Running, 120);
    // No pod seeded on the platform: it vanished

    env.tracker.sweep_once();

    let event = failures
        .recv_timeout(Duration::from_secs(5))
        .expect("disappearance was not routed to the failure path");
    assert_eq!(event.pod_name, pod_name);
    assert!(!env.tracker.tracked_pods().contains(&pod_name));

    env.tracker.shutdown();
}
