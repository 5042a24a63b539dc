//! End-to-end attribute index flow: metadata added for a model becomes
//! visible through every lookup shape and disappears again after removal.

use cadforge::attribute_index::AttributeIndexCoordinator;
use cadforge::clearance::{KeyClearanceRegistry, OperationContext};
use cadforge::db_operations::EnsuredDeliveryWriter;
use cadforge::testing_utils::TestEnvironmentFactory;
use cadforge::{ContentionMode, IndexOp, MessageBus, MetadataLocator, MetadataSet};
use std::sync::Arc;
use std::time::Duration;

fn index_env() -> (Arc<EnsuredDeliveryWriter>, AttributeIndexCoordinator) {
    let db = TestEnvironmentFactory::create_temp_db_ops();
    let bus = Arc::new(MessageBus::new());
    let writer = TestEnvironmentFactory::create_writer(&db, &bus);
    let clearance = Arc::new(KeyClearanceRegistry::new());
    let coordinator = AttributeIndexCoordinator::new(db, Arc::clone(&writer), clearance);
    (writer, coordinator)
}

#[test]
fn test_added_metadata_is_visible_through_every_lookup() {
    let (writer, coordinator) = index_env();
    let ctx = OperationContext::new();
    let locator = MetadataLocator::model("model123");
    let metadata = [MetadataSet::new("material", &["steel", "aluminum"])];

    assert!(coordinator
        .add_remove_metadata_sets(
            &ctx,
            "user9",
            &locator,
            &metadata,
            IndexOp::Add,
            ContentionMode::Abort,
        )
        .unwrap());
    assert!(writer.wait_until_idle(Duration::from_secs(5)));

    let values = vec!["aluminum".to_string(), "steel".to_string()];
    assert_eq!(coordinator.lookup_by_key("material").unwrap(), vec![locator.clone()]);
    assert_eq!(
        coordinator.lookup_by_key_values("material", &values).unwrap(),
        vec![locator.clone()]
    );
    assert_eq!(
        coordinator.lookup_by_key_user("material", "user9").unwrap(),
        vec![locator.clone()]
    );
    assert_eq!(
        coordinator
            .lookup_by_key_values_user("material", &values, "user9")
            .unwrap(),
        vec![locator]
    );

    // A different user or value set addresses different rows
    assert!(coordinator
        .lookup_by_key_user("material", "someone-else")
        .unwrap()
        .is_empty());
    assert!(coordinator
        .lookup_by_key_values("material", &["steel".to_string()])
        .unwrap()
        .is_empty());
}

#[test]
fn test_removal_clears_every_lookup() {
    let (writer, coordinator) = index_env();
    let ctx = OperationContext::new();
    let locator = MetadataLocator::model("model123");
    let metadata = [MetadataSet::new("material", &["steel"])];

    coordinator
        .add_remove_metadata_sets(
            &ctx,
            "user9",
            &locator,
            &metadata,
            IndexOp::Add,
            ContentionMode::Abort,
        )
        .unwrap();
    assert!(writer.wait_until_idle(Duration::from_secs(5)));
    assert_eq!(coordinator.lookup_by_key("material").unwrap().len(), 1);

    coordinator
        .add_remove_metadata_sets(
            &ctx,
            "user9",
            &locator,
            &metadata,
            IndexOp::Remove,
            ContentionMode::Abort,
        )
        .unwrap();
    assert!(writer.wait_until_idle(Duration::from_secs(5)));

    let values = vec!["steel".to_string()];
    assert!(coordinator.lookup_by_key("material").unwrap().is_empty());
    assert!(coordinator
        .lookup_by_key_values("material", &values)
        .unwrap()
        .is_empty());
    assert!(coordinator
        .lookup_by_key_user("material", "user9")
        .unwrap()
        .is_empty());
    assert!(coordinator
        .lookup_by_key_values_user("material", &values, "user9")
        .unwrap()
        .is_empty());
}

#[test]
fn test_revision_and_model_locators_share_rows_without_colliding() {
    let (writer, coordinator) = index_env();
    let ctx = OperationContext::new();
    let model = MetadataLocator::model("model123");
    let revision = MetadataLocator::revision("model123", 2, "node7");
    let metadata = [MetadataSet::new("material", &["steel"])];

    for locator in [&model, &revision] {
        coordinator
            .add_remove_metadata_sets(
                &ctx,
                "user9",
                locator,
                &metadata,
                IndexOp::Add,
                ContentionMode::Abort,
            )
            .unwrap();
    }
    assert!(writer.wait_until_idle(Duration::from_secs(5)));

    let mut found = coordinator.lookup_by_key("material").unwrap();
    found.sort_by_key(|l| l.to_string());
    let mut expected = vec![model.clone(), revision.clone()];
    expected.sort_by_key(|l| l.to_string());
    assert_eq!(found, expected);

    // Removing the revision leaves the model entry intact
    coordinator
        .add_remove_metadata_sets(
            &ctx,
            "user9",
            &revision,
            &metadata,
            IndexOp::Remove,
            ContentionMode::Abort,
        )
        .unwrap();
    assert!(writer.wait_until_idle(Duration::from_secs(5)));
    assert_eq!(coordinator.lookup_by_key("material").unwrap(), vec![model]);
}

#[test]
fn test_fanout_is_idempotent_for_repeated_adds() {
    let (writer, coordinator) = index_env();
    let ctx = OperationContext::new();
    let locator = MetadataLocator::model("model123");
    let metadata = [MetadataSet::new("material", &["steel"])];

    for _ in 0..3 {
        coordinator
            .add_remove_metadata_sets(
                &ctx,
                "user9",
                &locator,
                &metadata,
                IndexOp::Add,
                ContentionMode::Abort,
            )
            .unwrap();
    }
    assert!(writer.wait_until_idle(Duration::from_secs(5)));

    // Set semantics: three adds, one entry
    assert_eq!(coordinator.lookup_by_key("material").unwrap(), vec![locator]);
}
