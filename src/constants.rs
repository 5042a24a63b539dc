//! Common constants used across the cadforge coordination services.
//!
//! Table names, reserved delimiters and lock names live here so that the
//! write side and the read side always address the same rows.

/// Index table keyed by metadata key alone.
pub const ATTR_BY_KEY_TABLE: &str = "attr_by_key";
/// Index table keyed by metadata key + canonical value set.
pub const ATTR_BY_KEY_VALUES_TABLE: &str = "attr_by_key_values";
/// Index table keyed by metadata key + owning user id.
pub const ATTR_BY_KEY_USER_TABLE: &str = "attr_by_key_user";
/// Index table keyed by metadata key + canonical value set + owning user id.
pub const ATTR_BY_KEY_VALUES_USER_TABLE: &str = "attr_by_key_values_user";

/// All four attribute index tables, in fan-out order.
pub const ATTRIBUTE_TABLES: [&str; 4] = [
    ATTR_BY_KEY_TABLE,
    ATTR_BY_KEY_VALUES_TABLE,
    ATTR_BY_KEY_USER_TABLE,
    ATTR_BY_KEY_VALUES_USER_TABLE,
];

/// Row attribute holding the locator set in every index table.
pub const LOCATOR_SET_FIELD: &str = "locators";

/// Conversion pipeline state table.
pub const FILE_CONVERSIONS_TABLE: &str = "file_conversions";
/// Long-lived worker VM state table.
pub const WORKER_VMS_TABLE: &str = "worker_vms";

/// Joins the members of a sorted value set inside a composite key.
pub const VALUE_DELIMITER: char = '\u{1f}';
/// Separates key / value-set / user segments inside a composite key.
pub const SEGMENT_DELIMITER: char = '\u{1e}';

/// Locator prefix for model-level metadata ownership.
pub const MODEL_LOCATOR_PREFIX: &str = "MM_";
/// Locator prefix for revision-level metadata ownership.
pub const REVISION_LOCATOR_PREFIX: &str = "VM_";

/// Named lock serializing tracked-pod registry mutation.
pub const POD_REGISTRY_LOCK: &str = "pod_registry";
/// Named lock ensuring a single reconciliation sweep runs at a time.
pub const POD_SWEEP_LOCK: &str = "pod_reconciliation_sweep";

/// Memory-store namespace for batch processing state.
pub const MEMORY_DOMAIN_BATCH: &str = "batch";
/// Memory-store subdomain for per-pod status snapshots.
pub const MEMORY_SUB_POD_STATUS: &str = "pod_status";
/// Memory-store subdomain for the tracked-pod registry.
pub const MEMORY_SUB_POD_REGISTRY: &str = "pod_registry";
/// Memory-store identifier for the tracked-pod name list.
pub const POD_REGISTRY_KEY: &str = "tracked";

/// Port on which conversion pods expose their internal health endpoint.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;
