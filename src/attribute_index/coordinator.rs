//! Attribute index fan-out coordinator.
//!
//! Four denormalized tables map metadata key / key+values / key+user /
//! key+values+user combinations to the set of locators carrying that
//! metadata. Lookups stay exact-match; the price is a fan-out on every
//! metadata mutation: clearance is obtained for every (table, metadata key)
//! pair in parallel, one delivery-ensured array mutation is issued per
//! (item, table), and every clearance is released once the fan-out is
//! enqueued. Consistency is eventual: individual mutation failures are
//! retried by the delivery layer, not awaited here.

use crate::attribute_index::MetadataLocator;
use crate::clearance::{KeyClearanceRegistry, OperationContext};
use crate::constants::{
    ATTRIBUTE_TABLES, ATTR_BY_KEY_TABLE, ATTR_BY_KEY_USER_TABLE, ATTR_BY_KEY_VALUES_TABLE,
    ATTR_BY_KEY_VALUES_USER_TABLE, LOCATOR_SET_FIELD, SEGMENT_DELIMITER, VALUE_DELIMITER,
};
use crate::db_operations::{DbOperations, EnsuredDeliveryWriter};
use crate::error::CadForgeResult;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

/// One metadata entry: a key and the value set attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSet {
    pub key: String,
    pub values: Vec<String>,
}

impl MetadataSet {
    pub fn new(key: &str, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Direction of an index mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Add,
    Remove,
}

/// What to do when some clearance acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionMode {
    /// Release everything already obtained and fail the whole operation.
    Abort,
    /// Proceed best-effort with whatever was obtained. Used on the stale-
    /// metadata removal path: index cleanup must never block the primary
    /// operation that triggered it. A stale row is recoverable; a model
    /// that cannot be deleted is not.
    Proceed,
}

/// Index row payload: the set of locator strings carrying the row's
/// metadata combination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexRow {
    locators: Vec<String>,
}

/// Maintains the four attribute index tables under concurrent metadata
/// add/remove operations.
pub struct AttributeIndexCoordinator {
    db: Arc<DbOperations>,
    writer: Arc<EnsuredDeliveryWriter>,
    clearance: Arc<KeyClearanceRegistry>,
}

/// Canonical form of a value set: sorted lexicographically, joined with the
/// reserved value delimiter. Add and Remove of the same logical set address
/// the same row regardless of input order.
fn canonical_values(values: &[String]) -> String {
    let mut sorted: Vec<&str> = values.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(&VALUE_DELIMITER.to_string())
}

/// Composite row key for one metadata set in one index table.
pub(crate) fn composite_key(table: &str, set: &MetadataSet, user_id: &str) -> String {
    let seg = SEGMENT_DELIMITER;
    match table {
        ATTR_BY_KEY_TABLE => set.key.clone(),
        ATTR_BY_KEY_VALUES_TABLE => format!("{}{}{}", set.key, seg, canonical_values(&set.values)),
        ATTR_BY_KEY_USER_TABLE => format!("{}{}{}", set.key, seg, user_id),
        ATTR_BY_KEY_VALUES_USER_TABLE => format!(
            "{}{}{}{}{}",
            set.key,
            seg,
            canonical_values(&set.values),
            seg,
            user_id
        ),
        other => unreachable!("not an attribute index table: {}", other),
    }
}

impl AttributeIndexCoordinator {
    pub fn new(
        db: Arc<DbOperations>,
        writer: Arc<EnsuredDeliveryWriter>,
        clearance: Arc<KeyClearanceRegistry>,
    ) -> Self {
        Self {
            db,
            writer,
            clearance,
        }
    }

    /// Apply one metadata mutation to all four index tables.
    ///
    /// Clearance is acquired for every distinct (table, metadata key) pair
    /// in parallel before any mutation is issued. In `Abort` mode a single
    /// failed acquisition releases everything and returns `Ok(false)`; in
    /// `Proceed` mode the fan-out continues with whatever was obtained.
    /// Fan-out mutations are delivery-ensured and not awaited; their
    /// failures surface through the delivery layer's retry, never here.
    pub fn add_remove_metadata_sets(
        &self,
        ctx: &OperationContext,
        user_id: &str,
        locator: &MetadataLocator,
        metadata: &[MetadataSet],
        op: IndexOp,
        mode: ContentionMode,
    ) -> CadForgeResult<bool> {
        if metadata.is_empty() {
            return Ok(true);
        }
        // Deep copy so a caller mutating its list cannot corrupt an
        // in-flight fan-out.
        let metadata: Vec<MetadataSet> = metadata.to_vec();

        // Distinct (table, metadata key) clearance pairs; duplicate keys in
        // the input would otherwise contend with themselves.
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut seen = HashSet::new();
        for set in &metadata {
            for table in ATTRIBUTE_TABLES {
                if seen.insert((table, set.key.clone())) {
                    pairs.push((table.to_string(), set.key.clone()));
                }
            }
        }

        let (obtained, denied) = self.acquire_all(ctx, &pairs);

        if !denied.is_empty() {
            match mode {
                ContentionMode::Abort => {
                    warn!(
                        "Clearance denied for {} of {} index pairs; aborting {:?} for {}",
                        denied.len(),
                        pairs.len(),
                        op,
                        locator
                    );
                    self.release_all(ctx, &obtained);
                    return Ok(false);
                }
                ContentionMode::Proceed => {
                    for (table, key) in &denied {
                        warn!(
                            "Proceeding without clearance on {}/{} for {:?} of {}",
                            table, key, op, locator
                        );
                    }
                }
            }
        }

        let element = locator.to_string();
        for set in &metadata {
            for table in ATTRIBUTE_TABLES {
                let row_key = composite_key(table, set, user_id);
                match op {
                    IndexOp::Add => {
                        self.writer
                            .enqueue_array_add(table, &row_key, LOCATOR_SET_FIELD, &element)
                    }
                    IndexOp::Remove => {
                        self.writer
                            .enqueue_array_remove(table, &row_key, LOCATOR_SET_FIELD, &element)
                    }
                }
            }
        }
        info!(
            "Enqueued {:?} fan-out for {} across {} metadata sets",
            op,
            locator,
            metadata.len()
        );

        self.release_all(ctx, &obtained);
        Ok(true)
    }

    /// Acquire clearance for every pair in parallel, joining all workers
    /// before returning. Acquisition errors count as denials.
    fn acquire_all(
        &self,
        ctx: &OperationContext,
        pairs: &[(String, String)],
    ) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let handles: Vec<_> = pairs
            .iter()
            .cloned()
            .map(|(table, key)| {
                let clearance = Arc::clone(&self.clearance);
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let granted = clearance.acquire(&ctx, &table, &key).unwrap_or(false);
                    (table, key, granted)
                })
            })
            .collect();

        let mut obtained = Vec::new();
        let mut denied = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok((table, key, true)) => obtained.push((table, key)),
                Ok((table, key, false)) => denied.push((table, key)),
                Err(_) => warn!("Clearance acquisition worker panicked"),
            }
        }
        (obtained, denied)
    }

    fn release_all(&self, ctx: &OperationContext, pairs: &[(String, String)]) {
        for (table, key) in pairs {
            self.clearance.release(ctx, table, key);
        }
    }

    /// Locators currently indexed under a metadata key.
    pub fn lookup_by_key(&self, key: &str) -> CadForgeResult<Vec<MetadataLocator>> {
        self.read_row(ATTR_BY_KEY_TABLE, &MetadataSet::new(key, &[]), "")
    }

    /// Locators indexed under a key with exactly this value set.
    pub fn lookup_by_key_values(
        &self,
        key: &str,
        values: &[String],
    ) -> CadForgeResult<Vec<MetadataLocator>> {
        let set = MetadataSet {
            key: key.to_string(),
            values: values.to_vec(),
        };
        self.read_row(ATTR_BY_KEY_VALUES_TABLE, &set, "")
    }

    /// Locators indexed under a key for one user.
    pub fn lookup_by_key_user(
        &self,
        key: &str,
        user_id: &str,
    ) -> CadForgeResult<Vec<MetadataLocator>> {
        self.read_row(ATTR_BY_KEY_USER_TABLE, &MetadataSet::new(key, &[]), user_id)
    }

    /// Locators indexed under a key with exactly this value set for one user.
    pub fn lookup_by_key_values_user(
        &self,
        key: &str,
        values: &[String],
        user_id: &str,
    ) -> CadForgeResult<Vec<MetadataLocator>> {
        let set = MetadataSet {
            key: key.to_string(),
            values: values.to_vec(),
        };
        self.read_row(ATTR_BY_KEY_VALUES_USER_TABLE, &set, user_id)
    }

    fn read_row(
        &self,
        table: &str,
        set: &MetadataSet,
        user_id: &str,
    ) -> CadForgeResult<Vec<MetadataLocator>> {
        let row_key = composite_key(table, set, user_id);
        let row: Option<IndexRow> = self.db.get_item(table, &row_key)?;
        match row {
            Some(row) => row.locators.iter().map(|s| s.parse()).collect(),
            None => Ok(Vec::new()),
        }
    }
}
