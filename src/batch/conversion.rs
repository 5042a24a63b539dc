//! Conversion pipeline and worker VM state.
//!
//! Both the HTTP-triggered "start process" path and the pod tracking loops
//! mutate these rows, so every transition runs under clearance and is
//! idempotent: re-applying a transition the row already reflects reports
//! "unchanged" instead of failing, which is what lets several failure
//! detection routes call the same path safely.

use crate::batch::types::{ConversionStatus, FileConversionEntry, WorkerVmEntry, WorkerVmStatus};
use crate::clearance::{KeyClearanceRegistry, OperationContext};
use crate::constants::{FILE_CONVERSIONS_TABLE, WORKER_VMS_TABLE};
use crate::db_operations::DbOperations;
use crate::error::{CadForgeError, CadForgeResult};
use chrono::Utc;
use log::info;
use std::sync::Arc;

/// Percent-encode a raw-file relative path into a stable row key.
pub fn encode_file_key(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Clearance-guarded store for conversion entries and worker VM records.
pub struct ConversionStore {
    db: Arc<DbOperations>,
    clearance: Arc<KeyClearanceRegistry>,
}

impl ConversionStore {
    pub fn new(db: Arc<DbOperations>, clearance: Arc<KeyClearanceRegistry>) -> Self {
        Self { db, clearance }
    }

    /// Fetch a conversion entry by raw path.
    pub fn get_entry(&self, raw_path: &str) -> CadForgeResult<Option<FileConversionEntry>> {
        let key = encode_file_key(raw_path);
        self.db.get_item(FILE_CONVERSIONS_TABLE, &key)
    }

    /// Create the entry in `Queued` state if it does not exist yet.
    pub fn ensure_queued(&self, ctx: &OperationContext, raw_path: &str) -> CadForgeResult<()> {
        let key = encode_file_key(raw_path);
        let _guard = self.acquire(ctx, &key)?;
        if self.db.exists(FILE_CONVERSIONS_TABLE, &key)? {
            return Ok(());
        }
        let entry = FileConversionEntry::new(&key, "queued", ConversionStatus::Queued);
        self.db.put_item(FILE_CONVERSIONS_TABLE, &key, &entry)
    }

    /// Mark a conversion as in-flight.
    pub fn mark_processing(&self, ctx: &OperationContext, raw_path: &str) -> CadForgeResult<bool> {
        self.transition(ctx, raw_path, "process", ConversionStatus::Processing)
    }

    /// Mark a conversion as failed. Idempotent: returns false when the
    /// entry is already in `ProcessFailed`.
    pub fn mark_process_failed(
        &self,
        ctx: &OperationContext,
        raw_path: &str,
    ) -> CadForgeResult<bool> {
        self.transition(ctx, raw_path, "process", ConversionStatus::ProcessFailed)
    }

    /// Mark a conversion as complete. Idempotent like the failure path.
    pub fn mark_process_complete(
        &self,
        ctx: &OperationContext,
        raw_path: &str,
    ) -> CadForgeResult<bool> {
        self.transition(ctx, raw_path, "process", ConversionStatus::ProcessComplete)
    }

    fn transition(
        &self,
        ctx: &OperationContext,
        raw_path: &str,
        stage: &str,
        status: ConversionStatus,
    ) -> CadForgeResult<bool> {
        let key = encode_file_key(raw_path);
        let _guard = self.acquire(ctx, &key)?;

        let mut entry = self
            .db
            .get_item::<FileConversionEntry>(FILE_CONVERSIONS_TABLE, &key)?
            .unwrap_or_else(|| FileConversionEntry::new(&key, stage, ConversionStatus::Queued));

        if entry.status == status {
            return Ok(false);
        }

        entry.stage = stage.to_string();
        entry.status = status;
        entry.updated_at = Utc::now().timestamp();
        self.db.put_item(FILE_CONVERSIONS_TABLE, &key, &entry)?;
        info!("Conversion entry {} moved to {:?}", key, status);
        Ok(true)
    }

    /// Register a worker VM as available.
    pub fn register_worker(&self, ctx: &OperationContext, vm_id: &str) -> CadForgeResult<()> {
        let _guard = self.acquire_vm(ctx, vm_id)?;
        if self.db.exists(WORKER_VMS_TABLE, vm_id)? {
            return Ok(());
        }
        self.db
            .put_item(WORKER_VMS_TABLE, vm_id, &WorkerVmEntry::new(vm_id))
    }

    /// Assign a process to an available worker. Returns false when the
    /// worker is busy or stopped.
    pub fn assign_worker(
        &self,
        ctx: &OperationContext,
        vm_id: &str,
        process_id: &str,
    ) -> CadForgeResult<bool> {
        let _guard = self.acquire_vm(ctx, vm_id)?;
        let mut entry = self.require_vm(vm_id)?;
        if entry.status != WorkerVmStatus::Available {
            return Ok(false);
        }
        entry.status = WorkerVmStatus::Busy;
        entry.assigned_process = Some(process_id.to_string());
        entry.updated_at = Utc::now().timestamp();
        self.db.put_item(WORKER_VMS_TABLE, vm_id, &entry)?;
        Ok(true)
    }

    /// Release a worker after its assigned process completed.
    pub fn complete_worker(&self, ctx: &OperationContext, vm_id: &str) -> CadForgeResult<bool> {
        let _guard = self.acquire_vm(ctx, vm_id)?;
        let mut entry = self.require_vm(vm_id)?;
        if entry.status != WorkerVmStatus::Busy {
            return Ok(false);
        }
        entry.status = WorkerVmStatus::Available;
        entry.assigned_process = None;
        entry.updated_at = Utc::now().timestamp();
        self.db.put_item(WORKER_VMS_TABLE, vm_id, &entry)?;
        Ok(true)
    }

    /// Take a worker out of rotation.
    pub fn stop_worker(&self, ctx: &OperationContext, vm_id: &str) -> CadForgeResult<bool> {
        let _guard = self.acquire_vm(ctx, vm_id)?;
        let mut entry = self.require_vm(vm_id)?;
        if entry.status == WorkerVmStatus::Stopped {
            return Ok(false);
        }
        entry.status = WorkerVmStatus::Stopped;
        entry.assigned_process = None;
        entry.updated_at = Utc::now().timestamp();
        self.db.put_item(WORKER_VMS_TABLE, vm_id, &entry)?;
        Ok(true)
    }

    /// Fetch a worker VM record.
    pub fn get_worker(&self, vm_id: &str) -> CadForgeResult<Option<WorkerVmEntry>> {
        self.db.get_item(WORKER_VMS_TABLE, vm_id)
    }

    fn acquire(
        &self,
        ctx: &OperationContext,
        key: &str,
    ) -> CadForgeResult<crate::clearance::ClearanceGuard> {
        self.clearance
            .guard(ctx, FILE_CONVERSIONS_TABLE, key)?
            .ok_or_else(|| {
                CadForgeError::Clearance(format!(
                    "Conversion entry {} is held by another operation",
                    key
                ))
            })
    }

    fn acquire_vm(
        &self,
        ctx: &OperationContext,
        vm_id: &str,
    ) -> CadForgeResult<crate::clearance::ClearanceGuard> {
        self.clearance
            .guard(ctx, WORKER_VMS_TABLE, vm_id)?
            .ok_or_else(|| {
                CadForgeError::Clearance(format!(
                    "Worker VM {} is held by another operation",
                    vm_id
                ))
            })
    }

    fn require_vm(&self, vm_id: &str) -> CadForgeResult<WorkerVmEntry> {
        self.db
            .get_item::<WorkerVmEntry>(WORKER_VMS_TABLE, vm_id)?
            .ok_or_else(|| CadForgeError::Batch(format!("Unknown worker VM: {}", vm_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_env() -> (Arc<KeyClearanceRegistry>, ConversionStore) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ops = Arc::new(DbOperations::new(db).unwrap());
        let clearance = Arc::new(KeyClearanceRegistry::new());
        let store = ConversionStore::new(ops, Arc::clone(&clearance));
        (clearance, store)
    }

    #[test]
    fn test_encode_file_key_is_stable_and_escapes() {
        assert_eq!(encode_file_key("parts/gear v2.step"), "parts%2Fgear%20v2.step");
        assert_eq!(encode_file_key("gear.step"), "gear.step");
    }

    #[test]
    fn test_failure_transition_is_idempotent() {
        let (_clearance, store) = store_env();
        let ctx = OperationContext::new();

        store.ensure_queued(&ctx, "parts/gear.step").unwrap();
        assert!(store.mark_process_failed(&ctx, "parts/gear.step").unwrap());
        // Second invocation leaves the entry untouched
        assert!(!store.mark_process_failed(&ctx, "parts/gear.step").unwrap());

        let entry = store.get_entry("parts/gear.step").unwrap().unwrap();
        assert_eq!(entry.status, ConversionStatus::ProcessFailed);
    }

    #[test]
    fn test_transition_fails_under_contention() {
        let (clearance, store) = store_env();
        let blocker = OperationContext::new();
        let key = encode_file_key("gear.step");
        assert!(clearance
            .acquire(&blocker, FILE_CONVERSIONS_TABLE, &key)
            .unwrap());

        let ctx = OperationContext::new();
        let result = store.mark_processing(&ctx, "gear.step");
        assert!(matches!(result, Err(CadForgeError::Clearance(_))));
    }

    #[test]
    fn test_worker_assignment_lifecycle() {
        let (_clearance, store) = store_env();
        let ctx = OperationContext::new();

        store.register_worker(&ctx, "vm-1").unwrap();
        assert!(store.assign_worker(&ctx, "vm-1", "job-42").unwrap());
        // Busy workers reject a second assignment
        assert!(!store.assign_worker(&ctx, "vm-1", "job-43").unwrap());

        let entry = store.get_worker("vm-1").unwrap().unwrap();
        assert_eq!(entry.assigned_process.as_deref(), Some("job-42"));

        assert!(store.complete_worker(&ctx, "vm-1").unwrap());
        assert!(store.assign_worker(&ctx, "vm-1", "job-43").unwrap());

        assert!(store.stop_worker(&ctx, "vm-1").unwrap());
        assert!(!store.assign_worker(&ctx, "vm-1", "job-44").unwrap());
    }
}
