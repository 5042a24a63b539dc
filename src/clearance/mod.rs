//! Advisory per-key operation clearance.
//!
//! Every write path checks out a (table, key) pair before mutating the
//! shared record behind it. Clearance is process-local and fail-fast: a
//! contended acquire returns false immediately instead of queuing, and the
//! caller surfaces that as a retryable infrastructure condition. Cross-
//! instance races are caught by conditional writes at the storage layer,
//! not here.

use crate::error::{CadForgeError, CadForgeResult};
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Identity of one logical operation, spanning every clearance it holds.
#[derive(Debug, Clone)]
pub struct OperationContext {
    id: Uuid,
}

impl OperationContext {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local registry of checked-out (table, key) pairs and named
/// global locks.
#[derive(Default)]
pub struct KeyClearanceRegistry {
    held: Mutex<HashMap<(String, String), Uuid>>,
    named: Mutex<HashSet<String>>,
}

impl KeyClearanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to take advisory ownership of (table, key) for the duration
    /// of the caller's logical operation. Returns false when the pair is
    /// already held; callers treat that as "cannot proceed now", never as
    /// "resource doesn't exist".
    pub fn acquire(&self, ctx: &OperationContext, table: &str, key: &str) -> CadForgeResult<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| CadForgeError::Clearance("Failed to acquire registry lock".to_string()))?;
        let pair = (table.to_string(), key.to_string());
        match held.get(&pair) {
            Some(holder) => {
                if *holder == ctx.id() {
                    warn!(
                        "Operation {} re-acquired clearance it already holds on {}/{}",
                        ctx.id(),
                        table,
                        key
                    );
                }
                Ok(false)
            }
            None => {
                held.insert(pair, ctx.id());
                Ok(true)
            }
        }
    }

    /// Release ownership of (table, key). Idempotent; a release by a
    /// non-holder is ignored so cleanup paths can always call it.
    pub fn release(&self, ctx: &OperationContext, table: &str, key: &str) {
        self.release_by_holder(ctx.id(), table, key);
    }

    fn release_by_holder(&self, holder: Uuid, table: &str, key: &str) {
        let mut held = match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pair = (table.to_string(), key.to_string());
        match held.get(&pair) {
            Some(current) if *current == holder => {
                held.remove(&pair);
            }
            Some(current) => {
                warn!(
                    "Operation {} tried to release {}/{} held by {}",
                    holder, table, key, current
                );
            }
            None => {}
        }
    }

    /// Acquire and wrap in a guard that releases on drop.
    pub fn guard(
        self: &Arc<Self>,
        ctx: &OperationContext,
        table: &str,
        key: &str,
    ) -> CadForgeResult<Option<ClearanceGuard>> {
        if self.acquire(ctx, table, key)? {
            Ok(Some(ClearanceGuard {
                registry: Arc::clone(self),
                holder: ctx.id(),
                table: table.to_string(),
                key: key.to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Whether (table, key) is currently checked out.
    pub fn is_held(&self, table: &str, key: &str) -> bool {
        match self.held.lock() {
            Ok(held) => held.contains_key(&(table.to_string(), key.to_string())),
            Err(poisoned) => poisoned
                .into_inner()
                .contains_key(&(table.to_string(), key.to_string())),
        }
    }

    /// Take a named global lock (registry-level structures). Fail-fast.
    pub fn acquire_named(&self, name: &str) -> bool {
        match self.named.lock() {
            Ok(mut named) => named.insert(name.to_string()),
            Err(_) => false,
        }
    }

    /// Release a named global lock. Idempotent.
    pub fn release_named(&self, name: &str) {
        let mut named = match self.named.lock() {
            Ok(named) => named,
            Err(poisoned) => poisoned.into_inner(),
        };
        named.remove(name);
    }
}

/// Clearance that releases itself when dropped, so early returns and error
/// paths cannot leak a held pair.
pub struct ClearanceGuard {
    registry: Arc<KeyClearanceRegistry>,
    holder: Uuid,
    table: String,
    key: String,
}

impl ClearanceGuard {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ClearanceGuard {
    fn drop(&mut self) {
        self.registry.release_by_holder(self.holder, &self.table, &self.key);
    }
}
