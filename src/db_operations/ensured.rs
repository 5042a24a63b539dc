//! Delivery-ensured mutation writer.
//!
//! Callers enqueue mutations fire-and-forget; a background worker applies
//! them against the table store and retries with backoff until acknowledged
//! or the retry policy is exhausted. Exhaustion is logged and broadcast as a
//! `DeliveryExhausted` event so an out-of-band reconciler can repair the row.

use crate::config::RetryPolicy;
use crate::db_operations::DbOperations;
use crate::error::CadForgeResult;
use crate::events::{DeliveryExhausted, MessageBus};
use log::{error, info, warn};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A single database mutation applied asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put {
        table: String,
        key: String,
        value: JsonValue,
    },
    UpdateField {
        table: String,
        key: String,
        field: String,
        value: JsonValue,
    },
    Delete {
        table: String,
        key: String,
    },
    ArrayAdd {
        table: String,
        key: String,
        field: String,
        element: String,
    },
    ArrayRemove {
        table: String,
        key: String,
        field: String,
        element: String,
    },
}

impl Mutation {
    fn table(&self) -> &str {
        match self {
            Mutation::Put { table, .. }
            | Mutation::UpdateField { table, .. }
            | Mutation::Delete { table, .. }
            | Mutation::ArrayAdd { table, .. }
            | Mutation::ArrayRemove { table, .. } => table,
        }
    }

    fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. }
            | Mutation::UpdateField { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::ArrayAdd { key, .. }
            | Mutation::ArrayRemove { key, .. } => key,
        }
    }
}

/// Fire-and-forget mutation queue with a retrying background worker.
pub struct EnsuredDeliveryWriter {
    sender: Sender<Mutation>,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    _worker: Option<thread::JoinHandle<()>>,
}

impl EnsuredDeliveryWriter {
    /// Spawn the delivery worker over the given table store.
    pub fn new(db: Arc<DbOperations>, bus: Arc<MessageBus>, retry: RetryPolicy) -> Self {
        let (sender, receiver) = mpsc::channel::<Mutation>();
        let pending = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = Self::spawn_worker(
            receiver,
            db,
            bus,
            retry,
            Arc::clone(&pending),
            Arc::clone(&shutdown),
        );

        Self {
            sender,
            pending,
            shutdown,
            _worker: Some(worker),
        }
    }

    fn spawn_worker(
        receiver: Receiver<Mutation>,
        db: Arc<DbOperations>,
        bus: Arc<MessageBus>,
        retry: RetryPolicy,
        pending: Arc<AtomicUsize>,
        shutdown: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || loop {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(mutation) => {
                    Self::apply_with_retry(&db, &bus, &retry, &mutation);
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
    }

    fn apply_with_retry(
        db: &DbOperations,
        bus: &MessageBus,
        retry: &RetryPolicy,
        mutation: &Mutation,
    ) {
        let mut last_error = String::new();
        for attempt in 0..=retry.max_retries {
            match Self::apply(db, mutation) {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            "Delivered mutation to {}/{} after {} retries",
                            mutation.table(),
                            mutation.key(),
                            attempt
                        );
                    }
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "Mutation against {}/{} failed (attempt {}): {}",
                        mutation.table(),
                        mutation.key(),
                        attempt + 1,
                        last_error
                    );
                    if attempt < retry.max_retries {
                        thread::sleep(retry.delay_for(attempt));
                    }
                }
            }
        }

        error!(
            "Giving up on mutation against {}/{} after {} retries: {}",
            mutation.table(),
            mutation.key(),
            retry.max_retries,
            last_error
        );
        if let Err(e) = bus.publish(DeliveryExhausted::new(
            mutation.table(),
            mutation.key(),
            &last_error,
        )) {
            error!("Failed to publish DeliveryExhausted event: {}", e);
        }
    }

    fn apply(db: &DbOperations, mutation: &Mutation) -> CadForgeResult<()> {
        match mutation {
            Mutation::Put { table, key, value } => db.put_item(table, key, value),
            Mutation::UpdateField {
                table,
                key,
                field,
                value,
            } => db
                .update_item_field(table, key, field, value.clone(), None)
                .map(|_| ()),
            Mutation::Delete { table, key } => db.delete_item(table, key).map(|_| ()),
            Mutation::ArrayAdd {
                table,
                key,
                field,
                element,
            } => db.add_to_array_item(table, key, field, element).map(|_| ()),
            Mutation::ArrayRemove {
                table,
                key,
                field,
                element,
            } => db
                .remove_from_array_item(table, key, field, element)
                .map(|_| ()),
        }
    }

    /// Enqueue a mutation without waiting for it to be applied.
    pub fn enqueue(&self, mutation: Mutation) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(mutation).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!("Delivery worker is gone; mutation dropped");
        }
    }

    /// Enqueue an element insertion into a set-valued array attribute.
    pub fn enqueue_array_add(&self, table: &str, key: &str, field: &str, element: &str) {
        self.enqueue(Mutation::ArrayAdd {
            table: table.to_string(),
            key: key.to_string(),
            field: field.to_string(),
            element: element.to_string(),
        });
    }

    /// Enqueue an element removal from a set-valued array attribute.
    pub fn enqueue_array_remove(&self, table: &str, key: &str, field: &str, element: &str) {
        self.enqueue(Mutation::ArrayRemove {
            table: table.to_string(),
            key: key.to_string(),
            field: field.to_string(),
            element: element.to_string(),
        });
    }

    /// Enqueue a full row write.
    pub fn enqueue_put(&self, table: &str, key: &str, value: JsonValue) {
        self.enqueue(Mutation::Put {
            table: table.to_string(),
            key: key.to_string(),
            value,
        });
    }

    /// Enqueue a row deletion.
    pub fn enqueue_delete(&self, table: &str, key: &str) {
        self.enqueue(Mutation::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
    }

    /// Number of mutations accepted but not yet applied.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Block until every accepted mutation has been applied or the timeout
    /// elapses. Returns true when the queue drained.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Ask the worker to stop once the queue is drained.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for EnsuredDeliveryWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use serde_json::json;

    fn writer_env() -> (Arc<DbOperations>, EnsuredDeliveryWriter) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ops = Arc::new(DbOperations::new(db).unwrap());
        let bus = Arc::new(MessageBus::new());
        let writer = EnsuredDeliveryWriter::new(
            Arc::clone(&ops),
            bus,
            RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
        );
        (ops, writer)
    }

    #[test]
    fn test_enqueued_mutations_are_applied() {
        let (ops, writer) = writer_env();

        writer.enqueue_put("models", "m1", json!({"name": "bracket"}));
        writer.enqueue_array_add("idx", "color", "locators", "MM_m1");
        assert!(writer.wait_until_idle(Duration::from_secs(5)));

        let row: serde_json::Value = ops.get_item("models", "m1").unwrap().unwrap();
        assert_eq!(row["name"], "bracket");
        let idx: serde_json::Value = ops.get_item("idx", "color").unwrap().unwrap();
        assert_eq!(idx["locators"], json!(["MM_m1"]));
    }

    #[test]
    fn test_add_then_remove_settles_empty() {
        let (ops, writer) = writer_env();

        writer.enqueue_array_add("idx", "color", "locators", "MM_m1");
        writer.enqueue_array_remove("idx", "color", "locators", "MM_m1");
        assert!(writer.wait_until_idle(Duration::from_secs(5)));

        assert!(!ops.exists("idx", "color").unwrap());
    }
}
