//! Shared memory store collaborator.
//!
//! Keys are namespaced by a (domain, subdomain, identifier) triple and may
//! carry an expiry. The pod registry and per-pod status snapshots live here
//! so tracking state survives a service restart when a durable backend is
//! plugged in; the in-process implementation backs tests and single-node
//! deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key/value store namespaced by (domain, subdomain, identifier).
pub trait MemoryStore: Send + Sync {
    /// Fetch a value; expired entries read as absent.
    fn get_key_value(&self, domain: &str, subdomain: &str, id: &str) -> Option<String>;

    /// Store a value, clearing any previous expiry.
    fn set_key_value(&self, domain: &str, subdomain: &str, id: &str, value: &str);

    /// Remove a value.
    fn delete_key(&self, domain: &str, subdomain: &str, id: &str);

    /// Expire a key after the given duration.
    fn set_key_expire_time(&self, domain: &str, subdomain: &str, id: &str, ttl: Duration);
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process MemoryStore implementation.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespaced(domain: &str, subdomain: &str, id: &str) -> String {
        format!("{}:{}:{}", domain, subdomain, id)
    }
}

impl MemoryStore for InMemoryStore {
    fn get_key_value(&self, domain: &str, subdomain: &str, id: &str) -> Option<String> {
        let key = Self::namespaced(domain, subdomain, id);
        let mut entries = self.entries.lock().unwrap();
        let expired = match entries.get(&key) {
            Some(entry) => entry
                .expires_at
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false),
            None => return None,
        };
        if expired {
            entries.remove(&key);
            return None;
        }
        entries.get(&key).map(|entry| entry.value.clone())
    }

    fn set_key_value(&self, domain: &str, subdomain: &str, id: &str, value: &str) {
        let key = Self::namespaced(domain, subdomain, id);
        self.entries.lock().unwrap().insert(
            key,
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    fn delete_key(&self, domain: &str, subdomain: &str, id: &str) {
        let key = Self::namespaced(domain, subdomain, id);
        self.entries.lock().unwrap().remove(&key);
    }

    fn set_key_expire_time(&self, domain: &str, subdomain: &str, id: &str, ttl: Duration) {
        let key = Self::namespaced(domain, subdomain, id);
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = InMemoryStore::new();
        store.set_key_value("batch", "pod_status", "conv-1", "{}");
        assert_eq!(
            store.get_key_value("batch", "pod_status", "conv-1").as_deref(),
            Some("{}")
        );

        store.delete_key("batch", "pod_status", "conv-1");
        assert!(store.get_key_value("batch", "pod_status", "conv-1").is_none());
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let store = InMemoryStore::new();
        store.set_key_value("batch", "pod_status", "conv-1", "a");
        store.set_key_value("batch", "pod_registry", "conv-1", "b");

        assert_eq!(
            store.get_key_value("batch", "pod_status", "conv-1").as_deref(),
            Some("a")
        );
        assert_eq!(
            store.get_key_value("batch", "pod_registry", "conv-1").as_deref(),
            Some("b")
        );
    }

    #[test]
    fn test_expired_entry_reads_as_absent() {
        let store = InMemoryStore::new();
        store.set_key_value("batch", "pod_status", "conv-1", "{}");
        store.set_key_expire_time("batch", "pod_status", "conv-1", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get_key_value("batch", "pod_status", "conv-1").is_none());
    }
}
