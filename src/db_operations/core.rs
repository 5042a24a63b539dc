//! Sled-backed table store.
//!
//! One sled tree per logical table, opened lazily and cached. Rows are JSON
//! objects. Conditional field updates are the storage-level backstop for the
//! advisory, process-local clearance registry: clearance serializes logical
//! operations inside one process, the attribute-exists conditions catch the
//! cross-instance races clearance cannot see.

use crate::error::{CadForgeError, CadForgeResult};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Mutex;

/// Condition evaluated against the current row before a field update.
///
/// A failed condition is a clean no-op signal, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCondition {
    /// Apply only when the named attribute is present on the row
    AttributeExists(String),
    /// Apply only when the named attribute is absent (or the row is missing)
    AttributeNotExists(String),
}

/// Unified access to all table operations used by the coordination layer.
#[derive(Clone)]
pub struct DbOperations {
    db: sled::Db,
    trees: std::sync::Arc<Mutex<HashMap<String, sled::Tree>>>,
}

impl DbOperations {
    /// Creates a new DbOperations instance over an opened sled database
    pub fn new(db: sled::Db) -> Result<Self, sled::Error> {
        Ok(Self {
            db,
            trees: std::sync::Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Gets a reference to the underlying database
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    fn tree(&self, table: &str) -> CadForgeResult<sled::Tree> {
        let mut trees = self
            .trees
            .lock()
            .map_err(|_| CadForgeError::Database("Failed to acquire tree cache lock".to_string()))?;
        if let Some(tree) = trees.get(table) {
            return Ok(tree.clone());
        }
        let tree = self.db.open_tree(table)?;
        trees.insert(table.to_string(), tree.clone());
        Ok(tree)
    }

    /// Retrieve a deserializable item from a table
    pub fn get_item<T: DeserializeOwned>(&self, table: &str, key: &str) -> CadForgeResult<Option<T>> {
        let tree = self.tree(table)?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes).map_err(|e| {
                    CadForgeError::Serialization(format!(
                        "Deserialization failed for {}/{}: {}",
                        table, key, e
                    ))
                })?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Store a serializable item in a table, replacing any existing row
    pub fn put_item<T: Serialize>(&self, table: &str, key: &str, item: &T) -> CadForgeResult<()> {
        let tree = self.tree(table)?;
        let bytes = serde_json::to_vec(item)?;
        tree.insert(key.as_bytes(), bytes)?;
        tree.flush()?;
        Ok(())
    }

    /// Check whether a row exists
    pub fn exists(&self, table: &str, key: &str) -> CadForgeResult<bool> {
        let tree = self.tree(table)?;
        Ok(tree.contains_key(key.as_bytes())?)
    }

    /// Set one field of a JSON row, optionally guarded by a condition on the
    /// current row. Returns true when the write was applied, false when the
    /// condition rejected it.
    pub fn update_item_field(
        &self,
        table: &str,
        key: &str,
        field: &str,
        value: JsonValue,
        condition: Option<WriteCondition>,
    ) -> CadForgeResult<bool> {
        let tree = self.tree(table)?;
        let mut row = match tree.get(key.as_bytes())? {
            Some(bytes) => serde_json::from_slice::<JsonValue>(&bytes)?,
            None => JsonValue::Object(serde_json::Map::new()),
        };

        if let Some(condition) = condition {
            let holds = match &condition {
                WriteCondition::AttributeExists(attr) => row.get(attr).is_some(),
                WriteCondition::AttributeNotExists(attr) => row.get(attr).is_none(),
            };
            if !holds {
                return Ok(false);
            }
        }

        let object = row.as_object_mut().ok_or_else(|| {
            CadForgeError::Database(format!("Row {}/{} is not a JSON object", table, key))
        })?;
        object.insert(field.to_string(), value);

        tree.insert(key.as_bytes(), serde_json::to_vec(&row)?)?;
        tree.flush()?;
        Ok(true)
    }

    /// Delete a row, reporting whether it existed
    pub fn delete_item(&self, table: &str, key: &str) -> CadForgeResult<bool> {
        let tree = self.tree(table)?;
        let existed = tree.remove(key.as_bytes())?.is_some();
        tree.flush()?;
        Ok(existed)
    }

    /// List all key/item pairs in a table
    pub fn scan_table<T: DeserializeOwned>(&self, table: &str) -> CadForgeResult<Vec<(String, T)>> {
        let tree = self.tree(table)?;
        let mut items = Vec::new();
        for result in tree.iter() {
            let (key, value) = result?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let item = serde_json::from_slice(&value).map_err(|e| {
                CadForgeError::Serialization(format!(
                    "Deserialization failed for key '{}': {}",
                    key_str, e
                ))
            })?;
            items.push((key_str, item));
        }
        Ok(items)
    }

    /// Add an element to a set-valued array attribute, creating the row when
    /// absent. Returns true when the element was newly inserted.
    pub fn add_to_array_item(
        &self,
        table: &str,
        key: &str,
        field: &str,
        element: &str,
    ) -> CadForgeResult<bool> {
        let tree = self.tree(table)?;
        let mut row = match tree.get(key.as_bytes())? {
            Some(bytes) => serde_json::from_slice::<JsonValue>(&bytes)?,
            None => JsonValue::Object(serde_json::Map::new()),
        };
        let object = row.as_object_mut().ok_or_else(|| {
            CadForgeError::Database(format!("Row {}/{} is not a JSON object", table, key))
        })?;

        let array = object
            .entry(field.to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        let items = array.as_array_mut().ok_or_else(|| {
            CadForgeError::Database(format!(
                "Attribute '{}' of {}/{} is not an array",
                field, table, key
            ))
        })?;

        if items.iter().any(|v| v.as_str() == Some(element)) {
            return Ok(false);
        }
        items.push(JsonValue::String(element.to_string()));

        tree.insert(key.as_bytes(), serde_json::to_vec(&row)?)?;
        tree.flush()?;
        Ok(true)
    }

    /// Remove an element from a set-valued array attribute. Deletes the row
    /// when the set empties. Returns true when the element was present.
    pub fn remove_from_array_item(
        &self,
        table: &str,
        key: &str,
        field: &str,
        element: &str,
    ) -> CadForgeResult<bool> {
        let tree = self.tree(table)?;
        let mut row = match tree.get(key.as_bytes())? {
            Some(bytes) => serde_json::from_slice::<JsonValue>(&bytes)?,
            None => return Ok(false),
        };
        let object = row.as_object_mut().ok_or_else(|| {
            CadForgeError::Database(format!("Row {}/{} is not a JSON object", table, key))
        })?;

        let Some(array) = object.get_mut(field) else {
            return Ok(false);
        };
        let items = array.as_array_mut().ok_or_else(|| {
            CadForgeError::Database(format!(
                "Attribute '{}' of {}/{} is not an array",
                field, table, key
            ))
        })?;

        let before = items.len();
        items.retain(|v| v.as_str() != Some(element));
        if items.len() == before {
            return Ok(false);
        }

        if items.is_empty() {
            tree.remove(key.as_bytes())?;
        } else {
            tree.insert(key.as_bytes(), serde_json::to_vec(&row)?)?;
        }
        tree.flush()?;
        Ok(true)
    }
}
