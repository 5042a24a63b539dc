//! Table storage, delivery-ensured mutation and memory-store collaborators.

pub mod core;
pub mod ensured;
pub mod memory_store;

pub use self::core::{DbOperations, WriteCondition};
pub use ensured::{EnsuredDeliveryWriter, Mutation};
pub use memory_store::{InMemoryStore, MemoryStore};
