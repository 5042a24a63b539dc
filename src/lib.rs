//! # CadForge Coordination Library
//!
//! This library implements the coordination services of the CadForge CAD
//! model management platform: advisory key clearance, denormalized
//! attribute indexes, ensured-delivery database writes and batch
//! conversion pod orchestration.
//!
//! ## Core Components
//!
//! * `clearance` - Process-local advisory locking over (table, key) pairs
//! * `attribute_index` - Denormalized attribute index maintenance and lookup
//! * `db_operations` - Sled-backed row storage and the retried delivery writer
//! * `batch` - Conversion pod creation, lifecycle tracking and reconciliation
//! * `events` - Typed in-process message bus for broadcast actions
//! * `config` - Runtime tuning knobs with file-based overrides
//! * `error` - Error types and handling
//!
//! ## Architecture
//!
//! Mutations to shared rows first obtain clearance, a fail-fast advisory
//! claim that never blocks. Index writes fan out to four denormalized
//! tables through the ensured delivery writer, which retries each mutation
//! until it lands or the retry budget is exhausted. Batch conversions run
//! in external pods named deterministically from their input file; a
//! lifecycle tracker polls each pod and a periodic reconciliation sweep
//! repairs whatever the pollers miss.

pub mod attribute_index;
pub mod batch;
pub mod clearance;
pub mod config;
pub mod constants;
pub mod db_operations;
pub mod error;
pub mod events;
pub mod testing_utils;

// Re-export main types for convenience
pub use attribute_index::{
    AttributeIndexCoordinator, ContentionMode, IndexOp, MetadataLocator, MetadataSet,
};
pub use batch::{
    BatchCreationOrchestrator, ContainerPlatform, ConversionStatus, ConversionStore, FileStore,
    PodLifecycleTracker, PodPhase, PodType,
};
pub use clearance::{ClearanceGuard, KeyClearanceRegistry, OperationContext};
pub use config::{CoordinationConfig, RetryPolicy};
pub use db_operations::{DbOperations, EnsuredDeliveryWriter, InMemoryStore, MemoryStore};
pub use error::{CadForgeError, CadForgeResult};
pub use events::MessageBus;
