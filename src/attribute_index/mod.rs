//! Attribute indexing: locator encoding and the four-table fan-out
//! coordinator that keeps metadata lookups exact-match.

pub mod coordinator;
pub mod locator;

pub use coordinator::{AttributeIndexCoordinator, ContentionMode, IndexOp, MetadataSet};
pub use locator::MetadataLocator;
