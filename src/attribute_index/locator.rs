//! Metadata locator encoding.
//!
//! A locator names the owner of a metadata entry: either a model
//! (`MM_<modelId>`) or a specific revision metadata node
//! (`VM_<modelId>_<revisionIndex>_<nodeId>`). The string form is the opaque
//! payload stored in index rows; the parsed form is what read-side
//! endpoints present to callers.

use crate::constants::{MODEL_LOCATOR_PREFIX, REVISION_LOCATOR_PREFIX};
use crate::error::CadForgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Owner of a metadata entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataLocator {
    /// Metadata attached directly to a model
    Model { model_id: String },
    /// Metadata attached to a node of a specific revision.
    /// Revision indexes and node ids never contain underscores; model ids may.
    Revision {
        model_id: String,
        revision_index: u32,
        node_id: String,
    },
}

impl MetadataLocator {
    pub fn model(model_id: &str) -> Self {
        Self::Model {
            model_id: model_id.to_string(),
        }
    }

    pub fn revision(model_id: &str, revision_index: u32, node_id: &str) -> Self {
        Self::Revision {
            model_id: model_id.to_string(),
            revision_index,
            node_id: node_id.to_string(),
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::Model { model_id } | Self::Revision { model_id, .. } => model_id,
        }
    }

    /// Caller-facing reference with the prefix scheme stripped:
    /// `modelId` or `modelId->revisionIndex`.
    pub fn display_reference(&self) -> String {
        match self {
            Self::Model { model_id } => model_id.clone(),
            Self::Revision {
                model_id,
                revision_index,
                ..
            } => format!("{}->{}", model_id, revision_index),
        }
    }
}

impl fmt::Display for MetadataLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model { model_id } => write!(f, "{}{}", MODEL_LOCATOR_PREFIX, model_id),
            Self::Revision {
                model_id,
                revision_index,
                node_id,
            } => write!(
                f,
                "{}{}_{}_{}",
                REVISION_LOCATOR_PREFIX, model_id, revision_index, node_id
            ),
        }
    }
}

impl FromStr for MetadataLocator {
    type Err = CadForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(model_id) = s.strip_prefix(MODEL_LOCATOR_PREFIX) {
            if model_id.is_empty() {
                return Err(CadForgeError::Index(format!("Empty model locator: '{}'", s)));
            }
            return Ok(Self::model(model_id));
        }

        if let Some(rest) = s.strip_prefix(REVISION_LOCATOR_PREFIX) {
            // Parse from the right so model ids may contain underscores
            let mut parts = rest.rsplitn(3, '_');
            let node_id = parts.next().unwrap_or_default();
            let revision = parts.next().unwrap_or_default();
            let model_id = parts.next().unwrap_or_default();
            if model_id.is_empty() || node_id.is_empty() {
                return Err(CadForgeError::Index(format!(
                    "Malformed revision locator: '{}'",
                    s
                )));
            }
            let revision_index = revision.parse::<u32>().map_err(|_| {
                CadForgeError::Index(format!(
                    "Invalid revision index '{}' in locator '{}'",
                    revision, s
                ))
            })?;
            return Ok(Self::revision(model_id, revision_index, node_id));
        }

        Err(CadForgeError::Index(format!(
            "Unknown locator prefix: '{}'",
            s
        )))
    }
}
