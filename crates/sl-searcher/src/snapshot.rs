//! Versioned snapshot blobs for search method state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sl_types::{SlResult, SnapshotError};

use crate::method::SearchMethodType;

/// Serialized state of one search method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSnapshot {
    pub method: SearchMethodType,
    pub version: u32,
    pub state: serde_json::Value,
}

impl MethodSnapshot {
    pub fn encode<T: Serialize>(method: SearchMethodType, version: u32, state: &T) -> SlResult<Self> {
        Ok(Self {
            method,
            version,
            state: serde_json::to_value(state)?,
        })
    }

    /// Decode state written by `method` at exactly `version`. Anything else is
    /// refused rather than decoded on a best-effort basis.
    pub fn decode<T: DeserializeOwned>(
        snapshot: Option<&MethodSnapshot>,
        method: SearchMethodType,
        version: u32,
    ) -> SlResult<T> {
        let snapshot = snapshot.ok_or_else(|| SnapshotError::MissingState {
            method: method.to_string(),
        })?;
        if snapshot.method != method {
            return Err(SnapshotError::MethodMismatch {
                expected: method.to_string(),
                found: snapshot.method.to_string(),
            }
            .into());
        }
        if snapshot.version != version {
            return Err(SnapshotError::UnsupportedVersion {
                method: method.to_string(),
                found: snapshot.version,
                expected: version,
            }
            .into());
        }
        Ok(serde_json::from_value(snapshot.state.clone())?)
    }
}
