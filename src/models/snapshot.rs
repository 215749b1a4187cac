//! Per-binding membership snapshots.
//!
//! A snapshot freezes the observed membership of a `(playlist, platform)`
//! pair at the last successful sync. It is the only historical state the
//! change detector compares against, and it is replaced atomically on every
//! successful sync.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Current on-disk snapshot schema version. Readers accept documents with
/// this version or older; unknown fields are ignored for forward
/// compatibility.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

fn current_version() -> u32 {
    SNAPSHOT_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "current_version")]
    pub schema_version: u32,
    pub binding_id: i64,
    pub taken_at: DateTime<Utc>,
    /// Ordered local membership (track ids) at snapshot time.
    pub library_members: Vec<i64>,
    /// Ordered remote membership (external ids) at snapshot time.
    pub platform_members: Vec<String>,
    /// external_id -> track_id pairs as observed at snapshot time.
    pub link_pairs: HashMap<String, i64>,
}

impl Snapshot {
    pub fn new(
        binding_id: i64,
        library_members: Vec<i64>,
        platform_members: Vec<String>,
        link_pairs: HashMap<String, i64>,
    ) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            binding_id,
            taken_at: Utc::now(),
            library_members,
            platform_members,
            link_pairs,
        }
    }

    /// The empty snapshot used for first syncs, where everything on both
    /// sides classifies as an addition.
    pub fn empty(binding_id: i64) -> Self {
        Self::new(binding_id, Vec::new(), Vec::new(), HashMap::new())
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(raw)?;
        if snapshot.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(SyncError::conflict(format!(
                "snapshot schema version {} is newer than supported version {}",
                snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION
            )));
        }
        Ok(snapshot)
    }
}
