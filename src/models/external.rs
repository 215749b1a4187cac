//! Wire-agnostic views of remote resources, as presented by adapters.

use serde::{Deserialize, Serialize};

/// A track as one platform reports it. `raw` carries the untouched remote
/// payload for the link's metadata blob; the core never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtTrack {
    pub external_id: String,
    pub uri: Option<String>,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_ms: Option<i64>,
    pub isrc: Option<String>,
    /// Release+position reference for catalog platforms (one track of one
    /// pressing).
    pub release_ref: Option<String>,
    /// Exact file hash, when the platform owns filesystem paths.
    pub content_hash: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl ExtTrack {
    pub fn new(
        external_id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            uri: None,
            title: title.into(),
            artist: artist.into(),
            album: None,
            duration_ms: None,
            isrc: None,
            release_ref: None,
            content_hash: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_isrc(mut self, isrc: impl Into<String>) -> Self {
        self.isrc = Some(isrc.into());
        self
    }

    pub fn with_release_ref(mut self, release_ref: impl Into<String>) -> Self {
        self.release_ref = Some(release_ref.into());
        self
    }

    pub fn with_content_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = Some(content_hash.into());
        self
    }
}

/// A playlist as one platform reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtPlaylist {
    pub external_id: String,
    pub name: String,
    pub description: Option<String>,
    pub owned_by_user: bool,
    pub track_count: usize,
}

/// Static declaration of what one adapter supports. The core branches on
/// these flags, never on adapter identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub can_create: bool,
    pub can_delete: bool,
    pub can_modify_shared: bool,
    pub owns_filesystem_paths: bool,
    pub is_personal_only: bool,
    pub rate_budget_per_minute: u32,
    pub max_batch_size: usize,
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self {
            can_create: true,
            can_delete: true,
            can_modify_shared: false,
            owns_filesystem_paths: false,
            is_personal_only: false,
            rate_budget_per_minute: 120,
            max_batch_size: 50,
        }
    }
}

/// Per-item result of a batched remote mutation
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone)]
pub struct BatchItemFailure {
    pub external_id: String,
    pub reason: String,
}

impl BatchOutcome {
    /// Outcome where every requested item succeeded.
    pub fn ok(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            succeeded: ids.into_iter().collect(),
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
