//! The uniform contract every external platform implements.
//!
//! Adapters translate between this interface and the remote wire format and
//! nothing else: they never touch the repository, and wire-format concerns
//! never leak into the core. The core branches on [`CapabilityFlags`], not
//! on adapter identity, so new platforms drop in without touching it.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BatchOutcome, CapabilityFlags, ExtPlaylist, ExtTrack, Platform};

/// Free-text query the detector builds for export-time matching.
#[derive(Debug, Clone)]
pub struct TrackQuery {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
}

impl TrackQuery {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: None,
        }
    }
}

/// Opaque source of credentials. The host application owns storage and OAuth
/// flows; adapters only ever ask for the current token.
pub trait CredentialProvider: Send + Sync {
    fn access_token(&self, platform: Platform) -> Option<String>;
}

/// One external platform, as seen by the core
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Static declaration of supported operations and limits.
    fn capabilities(&self) -> CapabilityFlags;

    /// Pure read of cached credential state. Never fails.
    fn authenticated(&self) -> bool;

    /// May block on an external authentication flow. Fails with
    /// [`crate::SyncError::AuthFailed`].
    async fn authenticate(&self) -> Result<()>;

    /// All playlists visible to the user. Pagination is the adapter's
    /// concern; the returned order is the platform's.
    async fn list_playlists(&self) -> Result<Vec<ExtPlaylist>>;

    /// Members of one remote playlist, in platform order.
    async fn fetch_playlist_tracks(&self, external_playlist_id: &str) -> Result<Vec<ExtTrack>>;

    /// Create a remote playlist, returning its new external id. Adapters
    /// without creation support fail with
    /// [`crate::SyncError::NotPermitted`].
    async fn create_playlist(
        &self,
        name: &str,
        description: &str,
        private: bool,
    ) -> Result<String>;

    /// Add tracks to a remote playlist, reporting per-item success.
    async fn add_tracks(
        &self,
        external_playlist_id: &str,
        external_track_ids: &[String],
    ) -> Result<BatchOutcome>;

    /// Remove tracks from a remote playlist, reporting per-item success.
    /// May fail outright if the remote playlist is not owned.
    async fn remove_tracks(
        &self,
        external_playlist_id: &str,
        external_track_ids: &[String],
    ) -> Result<BatchOutcome>;

    /// Catalog search used to propose remote counterparts for unlinked
    /// library tracks.
    async fn search(&self, query: &TrackQuery, limit: usize) -> Result<Vec<ExtTrack>>;
}
