//! Playlist tree, membership, and platform binding models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Platform;

/// Kind of node in the playlist tree. Folders contain only playlists and
/// folders, never tracks; collection views behave like playlists but are
/// backed by the whole collection (e.g. the vinyl wantlist).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PlaylistKind {
    Folder,
    Playlist,
    CollectionView,
}

/// An ordered collection of tracks, or a folder containing other playlists
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Playlist {
    pub id: i64,
    pub name: String,
    pub kind: PlaylistKind,
    pub parent_id: Option<i64>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Playlist {
    pub fn is_folder(&self) -> bool {
        self.kind == PlaylistKind::Folder
    }
}

/// Ordered membership edge. Positions within a playlist form a dense
/// contiguous sequence starting at zero after every mutating operation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlaylistMember {
    pub playlist_id: i64,
    pub track_id: i64,
    pub position: i64,
    pub added_at: DateTime<Utc>,
}

/// How changes flow between a bound local playlist and its remote
/// counterpart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncMode {
    FullBidirectional,
    AddOnly,
    MirrorFromPlatform,
    MirrorToPlatform,
    ImportOnly,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncMode::FullBidirectional => "full_bidirectional",
            SyncMode::AddOnly => "add_only",
            SyncMode::MirrorFromPlatform => "mirror_from_platform",
            SyncMode::MirrorToPlatform => "mirror_to_platform",
            SyncMode::ImportOnly => "import_only",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_bidirectional" => Ok(SyncMode::FullBidirectional),
            "add_only" => Ok(SyncMode::AddOnly),
            "mirror_from_platform" => Ok(SyncMode::MirrorFromPlatform),
            "mirror_to_platform" => Ok(SyncMode::MirrorToPlatform),
            "import_only" => Ok(SyncMode::ImportOnly),
            other => Err(format!("unknown sync mode '{}'", other)),
        }
    }
}

/// Records that a local playlist is linked to an external playlist on one
/// platform. `(playlist_id, platform)` and `(platform, external_playlist_id)`
/// are both unique.
///
/// An empty `external_playlist_id` means the remote counterpart does not
/// exist yet; the first sync creates it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlaylistPlatformBinding {
    pub id: i64,
    pub playlist_id: i64,
    pub platform: Platform,
    pub external_playlist_id: String,
    pub sync_mode: SyncMode,
    pub is_personal: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl PlaylistPlatformBinding {
    pub fn has_remote_counterpart(&self) -> bool {
        !self.external_playlist_id.is_empty()
    }

    /// The mode the planner actually honors: shared remote playlists are
    /// import-only no matter what the binding requests.
    pub fn effective_mode(&self) -> SyncMode {
        if self.is_personal {
            self.sync_mode
        } else {
            SyncMode::ImportOnly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_mode_round_trips_through_str() {
        for mode in [
            SyncMode::FullBidirectional,
            SyncMode::AddOnly,
            SyncMode::MirrorFromPlatform,
            SyncMode::MirrorToPlatform,
            SyncMode::ImportOnly,
        ] {
            assert_eq!(mode.to_string().parse::<SyncMode>().unwrap(), mode);
        }
    }

    #[test]
    fn shared_bindings_degrade_to_import_only() {
        let binding = PlaylistPlatformBinding {
            id: 1,
            playlist_id: 2,
            platform: Platform::Spotify,
            external_playlist_id: "ext".into(),
            sync_mode: SyncMode::FullBidirectional,
            is_personal: false,
            last_synced_at: None,
        };
        assert_eq!(binding.effective_mode(), SyncMode::ImportOnly);
    }
}
