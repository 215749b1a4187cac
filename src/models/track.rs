//! Track and cross-platform identity models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The external services the core can be bound to. The core itself only
/// branches on adapter capability flags; this enum is an identity tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Platform {
    Spotify,
    Rekordbox,
    Discogs,
    Youtube,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Spotify => "spotify",
            Platform::Rekordbox => "rekordbox",
            Platform::Discogs => "discogs",
            Platform::Youtube => "youtube",
        }
    }

    pub const ALL: [Platform; 4] = [
        Platform::Spotify,
        Platform::Rekordbox,
        Platform::Discogs,
        Platform::Youtube,
    ];
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spotify" => Ok(Platform::Spotify),
            "rekordbox" => Ok(Platform::Rekordbox),
            "discogs" => Ok(Platform::Discogs),
            "youtube" => Ok(Platform::Youtube),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

/// A song as known to the local library
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Track {
    pub id: i64,
    pub title: String,
    pub primary_artist: String,
    pub album: Option<String>,
    pub duration_ms: Option<i64>,
    pub year: Option<i64>,
    pub bpm: Option<f64>,
    pub is_local_file: bool,
    pub local_path: Option<String>,
    /// Exact hash of the audio file, recorded by the import pipeline for
    /// local files. Hashing bytes happens outside the core.
    pub content_hash: Option<String>,
    pub quality_rating: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Payload for creating a track
#[derive(Debug, Clone, Default)]
pub struct NewTrack {
    pub title: String,
    pub primary_artist: String,
    pub album: Option<String>,
    pub duration_ms: Option<i64>,
    pub year: Option<i64>,
    pub bpm: Option<f64>,
    pub is_local_file: bool,
    pub local_path: Option<String>,
    pub content_hash: Option<String>,
    pub quality_rating: Option<i64>,
}

impl NewTrack {
    pub fn new(title: impl Into<String>, primary_artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            primary_artist: primary_artist.into(),
            ..Default::default()
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

    pub fn with_year(mut self, year: i64) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_content_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = Some(content_hash.into());
        self
    }
}

/// The bridge between a local track and its representation on one platform.
/// `(track_id, platform)` and `(platform, external_id)` are both unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlatformLink {
    pub id: i64,
    pub track_id: i64,
    pub platform: Platform,
    pub external_id: String,
    pub external_uri: Option<String>,
    pub metadata: serde_json::Value,
    pub last_synced_at: DateTime<Utc>,
    pub needs_refresh: bool,
    pub match_confidence: f64,
}

impl PlatformLink {
    /// ISRC carried in the opaque remote metadata, when the platform
    /// reported one at link time.
    pub fn isrc(&self) -> Option<&str> {
        self.metadata.get("isrc").and_then(|v| v.as_str())
    }

    /// Release+position reference carried in the remote metadata, the way
    /// catalog platforms identify one track of one pressing.
    pub fn release_ref(&self) -> Option<&str> {
        self.metadata.get("release_ref").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_str() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert!("mtv".parse::<Platform>().is_err());
    }

    #[test]
    fn link_exposes_strong_ids_from_metadata() {
        let link = PlatformLink {
            id: 1,
            track_id: 7,
            platform: Platform::Spotify,
            external_id: "sp:1".into(),
            external_uri: None,
            metadata: serde_json::json!({"isrc": "USUM71703861", "release_ref": "1176328#A2"}),
            last_synced_at: Utc::now(),
            needs_refresh: false,
            match_confidence: 1.0,
        };
        assert_eq!(link.isrc(), Some("USUM71703861"));
        assert_eq!(link.release_ref(), Some("1176328#A2"));
    }
}
