//! Durable storage and query over tracks, playlists, links, bindings and
//! snapshots.
//!
//! Concurrency contract: one writer at a time per playlist (enforced by
//! per-playlist async locks), unrestricted readers, cross-playlist writes in
//! parallel. Writes that would violate a uniqueness invariant surface as
//! [`SyncError::Conflict`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::SqlitePool;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use unicode_normalization::UnicodeNormalization;

use crate::error::{Result, SyncError};
use crate::models::{
    NewTrack, Platform, PlatformLink, Playlist, PlaylistKind, PlaylistMember,
    PlaylistPlatformBinding, SyncMode, Track,
};

/// Name of the system playlist backing the whole local collection.
pub const SYSTEM_COLLECTION_NAME: &str = "Library Collection";

const TRACK_COLUMNS: &str = "id, title, primary_artist, album, duration_ms, year, bpm, \
     is_local_file, local_path, content_hash, quality_rating, created_at, deleted_at";
const PLAYLIST_COLUMNS: &str = "id, name, kind, parent_id, is_system, created_at, updated_at";
const LINK_COLUMNS: &str = "id, track_id, platform, external_id, external_uri, metadata, \
     last_synced_at, needs_refresh, match_confidence";
const BINDING_COLUMNS: &str =
    "id, playlist_id, platform, external_playlist_id, sync_mode, is_personal, last_synced_at";

/// Search filter for tracks
#[derive(Debug, Clone, Default)]
pub struct TrackSearch {
    /// Substring matched against title and primary artist.
    pub text: Option<String>,
    /// Only tracks linked on this platform.
    pub present_on: Option<Platform>,
    pub limit: Option<i64>,
}

/// Repository over the embedded store
pub struct LibraryRepository {
    pool: SqlitePool,
    writer_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl LibraryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer_locks: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction for a multi-step local mutation.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Acquire the single-writer lock for one playlist. Readers never take
    /// this; concurrent writers to different playlists proceed in parallel.
    pub async fn lock_playlist(&self, playlist_id: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .writer_locks
            .entry(playlist_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    // Tracks

    pub async fn create_track(&self, new: NewTrack) -> Result<Track> {
        let title = clean_required("title", &new.title)?;
        let artist = clean_required("primary_artist", &new.primary_artist)?;

        let result = sqlx::query(
            "INSERT INTO tracks (title, primary_artist, album, duration_ms, year, bpm, \
             is_local_file, local_path, content_hash, quality_rating, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&title)
        .bind(&artist)
        .bind(&new.album)
        .bind(new.duration_ms)
        .bind(new.year)
        .bind(new.bpm)
        .bind(new.is_local_file)
        .bind(&new.local_path)
        .bind(&new.content_hash)
        .bind(new.quality_rating)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let track = self
            .get_track(result.last_insert_rowid())
            .await?
            .ok_or_else(|| SyncError::not_found("track just created"))?;
        Ok(track)
    }

    pub async fn create_track_tx(
        &self,
        conn: &mut SqliteConnection,
        new: NewTrack,
    ) -> Result<i64> {
        let title = clean_required("title", &new.title)?;
        let artist = clean_required("primary_artist", &new.primary_artist)?;

        let result = sqlx::query(
            "INSERT INTO tracks (title, primary_artist, album, duration_ms, year, bpm, \
             is_local_file, local_path, content_hash, quality_rating, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&title)
        .bind(&artist)
        .bind(&new.album)
        .bind(new.duration_ms)
        .bind(new.year)
        .bind(new.bpm)
        .bind(new.is_local_file)
        .bind(&new.local_path)
        .bind(&new.content_hash)
        .bind(new.quality_rating)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_track(&self, id: i64) -> Result<Option<Track>> {
        let track = sqlx::query_as::<_, Track>(&format!(
            "SELECT {} FROM tracks WHERE id = ?",
            TRACK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(track)
    }

    /// Overwrite the comparable metadata of a track. Used when a conflict is
    /// resolved in favor of the platform side.
    pub async fn update_track_metadata_tx(
        &self,
        conn: &mut SqliteConnection,
        track_id: i64,
        title: &str,
        primary_artist: &str,
        album: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        let title = clean_required("title", title)?;
        let artist = clean_required("primary_artist", primary_artist)?;
        sqlx::query(
            "UPDATE tracks SET title = ?, primary_artist = ?, album = ?, duration_ms = ? \
             WHERE id = ?",
        )
        .bind(&title)
        .bind(&artist)
        .bind(album)
        .bind(duration_ms)
        .bind(track_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Soft-delete a track. Refused while any playlist still references it.
    pub async fn soft_delete_track(&self, id: i64) -> Result<()> {
        let references: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM playlist_members WHERE track_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if references > 0 {
            return Err(SyncError::conflict(format!(
                "track {} is referenced by {} playlist(s)",
                id, references
            )));
        }
        sqlx::query("UPDATE tracks SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn search_tracks(&self, search: &TrackSearch) -> Result<Vec<Track>> {
        let mut sql = format!(
            "SELECT {} FROM tracks WHERE deleted_at IS NULL",
            TRACK_COLUMNS
        );
        if search.text.is_some() {
            sql.push_str(" AND (title LIKE ? OR primary_artist LIKE ?)");
        }
        if search.present_on.is_some() {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM platform_links pl \
                 WHERE pl.track_id = tracks.id AND pl.platform = ?)",
            );
        }
        sql.push_str(" ORDER BY primary_artist, title LIMIT ?");

        let mut query = sqlx::query_as::<_, Track>(&sql);
        if let Some(text) = &search.text {
            let pattern = format!("%{}%", text);
            query = query.bind(pattern.clone()).bind(pattern);
        }
        if let Some(platform) = search.present_on {
            query = query.bind(platform);
        }
        query = query.bind(search.limit.unwrap_or(50));

        Ok(query.fetch_all(&self.pool).await?)
    }

    // Playlists

    /// Fetch or create the system playlist backing the whole collection.
    pub async fn ensure_system_collection(&self) -> Result<Playlist> {
        if let Some(existing) = sqlx::query_as::<_, Playlist>(&format!(
            "SELECT {} FROM playlists WHERE is_system = 1 AND name = ?",
            PLAYLIST_COLUMNS
        ))
        .bind(SYSTEM_COLLECTION_NAME)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO playlists (name, kind, parent_id, is_system, created_at, updated_at) \
             VALUES (?, ?, NULL, 1, ?, ?)",
        )
        .bind(SYSTEM_COLLECTION_NAME)
        .bind(PlaylistKind::CollectionView)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_playlist(result.last_insert_rowid())
            .await?
            .ok_or_else(|| SyncError::not_found("system collection just created"))
    }

    pub async fn create_playlist(
        &self,
        name: &str,
        kind: PlaylistKind,
        parent_id: Option<i64>,
    ) -> Result<Playlist> {
        let name = clean_required("name", name)?;
        if let Some(parent_id) = parent_id {
            let parent = self
                .get_playlist(parent_id)
                .await?
                .ok_or_else(|| SyncError::not_found(format!("playlist {}", parent_id)))?;
            if !parent.is_folder() {
                return Err(SyncError::conflict("parent must be a folder"));
            }
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO playlists (name, kind, parent_id, is_system, created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&name)
        .bind(kind)
        .bind(parent_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_playlist(result.last_insert_rowid())
            .await?
            .ok_or_else(|| SyncError::not_found("playlist just created"))
    }

    pub async fn get_playlist(&self, id: i64) -> Result<Option<Playlist>> {
        let playlist = sqlx::query_as::<_, Playlist>(&format!(
            "SELECT {} FROM playlists WHERE id = ?",
            PLAYLIST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(playlist)
    }

    /// Rename a playlist. Renaming never invalidates bindings; system
    /// playlists cannot be renamed.
    pub async fn rename_playlist(&self, id: i64, name: &str) -> Result<()> {
        let playlist = self
            .get_playlist(id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("playlist {}", id)))?;
        if playlist.is_system {
            return Err(SyncError::not_permitted("system playlists cannot be renamed"));
        }
        let name = clean_required("name", name)?;
        sqlx::query("UPDATE playlists SET name = ?, updated_at = ? WHERE id = ?")
            .bind(&name)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a playlist together with its members, bindings and snapshots.
    /// System playlists and non-empty folders are refused.
    pub async fn delete_playlist(&self, id: i64) -> Result<()> {
        let playlist = self
            .get_playlist(id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("playlist {}", id)))?;
        if playlist.is_system {
            return Err(SyncError::not_permitted("system playlists cannot be deleted"));
        }
        let child_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM playlists WHERE parent_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if child_count > 0 {
            return Err(SyncError::conflict("folder is not empty"));
        }

        let _guard = self.lock_playlist(id).await;
        let mut tx = self.begin().await?;
        sqlx::query(
            "DELETE FROM snapshots WHERE binding_id IN \
             (SELECT id FROM playlist_platform_bindings WHERE playlist_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM playlist_platform_bindings WHERE playlist_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM playlist_members WHERE playlist_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM playlists WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Re-parent a playlist, keeping the parent chain acyclic.
    pub async fn move_playlist(&self, id: i64, new_parent: Option<i64>) -> Result<()> {
        if let Some(parent_id) = new_parent {
            let parent = self
                .get_playlist(parent_id)
                .await?
                .ok_or_else(|| SyncError::not_found(format!("playlist {}", parent_id)))?;
            if !parent.is_folder() {
                return Err(SyncError::conflict("parent must be a folder"));
            }
            // Walk up from the new parent; finding ourselves means a cycle.
            let mut cursor = Some(parent_id);
            while let Some(current) = cursor {
                if current == id {
                    return Err(SyncError::conflict("moving playlist would create a cycle"));
                }
                cursor = sqlx::query_scalar("SELECT parent_id FROM playlists WHERE id = ?")
                    .bind(current)
                    .fetch_one(&self.pool)
                    .await?;
            }
        }
        sqlx::query("UPDATE playlists SET parent_id = ?, updated_at = ? WHERE id = ?")
            .bind(new_parent)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn children(&self, parent_id: Option<i64>) -> Result<Vec<Playlist>> {
        let sql = match parent_id {
            Some(_) => format!(
                "SELECT {} FROM playlists WHERE parent_id = ? ORDER BY name",
                PLAYLIST_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM playlists WHERE parent_id IS NULL ORDER BY name",
                PLAYLIST_COLUMNS
            ),
        };
        let mut query = sqlx::query_as::<_, Playlist>(&sql);
        if let Some(parent_id) = parent_id {
            query = query.bind(parent_id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    // Playlist membership

    pub async fn playlist_members(&self, playlist_id: i64) -> Result<Vec<PlaylistMember>> {
        let members = sqlx::query_as::<_, PlaylistMember>(
            "SELECT playlist_id, track_id, position, added_at FROM playlist_members \
             WHERE playlist_id = ? ORDER BY position",
        )
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    /// Ordered track ids of one playlist.
    pub async fn member_track_ids(&self, playlist_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT track_id FROM playlist_members WHERE playlist_id = ? ORDER BY position",
        )
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Append a track to a playlist. Returns false when it was already a
    /// member (idempotent).
    pub async fn add_member(&self, playlist_id: i64, track_id: i64) -> Result<bool> {
        let _guard = self.lock_playlist(playlist_id).await;
        let mut tx = self.begin().await?;
        let added = self.add_member_tx(&mut tx, playlist_id, track_id).await?;
        tx.commit().await?;
        Ok(added)
    }

    pub async fn add_member_tx(
        &self,
        conn: &mut SqliteConnection,
        playlist_id: i64,
        track_id: i64,
    ) -> Result<bool> {
        let kind: Option<PlaylistKind> =
            sqlx::query_scalar("SELECT kind FROM playlists WHERE id = ?")
                .bind(playlist_id)
                .fetch_optional(&mut *conn)
                .await?;
        match kind {
            None => return Err(SyncError::not_found(format!("playlist {}", playlist_id))),
            Some(PlaylistKind::Folder) => {
                return Err(SyncError::conflict("folders cannot contain tracks"))
            }
            Some(_) => {}
        }

        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM playlist_members WHERE playlist_id = ? AND track_id = ?",
        )
        .bind(playlist_id)
        .bind(track_id)
        .fetch_one(&mut *conn)
        .await?;
        if exists > 0 {
            return Ok(false);
        }

        let position: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM playlist_members WHERE playlist_id = ?")
                .bind(playlist_id)
                .fetch_one(&mut *conn)
                .await?;
        sqlx::query(
            "INSERT INTO playlist_members (playlist_id, track_id, position, added_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(playlist_id)
        .bind(track_id)
        .bind(position)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(true)
    }

    /// Remove a track from a playlist. Returns false when it was not a
    /// member (idempotent). Positions are renumbered to stay dense.
    pub async fn remove_member(&self, playlist_id: i64, track_id: i64) -> Result<bool> {
        let _guard = self.lock_playlist(playlist_id).await;
        let mut tx = self.begin().await?;
        let removed = self.remove_member_tx(&mut tx, playlist_id, track_id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn remove_member_tx(
        &self,
        conn: &mut SqliteConnection,
        playlist_id: i64,
        track_id: i64,
    ) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM playlist_members WHERE playlist_id = ? AND track_id = ?")
                .bind(playlist_id)
                .bind(track_id)
                .execute(&mut *conn)
                .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.renumber_positions_tx(conn, playlist_id).await?;
        Ok(true)
    }

    /// Move a member to a new position, clamped to the playlist length.
    pub async fn move_member(
        &self,
        playlist_id: i64,
        track_id: i64,
        new_position: i64,
    ) -> Result<()> {
        let _guard = self.lock_playlist(playlist_id).await;
        let mut tx = self.begin().await?;

        let mut ids: Vec<i64> = sqlx::query_scalar(
            "SELECT track_id FROM playlist_members WHERE playlist_id = ? ORDER BY position",
        )
        .bind(playlist_id)
        .fetch_all(&mut *tx)
        .await?;
        let from = ids
            .iter()
            .position(|&id| id == track_id)
            .ok_or_else(|| SyncError::not_found(format!("member {}", track_id)))?;
        let to = (new_position.max(0) as usize).min(ids.len() - 1);
        let id = ids.remove(from);
        ids.insert(to, id);

        for (position, id) in ids.iter().enumerate() {
            sqlx::query(
                "UPDATE playlist_members SET position = ? WHERE playlist_id = ? AND track_id = ?",
            )
            .bind(position as i64)
            .bind(playlist_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn renumber_positions_tx(
        &self,
        conn: &mut SqliteConnection,
        playlist_id: i64,
    ) -> Result<()> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT track_id FROM playlist_members WHERE playlist_id = ? ORDER BY position",
        )
        .bind(playlist_id)
        .fetch_all(&mut *conn)
        .await?;
        for (position, track_id) in ids.iter().enumerate() {
            sqlx::query(
                "UPDATE playlist_members SET position = ? WHERE playlist_id = ? AND track_id = ?",
            )
            .bind(position as i64)
            .bind(playlist_id)
            .bind(track_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    // Platform links

    pub async fn create_link(
        &self,
        track_id: i64,
        platform: Platform,
        external_id: &str,
        external_uri: Option<&str>,
        metadata: serde_json::Value,
        match_confidence: f64,
    ) -> Result<PlatformLink> {
        let mut tx = self.begin().await?;
        let link = self
            .upsert_link_tx(
                &mut tx,
                track_id,
                platform,
                external_id,
                external_uri,
                metadata,
                match_confidence,
            )
            .await?;
        tx.commit().await?;
        Ok(link)
    }

    /// Create or refresh a link. External identity never splits: an
    /// `external_id` already linked to a different track is a conflict, as
    /// is a second link for the same `(track, platform)` pair.
    pub async fn upsert_link_tx(
        &self,
        conn: &mut SqliteConnection,
        track_id: i64,
        platform: Platform,
        external_id: &str,
        external_uri: Option<&str>,
        metadata: serde_json::Value,
        match_confidence: f64,
    ) -> Result<PlatformLink> {
        if external_id.is_empty() {
            return Err(SyncError::conflict("external_id must be non-empty"));
        }

        let existing = sqlx::query_as::<_, PlatformLink>(&format!(
            "SELECT {} FROM platform_links WHERE platform = ? AND external_id = ?",
            LINK_COLUMNS
        ))
        .bind(platform)
        .bind(external_id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(link) = existing {
            if link.track_id != track_id {
                return Err(SyncError::conflict(format!(
                    "{} id {} is already linked to track {}",
                    platform, external_id, link.track_id
                )));
            }
            sqlx::query(
                "UPDATE platform_links SET external_uri = ?, metadata = ?, last_synced_at = ?, \
                 needs_refresh = 0, match_confidence = ? WHERE id = ?",
            )
            .bind(external_uri)
            .bind(&metadata)
            .bind(Utc::now())
            .bind(match_confidence)
            .bind(link.id)
            .execute(&mut *conn)
            .await?;
            return self.link_by_id_tx(conn, link.id).await;
        }

        let other: Option<String> = sqlx::query_scalar(
            "SELECT external_id FROM platform_links WHERE track_id = ? AND platform = ?",
        )
        .bind(track_id)
        .bind(platform)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(other) = other {
            return Err(SyncError::conflict(format!(
                "track {} is already linked on {} to {}; unlink first",
                track_id, platform, other
            )));
        }

        let result = sqlx::query(
            "INSERT INTO platform_links (track_id, platform, external_id, external_uri, \
             metadata, last_synced_at, needs_refresh, match_confidence) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(track_id)
        .bind(platform)
        .bind(external_id)
        .bind(external_uri)
        .bind(&metadata)
        .bind(Utc::now())
        .bind(match_confidence)
        .execute(&mut *conn)
        .await?;

        self.link_by_id_tx(conn, result.last_insert_rowid()).await
    }

    async fn link_by_id_tx(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<PlatformLink> {
        let link = sqlx::query_as::<_, PlatformLink>(&format!(
            "SELECT {} FROM platform_links WHERE id = ?",
            LINK_COLUMNS
        ))
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(link)
    }

    pub async fn link_for_track(
        &self,
        track_id: i64,
        platform: Platform,
    ) -> Result<Option<PlatformLink>> {
        let link = sqlx::query_as::<_, PlatformLink>(&format!(
            "SELECT {} FROM platform_links WHERE track_id = ? AND platform = ?",
            LINK_COLUMNS
        ))
        .bind(track_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;
        Ok(link)
    }

    /// All links for one platform, loaded in a single query.
    pub async fn platform_links(&self, platform: Platform) -> Result<Vec<PlatformLink>> {
        let links = sqlx::query_as::<_, PlatformLink>(&format!(
            "SELECT {} FROM platform_links WHERE platform = ?",
            LINK_COLUMNS
        ))
        .bind(platform)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    /// All links for one platform as an external_id -> track_id map, loaded
    /// in a single query.
    pub async fn links_for_platform(&self, platform: Platform) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT external_id, track_id FROM platform_links WHERE platform = ?")
                .bind(platform)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Explicit unlink. Returns false when no link existed.
    pub async fn delete_link(&self, track_id: i64, platform: Platform) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM platform_links WHERE track_id = ? AND platform = ?")
                .bind(track_id)
                .bind(platform)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_link_needs_refresh_tx(
        &self,
        conn: &mut SqliteConnection,
        track_id: i64,
        platform: Platform,
        needs_refresh: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE platform_links SET needs_refresh = ? WHERE track_id = ? AND platform = ?",
        )
        .bind(needs_refresh)
        .bind(track_id)
        .bind(platform)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    // Bindings

    pub async fn create_binding(
        &self,
        playlist_id: i64,
        platform: Platform,
        external_playlist_id: &str,
        sync_mode: SyncMode,
        is_personal: bool,
    ) -> Result<PlaylistPlatformBinding> {
        let playlist = self
            .get_playlist(playlist_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("playlist {}", playlist_id)))?;
        if playlist.is_folder() {
            return Err(SyncError::conflict("folders cannot be bound to a platform"));
        }
        if playlist.is_system {
            return Err(SyncError::not_permitted(
                "the system collection is local-only and cannot be bound",
            ));
        }

        let result = sqlx::query(
            "INSERT INTO playlist_platform_bindings \
             (playlist_id, platform, external_playlist_id, sync_mode, is_personal) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(playlist_id)
        .bind(platform)
        .bind(external_playlist_id)
        .bind(sync_mode)
        .bind(is_personal)
        .execute(&self.pool)
        .await?;

        self.get_binding(result.last_insert_rowid())
            .await?
            .ok_or_else(|| SyncError::not_found("binding just created"))
    }

    pub async fn get_binding(&self, id: i64) -> Result<Option<PlaylistPlatformBinding>> {
        let binding = sqlx::query_as::<_, PlaylistPlatformBinding>(&format!(
            "SELECT {} FROM playlist_platform_bindings WHERE id = ?",
            BINDING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(binding)
    }

    pub async fn binding_for(
        &self,
        playlist_id: i64,
        platform: Platform,
    ) -> Result<Option<PlaylistPlatformBinding>> {
        let binding = sqlx::query_as::<_, PlaylistPlatformBinding>(&format!(
            "SELECT {} FROM playlist_platform_bindings WHERE playlist_id = ? AND platform = ?",
            BINDING_COLUMNS
        ))
        .bind(playlist_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;
        Ok(binding)
    }

    pub async fn list_bindings(&self) -> Result<Vec<PlaylistPlatformBinding>> {
        let bindings = sqlx::query_as::<_, PlaylistPlatformBinding>(&format!(
            "SELECT {} FROM playlist_platform_bindings ORDER BY id",
            BINDING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(bindings)
    }

    /// Record the remote playlist id once the first sync created it.
    pub async fn set_binding_external_id_tx(
        &self,
        conn: &mut SqliteConnection,
        binding_id: i64,
        external_playlist_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE playlist_platform_bindings SET external_playlist_id = ? WHERE id = ?")
            .bind(external_playlist_id)
            .bind(binding_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn touch_binding(&self, binding_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE playlist_platform_bindings SET last_synced_at = ? WHERE id = ?")
            .bind(at)
            .bind(binding_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_binding(&self, id: i64) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM snapshots WHERE binding_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM playlist_platform_bindings WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // Snapshot rows (document handling lives in the snapshot store)

    pub async fn snapshot_body(&self, binding_id: i64) -> Result<Option<String>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM snapshots WHERE binding_id = ?")
                .bind(binding_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(body)
    }

    pub async fn replace_snapshot_tx(
        &self,
        conn: &mut SqliteConnection,
        binding_id: i64,
        taken_at: DateTime<Utc>,
        body: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM snapshots WHERE binding_id = ?")
            .bind(binding_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO snapshots (binding_id, taken_at, body) VALUES (?, ?, ?)")
            .bind(binding_id)
            .bind(taken_at)
            .bind(body)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn clear_snapshot(&self, binding_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM snapshots WHERE binding_id = ?")
            .bind(binding_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Trim + NFC-normalize a required string field, rejecting empties.
fn clean_required(field: &str, raw: &str) -> Result<String> {
    let cleaned: String = raw.trim().nfc().collect();
    if cleaned.is_empty() {
        return Err(SyncError::conflict(format!("{} must be non-empty", field)));
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{initialize_database, DatabaseConfig};

    async fn repo() -> LibraryRepository {
        let pool = initialize_database(DatabaseConfig::default()).await.unwrap();
        LibraryRepository::new(pool)
    }

    async fn seed_playlist(repo: &LibraryRepository) -> Playlist {
        repo.create_playlist("Warehouse Set", PlaylistKind::Playlist, None)
            .await
            .unwrap()
    }

    async fn seed_track(repo: &LibraryRepository, title: &str) -> Track {
        repo.create_track(NewTrack::new(title, "Test Artist"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_track_rejects_blank_fields() {
        let repo = repo().await;
        let err = repo
            .create_track(NewTrack::new("   ", "Somebody"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));
    }

    #[tokio::test]
    async fn create_track_normalizes_title() {
        let repo = repo().await;
        // Decomposed "é" must be stored in composed form.
        let track = repo
            .create_track(NewTrack::new("Cafe\u{0301} del Mar  ", "Energy 52"))
            .await
            .unwrap();
        assert_eq!(track.title, "Café del Mar");
    }

    #[tokio::test]
    async fn content_hash_round_trips() {
        let repo = repo().await;
        let track = repo
            .create_track(NewTrack::new("Ripped", "Artist").with_content_hash("9f2c4a11d6"))
            .await
            .unwrap();
        assert_eq!(track.content_hash.as_deref(), Some("9f2c4a11d6"));
        assert!(repo
            .get_track(track.id)
            .await
            .unwrap()
            .unwrap()
            .content_hash
            .is_some());
    }

    #[tokio::test]
    async fn positions_stay_dense_through_mutations() {
        let repo = repo().await;
        let playlist = seed_playlist(&repo).await;
        let mut track_ids = Vec::new();
        for i in 0..5 {
            let track = seed_track(&repo, &format!("Track {}", i)).await;
            repo.add_member(playlist.id, track.id).await.unwrap();
            track_ids.push(track.id);
        }

        repo.remove_member(playlist.id, track_ids[1]).await.unwrap();
        repo.remove_member(playlist.id, track_ids[3]).await.unwrap();

        let members = repo.playlist_members(playlist.id).await.unwrap();
        let positions: Vec<i64> = members.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(
            members.iter().map(|m| m.track_id).collect::<Vec<_>>(),
            vec![track_ids[0], track_ids[2], track_ids[4]]
        );
    }

    #[tokio::test]
    async fn membership_mutations_are_idempotent() {
        let repo = repo().await;
        let playlist = seed_playlist(&repo).await;
        let track = seed_track(&repo, "Only Once").await;

        assert!(repo.add_member(playlist.id, track.id).await.unwrap());
        assert!(!repo.add_member(playlist.id, track.id).await.unwrap());
        assert!(repo.remove_member(playlist.id, track.id).await.unwrap());
        assert!(!repo.remove_member(playlist.id, track.id).await.unwrap());
    }

    #[tokio::test]
    async fn folders_refuse_tracks_and_bindings() {
        let repo = repo().await;
        let folder = repo
            .create_playlist("Crates", PlaylistKind::Folder, None)
            .await
            .unwrap();
        let track = seed_track(&repo, "Misfiled").await;

        assert!(matches!(
            repo.add_member(folder.id, track.id).await,
            Err(SyncError::Conflict { .. })
        ));
        assert!(matches!(
            repo.create_binding(folder.id, Platform::Spotify, "x", SyncMode::ImportOnly, true)
                .await,
            Err(SyncError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn external_identity_never_splits() {
        let repo = repo().await;
        let a = seed_track(&repo, "Original").await;
        let b = seed_track(&repo, "Impostor").await;

        repo.create_link(a.id, Platform::Spotify, "sp:1", None, serde_json::json!({}), 1.0)
            .await
            .unwrap();
        let err = repo
            .create_link(b.id, Platform::Spotify, "sp:1", None, serde_json::json!({}), 0.9)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));

        // One link per (track, platform) as well.
        let err = repo
            .create_link(a.id, Platform::Spotify, "sp:2", None, serde_json::json!({}), 0.9)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));

        // Re-upserting the same pair refreshes instead of failing.
        let link = repo
            .create_link(a.id, Platform::Spotify, "sp:1", None, serde_json::json!({}), 1.0)
            .await
            .unwrap();
        assert_eq!(link.track_id, a.id);
    }

    #[tokio::test]
    async fn soft_delete_refused_while_referenced() {
        let repo = repo().await;
        let playlist = seed_playlist(&repo).await;
        let track = seed_track(&repo, "Still Needed").await;
        repo.add_member(playlist.id, track.id).await.unwrap();

        assert!(matches!(
            repo.soft_delete_track(track.id).await,
            Err(SyncError::Conflict { .. })
        ));

        repo.remove_member(playlist.id, track.id).await.unwrap();
        repo.soft_delete_track(track.id).await.unwrap();
        let deleted = repo.get_track(track.id).await.unwrap().unwrap();
        assert!(deleted.deleted_at.is_some());
    }

    #[tokio::test]
    async fn system_collection_is_protected() {
        let repo = repo().await;
        let system = repo.ensure_system_collection().await.unwrap();
        assert!(system.is_system);

        // Second call returns the same row.
        let again = repo.ensure_system_collection().await.unwrap();
        assert_eq!(system.id, again.id);

        assert!(matches!(
            repo.rename_playlist(system.id, "My Stuff").await,
            Err(SyncError::NotPermitted { .. })
        ));
        assert!(matches!(
            repo.delete_playlist(system.id).await,
            Err(SyncError::NotPermitted { .. })
        ));
        assert!(matches!(
            repo.create_binding(system.id, Platform::Discogs, "", SyncMode::ImportOnly, true)
                .await,
            Err(SyncError::NotPermitted { .. })
        ));
    }

    #[tokio::test]
    async fn playlist_cycles_are_rejected() {
        let repo = repo().await;
        let a = repo
            .create_playlist("A", PlaylistKind::Folder, None)
            .await
            .unwrap();
        let b = repo
            .create_playlist("B", PlaylistKind::Folder, Some(a.id))
            .await
            .unwrap();

        assert!(matches!(
            repo.move_playlist(a.id, Some(b.id)).await,
            Err(SyncError::Conflict { .. })
        ));
        // Self-parenting is the smallest cycle.
        assert!(matches!(
            repo.move_playlist(a.id, Some(a.id)).await,
            Err(SyncError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn binding_uniqueness_is_enforced() {
        let repo = repo().await;
        let playlist = seed_playlist(&repo).await;
        let other = repo
            .create_playlist("Other", PlaylistKind::Playlist, None)
            .await
            .unwrap();

        repo.create_binding(
            playlist.id,
            Platform::Spotify,
            "sp:pl:1",
            SyncMode::FullBidirectional,
            true,
        )
        .await
        .unwrap();

        // Same playlist+platform.
        assert!(matches!(
            repo.create_binding(playlist.id, Platform::Spotify, "sp:pl:2", SyncMode::AddOnly, true)
                .await,
            Err(SyncError::Conflict { .. })
        ));
        // Same platform+external playlist.
        assert!(matches!(
            repo.create_binding(other.id, Platform::Spotify, "sp:pl:1", SyncMode::AddOnly, true)
                .await,
            Err(SyncError::Conflict { .. })
        ));
        // Two bindings may both await remote creation.
        repo.create_binding(other.id, Platform::Youtube, "", SyncMode::AddOnly, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn search_filters_by_text_and_platform_presence() {
        let repo = repo().await;
        let linked = seed_track(&repo, "Linked Anthem").await;
        let _unlinked = seed_track(&repo, "Unlinked Anthem").await;
        repo.create_link(
            linked.id,
            Platform::Rekordbox,
            "rb:1",
            None,
            serde_json::json!({}),
            1.0,
        )
        .await
        .unwrap();

        let by_text = repo
            .search_tracks(&TrackSearch {
                text: Some("Anthem".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_text.len(), 2);

        let by_platform = repo
            .search_tracks(&TrackSearch {
                text: Some("Anthem".into()),
                present_on: Some(Platform::Rekordbox),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_platform.len(), 1);
        assert_eq!(by_platform[0].id, linked.id);
    }
}
