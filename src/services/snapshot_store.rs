//! Persistence of per-binding membership snapshots.
//!
//! Replace-only: a successful sync swaps the previous snapshot for a new one
//! atomically inside the executor's transaction. Snapshots are the only
//! history the change detector compares against.

use std::sync::Arc;

use sqlx::SqliteConnection;

use crate::error::Result;
use crate::models::Snapshot;
use crate::services::repository::LibraryRepository;

pub struct SnapshotStore {
    repo: Arc<LibraryRepository>,
}

impl SnapshotStore {
    pub fn new(repo: Arc<LibraryRepository>) -> Self {
        Self { repo }
    }

    /// The snapshot taken at the last successful sync, if any. Documents
    /// with a newer schema version than this build understands are refused.
    pub async fn latest(&self, binding_id: i64) -> Result<Option<Snapshot>> {
        match self.repo.snapshot_body(binding_id).await? {
            Some(body) => Ok(Some(Snapshot::decode(&body)?)),
            None => Ok(None),
        }
    }

    /// Replace the snapshot for a binding inside the caller's transaction.
    pub async fn replace_tx(
        &self,
        conn: &mut SqliteConnection,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let body = snapshot.encode()?;
        self.repo
            .replace_snapshot_tx(conn, snapshot.binding_id, snapshot.taken_at, &body)
            .await?;
        tracing::debug!(
            binding_id = snapshot.binding_id,
            library = snapshot.library_members.len(),
            platform = snapshot.platform_members.len(),
            "snapshot replaced"
        );
        Ok(())
    }

    pub async fn clear(&self, binding_id: i64) -> Result<()> {
        self.repo.clear_snapshot(binding_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{initialize_database, DatabaseConfig};
    use crate::models::{NewTrack, Platform, PlaylistKind, SyncMode};
    use std::collections::HashMap;

    async fn store() -> (Arc<LibraryRepository>, SnapshotStore, i64) {
        let pool = initialize_database(DatabaseConfig::default()).await.unwrap();
        let repo = Arc::new(LibraryRepository::new(pool));
        let playlist = repo
            .create_playlist("Peak Time", PlaylistKind::Playlist, None)
            .await
            .unwrap();
        let binding = repo
            .create_binding(
                playlist.id,
                Platform::Spotify,
                "sp:pl:1",
                SyncMode::FullBidirectional,
                true,
            )
            .await
            .unwrap();
        (repo.clone(), SnapshotStore::new(repo), binding.id)
    }

    #[tokio::test]
    async fn replace_swaps_the_previous_snapshot() {
        let (repo, store, binding_id) = store().await;
        let track = repo
            .create_track(NewTrack::new("Opener", "Someone"))
            .await
            .unwrap();

        assert!(store.latest(binding_id).await.unwrap().is_none());

        let first = Snapshot::new(binding_id, vec![track.id], vec!["e1".into()], HashMap::new());
        let mut tx = repo.begin().await.unwrap();
        store.replace_tx(&mut tx, &first).await.unwrap();
        tx.commit().await.unwrap();

        let mut pairs = HashMap::new();
        pairs.insert("e2".to_string(), track.id);
        let second = Snapshot::new(binding_id, vec![track.id], vec!["e2".into()], pairs);
        let mut tx = repo.begin().await.unwrap();
        store.replace_tx(&mut tx, &second).await.unwrap();
        tx.commit().await.unwrap();

        let latest = store.latest(binding_id).await.unwrap().unwrap();
        assert_eq!(latest.platform_members, vec!["e2"]);
        assert_eq!(latest.link_pairs.get("e2"), Some(&track.id));

        store.clear(binding_id).await.unwrap();
        assert!(store.latest(binding_id).await.unwrap().is_none());
    }
}
