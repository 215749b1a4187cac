//! In-memory platform adapter for tests and front-end development.
//!
//! Behaves like a small, well-behaved remote service: a searchable catalog,
//! owned and shared playlists, idempotent membership mutations, and a
//! scriptable failure queue for exercising retry and abort paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use crate::models::{BatchOutcome, CapabilityFlags, ExtPlaylist, ExtTrack, Platform};
use crate::services::adapter::{CredentialProvider, PlatformAdapter, TrackQuery};

/// Credential provider that always returns the same token
pub struct StaticCredentials(pub String);

impl CredentialProvider for StaticCredentials {
    fn access_token(&self, _platform: Platform) -> Option<String> {
        Some(self.0.clone())
    }
}

#[derive(Debug, Clone)]
struct StubPlaylist {
    name: String,
    owned_by_user: bool,
    tracks: Vec<ExtTrack>,
}

#[derive(Default)]
struct StubState {
    playlists: HashMap<String, StubPlaylist>,
    catalog: Vec<ExtTrack>,
}

/// A deterministic fake platform
pub struct InMemoryAdapter {
    platform: Platform,
    capabilities: CapabilityFlags,
    authenticated: AtomicBool,
    state: Mutex<StubState>,
    scripted_failures: Mutex<VecDeque<SyncError>>,
    next_playlist: AtomicU64,
    pub mutation_calls: AtomicU32,
}

impl InMemoryAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            capabilities: CapabilityFlags::default(),
            authenticated: AtomicBool::new(true),
            state: Mutex::new(StubState::default()),
            scripted_failures: Mutex::new(VecDeque::new()),
            next_playlist: AtomicU64::new(1),
            mutation_calls: AtomicU32::new(0),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityFlags) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Seed the searchable catalog.
    pub fn seed_catalog(&self, tracks: Vec<ExtTrack>) {
        self.state.lock().unwrap().catalog.extend(tracks);
    }

    /// Seed a remote playlist with members.
    pub fn seed_playlist(
        &self,
        external_id: &str,
        name: &str,
        owned_by_user: bool,
        tracks: Vec<ExtTrack>,
    ) {
        self.state.lock().unwrap().playlists.insert(
            external_id.to_string(),
            StubPlaylist {
                name: name.to_string(),
                owned_by_user,
                tracks,
            },
        );
    }

    /// Current members of one remote playlist, for assertions.
    pub fn playlist_track_ids(&self, external_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .playlists
            .get(external_id)
            .map(|p| p.tracks.iter().map(|t| t.external_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Queue an error to be returned by the next mutating call.
    pub fn push_failure(&self, error: SyncError) {
        self.scripted_failures.lock().unwrap().push_back(error);
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::SeqCst);
    }

    fn take_scripted_failure(&self) -> Option<SyncError> {
        self.scripted_failures.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl PlatformAdapter for InMemoryAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    fn authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn authenticate(&self) -> Result<()> {
        if self.authenticated() {
            Ok(())
        } else {
            Err(SyncError::AuthFailed {
                platform: self.platform,
                message: "stub configured as unauthenticated".into(),
            })
        }
    }

    async fn list_playlists(&self) -> Result<Vec<ExtPlaylist>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .playlists
            .iter()
            .map(|(id, p)| ExtPlaylist {
                external_id: id.clone(),
                name: p.name.clone(),
                description: None,
                owned_by_user: p.owned_by_user,
                track_count: p.tracks.len(),
            })
            .collect())
    }

    async fn fetch_playlist_tracks(&self, external_playlist_id: &str) -> Result<Vec<ExtTrack>> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        state
            .playlists
            .get(external_playlist_id)
            .map(|p| p.tracks.clone())
            .ok_or_else(|| SyncError::not_found(format!("playlist {}", external_playlist_id)))
    }

    async fn create_playlist(&self, name: &str, _description: &str, _private: bool) -> Result<String> {
        if !self.capabilities.can_create {
            return Err(SyncError::not_permitted(format!(
                "{} cannot create playlists",
                self.platform
            )));
        }
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        let id = format!(
            "{}:pl:{}",
            self.platform,
            self.next_playlist.fetch_add(1, Ordering::SeqCst)
        );
        self.state.lock().unwrap().playlists.insert(
            id.clone(),
            StubPlaylist {
                name: name.to_string(),
                owned_by_user: true,
                tracks: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn add_tracks(
        &self,
        external_playlist_id: &str,
        external_track_ids: &[String],
    ) -> Result<BatchOutcome> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }

        let mut outcome = BatchOutcome::default();
        let mut state = self.state.lock().unwrap();
        let additions: Vec<(String, Option<ExtTrack>)> = external_track_ids
            .iter()
            .map(|id| {
                let found = state
                    .catalog
                    .iter()
                    .find(|t| &t.external_id == id)
                    .cloned();
                (id.clone(), found)
            })
            .collect();
        let playlist = state
            .playlists
            .get_mut(external_playlist_id)
            .ok_or_else(|| SyncError::not_found(format!("playlist {}", external_playlist_id)))?;

        for (id, found) in additions {
            match found {
                Some(track) => {
                    // Adding an already-present member is a no-op.
                    if !playlist.tracks.iter().any(|t| t.external_id == id) {
                        playlist.tracks.push(track);
                    }
                    outcome.succeeded.push(id);
                }
                None => outcome.failed.push(crate::models::BatchItemFailure {
                    external_id: id,
                    reason: "unknown track id".into(),
                }),
            }
        }
        Ok(outcome)
    }

    async fn remove_tracks(
        &self,
        external_playlist_id: &str,
        external_track_ids: &[String],
    ) -> Result<BatchOutcome> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }

        let mut state = self.state.lock().unwrap();
        let playlist = state
            .playlists
            .get_mut(external_playlist_id)
            .ok_or_else(|| SyncError::not_found(format!("playlist {}", external_playlist_id)))?;
        if !playlist.owned_by_user && !self.capabilities.can_modify_shared {
            return Err(SyncError::not_permitted(
                "cannot remove tracks from a playlist the user does not own",
            ));
        }

        let mut outcome = BatchOutcome::default();
        for id in external_track_ids {
            // Removing an absent member is a no-op, not an error.
            playlist.tracks.retain(|t| &t.external_id != id);
            outcome.succeeded.push(id.clone());
        }
        Ok(outcome)
    }

    async fn search(&self, query: &TrackQuery, limit: usize) -> Result<Vec<ExtTrack>> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        let title = query.title.to_lowercase();
        let artist = query.artist.to_lowercase();
        let state = self.state.lock().unwrap();
        Ok(state
            .catalog
            .iter()
            .filter(|t| {
                t.title.to_lowercase().contains(&title)
                    || title.contains(&t.title.to_lowercase())
            })
            .filter(|t| {
                artist.is_empty()
                    || t.artist.to_lowercase().contains(&artist)
                    || artist.contains(&t.artist.to_lowercase())
            })
            .take(limit)
            .cloned()
            .collect())
    }
}
