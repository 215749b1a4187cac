//! Three-way diff between current library membership, current platform
//! membership, and the snapshot taken at the last successful sync.
//!
//! The snapshot is what separates "the user removed this locally" from "the
//! platform added this remotely": membership differences are classified
//! against it, never against the other live side.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::models::{ExtTrack, PlatformLink, PlaylistPlatformBinding, Snapshot, Track};
use crate::services::adapter::{PlatformAdapter, TrackQuery};
use crate::services::matching::{LocalTrackFacts, MatchDecision, TrackMatcher};
use crate::services::rate_limiter::AdapterRateLimiter;
use crate::services::repository::{LibraryRepository, TrackSearch};
use crate::services::snapshot_store::SnapshotStore;

/// How many library candidates to consider per unlinked remote track.
const LOCAL_CANDIDATE_LIMIT: i64 = 25;
/// How many remote results to request per unlinked library track.
const REMOTE_SEARCH_LIMIT: usize = 10;

/// A platform member that appeared since the snapshot
#[derive(Debug, Clone)]
pub struct RemoteAddition {
    pub track: ExtTrack,
    /// Library track this remote member resolved to, if any.
    pub resolved_track_id: Option<i64>,
    pub match_confidence: Option<f64>,
    pub needs_confirmation: bool,
    /// True when the resolution came from an existing link rather than
    /// matching.
    pub already_linked: bool,
}

/// A library member that appeared since the snapshot
#[derive(Debug, Clone)]
pub struct LocalAddition {
    pub track_id: i64,
    pub title: String,
    /// Remote counterpart: the linked external id, or the best search
    /// proposal.
    pub external_id: Option<String>,
    pub proposed_remote: Option<ExtTrack>,
    pub match_confidence: Option<f64>,
    pub needs_confirmation: bool,
    pub already_linked: bool,
}

/// A library member gone since the snapshot
#[derive(Debug, Clone)]
pub struct LocalRemoval {
    pub track_id: i64,
    pub title: Option<String>,
    /// Recovered from the live link or, when the link is already gone, from
    /// the snapshot's link pairs.
    pub external_id: Option<String>,
}

/// A platform member gone since the snapshot
#[derive(Debug, Clone)]
pub struct RemoteRemoval {
    pub external_id: String,
    pub track_id: Option<i64>,
}

/// A linked track whose metadata diverged beyond the matching threshold
#[derive(Debug, Clone)]
pub struct MetadataConflict {
    pub track_id: i64,
    pub local_title: String,
    pub remote: ExtTrack,
    pub confidence: f64,
}

/// Output of one detection pass over a binding
#[derive(Debug, Clone)]
pub struct MembershipDiff {
    pub binding_id: i64,
    /// Ordered membership as observed during this pass.
    pub current_library: Vec<i64>,
    pub current_platform: Vec<String>,
    pub platform_added: Vec<RemoteAddition>,
    pub platform_removed: Vec<RemoteRemoval>,
    pub library_added: Vec<LocalAddition>,
    pub library_removed: Vec<LocalRemoval>,
    pub conflicts: Vec<MetadataConflict>,
    pub unchanged_count: usize,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.platform_added.is_empty()
            && self.platform_removed.is_empty()
            && self.library_added.is_empty()
            && self.library_removed.is_empty()
            && self.conflicts.is_empty()
    }
}

/// Computes membership diffs for one binding at a time
pub struct ChangeDetector {
    repo: Arc<LibraryRepository>,
    snapshots: Arc<SnapshotStore>,
    matcher: Arc<TrackMatcher>,
    limiter: Arc<AdapterRateLimiter>,
}

impl ChangeDetector {
    pub fn new(
        repo: Arc<LibraryRepository>,
        snapshots: Arc<SnapshotStore>,
        matcher: Arc<TrackMatcher>,
        limiter: Arc<AdapterRateLimiter>,
    ) -> Self {
        Self {
            repo,
            snapshots,
            matcher,
            limiter,
        }
    }

    pub async fn detect(
        &self,
        binding: &PlaylistPlatformBinding,
        adapter: &dyn PlatformAdapter,
        cancel: &CancellationToken,
    ) -> Result<MembershipDiff> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let platform = binding.platform;

        // 1. Current membership on both sides. A binding whose remote
        //    counterpart does not exist yet has an empty platform side.
        let library_ids = self.repo.member_track_ids(binding.playlist_id).await?;
        let platform_tracks: Vec<ExtTrack> = if binding.has_remote_counterpart() {
            self.limiter
                .execute_with_retry(platform, cancel, || {
                    adapter.fetch_playlist_tracks(&binding.external_playlist_id)
                })
                .await?
        } else {
            Vec::new()
        };

        // 2. Snapshot from the last successful sync; first syncs diff
        //    against emptiness and classify everything as additions.
        let snapshot = self
            .snapshots
            .latest(binding.id)
            .await?
            .unwrap_or_else(|| Snapshot::empty(binding.id));

        // 3. Identity resolution state for this platform.
        let links = self.repo.platform_links(platform).await?;
        let link_by_external: HashMap<&str, &PlatformLink> =
            links.iter().map(|l| (l.external_id.as_str(), l)).collect();
        let link_by_track: HashMap<i64, &PlatformLink> =
            links.iter().map(|l| (l.track_id, l)).collect();

        let library_set: HashSet<i64> = library_ids.iter().copied().collect();
        let platform_set: HashSet<&str> =
            platform_tracks.iter().map(|t| t.external_id.as_str()).collect();
        let snapshot_library: HashSet<i64> = snapshot.library_members.iter().copied().collect();
        let snapshot_platform: HashSet<&str> =
            snapshot.platform_members.iter().map(String::as_str).collect();

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // 4. Platform additions: in P, not in the snapshot's platform side.
        let mut platform_added = Vec::new();
        for ext in &platform_tracks {
            if snapshot_platform.contains(ext.external_id.as_str()) {
                continue;
            }
            platform_added.push(self.resolve_remote(ext, &link_by_external).await?);
        }

        // 5. Platform removals, recovering local ids through live links
        //    first and snapshot pairs second.
        let mut platform_removed = Vec::new();
        for ext_id in &snapshot.platform_members {
            if platform_set.contains(ext_id.as_str()) {
                continue;
            }
            let track_id = link_by_external
                .get(ext_id.as_str())
                .map(|l| l.track_id)
                .or_else(|| snapshot.link_pairs.get(ext_id).copied());
            platform_removed.push(RemoteRemoval {
                external_id: ext_id.clone(),
                track_id,
            });
        }

        // 6. Library additions, proposing remote counterparts through the
        //    adapter's catalog search for unlinked tracks. Searches run
        //    concurrently; the rate limiter serializes actual wire calls.
        let mut library_added = Vec::new();
        let mut to_search: Vec<Track> = Vec::new();
        for track_id in &library_ids {
            if snapshot_library.contains(track_id) {
                continue;
            }
            let track = self
                .repo
                .get_track(*track_id)
                .await?
                .ok_or_else(|| SyncError::not_found(format!("track {}", track_id)))?;
            if let Some(link) = link_by_track.get(track_id) {
                library_added.push(LocalAddition {
                    track_id: *track_id,
                    title: track.title,
                    external_id: Some(link.external_id.clone()),
                    proposed_remote: None,
                    match_confidence: Some(link.match_confidence),
                    needs_confirmation: false,
                    already_linked: true,
                });
            } else {
                to_search.push(track);
            }
        }

        let searches = to_search.iter().map(|track| {
            let query = TrackQuery {
                title: track.title.clone(),
                artist: track.primary_artist.clone(),
                album: track.album.clone(),
            };
            async move {
                self.limiter
                    .execute_with_retry(platform, cancel, || {
                        adapter.search(&query, REMOTE_SEARCH_LIMIT)
                    })
                    .await
            }
        });
        let search_results = join_all(searches).await;

        for (track, result) in to_search.iter().zip(search_results) {
            let candidates = match result {
                Ok(candidates) => candidates,
                Err(err) if err.is_job_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        track_id = track.id,
                        error = %err,
                        "remote search failed, leaving track unproposed"
                    );
                    Vec::new()
                }
            };
            // Never propose an external id that is already bound to another
            // local track.
            let free: Vec<ExtTrack> = candidates
                .into_iter()
                .filter(|c| !link_by_external.contains_key(c.external_id.as_str()))
                .collect();
            let facts = LocalTrackFacts::from(track);
            let proposal = self.matcher.best_match(&facts, &free);
            let (external_id, proposed_remote, confidence, needs_confirmation) = match proposal {
                Some((ext, outcome)) if outcome.decision == MatchDecision::Auto => (
                    Some(ext.external_id.clone()),
                    Some(ext.clone()),
                    Some(outcome.confidence),
                    false,
                ),
                Some((ext, outcome)) => (
                    Some(ext.external_id.clone()),
                    Some(ext.clone()),
                    Some(outcome.confidence),
                    true,
                ),
                None => (None, None, None, false),
            };
            library_added.push(LocalAddition {
                track_id: track.id,
                title: track.title.clone(),
                external_id,
                proposed_remote,
                match_confidence: confidence,
                needs_confirmation,
                already_linked: false,
            });
        }

        // 7. Library removals. The link may already be gone; the snapshot's
        //    pairs still identify the remote counterpart.
        let mut library_removed = Vec::new();
        for track_id in &snapshot.library_members {
            if library_set.contains(track_id) {
                continue;
            }
            let external_id = link_by_track
                .get(track_id)
                .map(|l| l.external_id.clone())
                .or_else(|| {
                    snapshot
                        .link_pairs
                        .iter()
                        .find(|(_, t)| *t == track_id)
                        .map(|(e, _)| e.clone())
                });
            let title = self.repo.get_track(*track_id).await?.map(|t| t.title);
            library_removed.push(LocalRemoval {
                track_id: *track_id,
                title,
                external_id,
            });
        }

        // 8. Conflicts: linked tracks present on both sides and in the
        //    snapshot whose metadata no longer agrees within the auto
        //    threshold.
        let mut conflicts = Vec::new();
        let mut unchanged_count = 0;
        for ext in &platform_tracks {
            if !snapshot_platform.contains(ext.external_id.as_str()) {
                continue;
            }
            let Some(link) = link_by_external.get(ext.external_id.as_str()) else {
                continue;
            };
            if !library_set.contains(&link.track_id)
                || !snapshot_library.contains(&link.track_id)
            {
                continue;
            }
            let Some(track) = self.repo.get_track(link.track_id).await? else {
                continue;
            };
            let mut facts = LocalTrackFacts::from(&track);
            facts.isrc = link.isrc().map(str::to_string);
            facts.release_ref = link.release_ref().map(str::to_string);
            let outcome = self.matcher.score(&facts, ext);
            if outcome.decision == MatchDecision::Auto {
                unchanged_count += 1;
            } else {
                conflicts.push(MetadataConflict {
                    track_id: track.id,
                    local_title: track.title,
                    remote: ext.clone(),
                    confidence: outcome.confidence,
                });
            }
        }

        let diff = MembershipDiff {
            binding_id: binding.id,
            current_library: library_ids,
            current_platform: platform_tracks
                .iter()
                .map(|t| t.external_id.clone())
                .collect(),
            platform_added,
            platform_removed,
            library_added,
            library_removed,
            conflicts,
            unchanged_count,
        };
        tracing::debug!(
            binding_id = binding.id,
            platform_added = diff.platform_added.len(),
            platform_removed = diff.platform_removed.len(),
            library_added = diff.library_added.len(),
            library_removed = diff.library_removed.len(),
            conflicts = diff.conflicts.len(),
            unchanged = diff.unchanged_count,
            "membership diff computed"
        );
        Ok(diff)
    }

    /// Resolve one unsnapshotted remote member to a library track: existing
    /// link first, fuzzy matching against a candidate pool second.
    async fn resolve_remote(
        &self,
        ext: &ExtTrack,
        link_by_external: &HashMap<&str, &PlatformLink>,
    ) -> Result<RemoteAddition> {
        if let Some(link) = link_by_external.get(ext.external_id.as_str()) {
            return Ok(RemoteAddition {
                track: ext.clone(),
                resolved_track_id: Some(link.track_id),
                match_confidence: Some(link.match_confidence),
                needs_confirmation: false,
                already_linked: true,
            });
        }

        let linked_tracks: HashSet<i64> =
            link_by_external.values().map(|l| l.track_id).collect();
        let candidates = self
            .repo
            .search_tracks(&TrackSearch {
                text: Some(ext.title.clone()),
                present_on: None,
                limit: Some(LOCAL_CANDIDATE_LIMIT),
            })
            .await?;

        let mut best: Option<(i64, f64, MatchDecision)> = None;
        for candidate in candidates {
            // A track already linked on this platform cannot absorb a second
            // external identity.
            if linked_tracks.contains(&candidate.id) {
                continue;
            }
            let outcome = self.matcher.score(&LocalTrackFacts::from(&candidate), ext);
            if outcome.decision == MatchDecision::NoMatch {
                continue;
            }
            let better = match &best {
                None => true,
                Some((id, confidence, _)) => {
                    outcome.confidence > *confidence
                        || (outcome.confidence == *confidence && candidate.id < *id)
                }
            };
            if better {
                best = Some((candidate.id, outcome.confidence, outcome.decision));
            }
        }

        Ok(match best {
            Some((track_id, confidence, MatchDecision::Auto)) => RemoteAddition {
                track: ext.clone(),
                resolved_track_id: Some(track_id),
                match_confidence: Some(confidence),
                needs_confirmation: false,
                already_linked: false,
            },
            Some((track_id, confidence, _)) => RemoteAddition {
                track: ext.clone(),
                resolved_track_id: Some(track_id),
                match_confidence: Some(confidence),
                needs_confirmation: true,
                already_linked: false,
            },
            None => RemoteAddition {
                track: ext.clone(),
                resolved_track_id: None,
                match_confidence: None,
                needs_confirmation: false,
                already_linked: false,
            },
        })
    }
}
