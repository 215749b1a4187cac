//! Applies a (possibly user-filtered) sync plan.
//!
//! Local repository mutations for one sync run inside a single transaction;
//! remote mutations are batched per the adapter's capability flags and are
//! not transactional. Per-item remote failures mark just that change failed
//! and leave its local part uncommitted; job-fatal failures roll everything
//! back and keep the previous snapshot. On full success the executor commits,
//! re-fetches remote membership once, and records a fresh snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqliteConnection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{
    ChangeKind, ConflictResolution, ExtTrack, NewTrack, Platform, Playlist,
    PlaylistPlatformBinding, ProgressEvent, ProgressState, Snapshot, SyncChange, SyncDirection,
    SyncPlan, SyncSummary,
};
use crate::services::adapter::PlatformAdapter;
use crate::services::rate_limiter::AdapterRateLimiter;
use crate::services::repository::LibraryRepository;
use crate::services::safety_gate::{RejectionSeverity, SafetyGate};
use crate::services::snapshot_store::SnapshotStore;

/// Deterministic application order, chosen to minimize remote churn.
fn phase_rank(change: &SyncChange) -> u8 {
    match (change.kind, change.direction) {
        (ChangeKind::Link, _) => 0,
        (ChangeKind::Add, SyncDirection::PlatformToLibrary) => 1,
        (ChangeKind::Add, SyncDirection::LibraryToPlatform) => 2,
        (ChangeKind::Remove, SyncDirection::LibraryToPlatform) => 3,
        (ChangeKind::Remove, SyncDirection::PlatformToLibrary) => 4,
        (ChangeKind::Conflict, _) => 5,
    }
}

pub struct SyncExecutor {
    config: Arc<SyncConfig>,
    repo: Arc<LibraryRepository>,
    snapshots: Arc<SnapshotStore>,
    gate: Arc<SafetyGate>,
    limiter: Arc<AdapterRateLimiter>,
}

impl SyncExecutor {
    pub fn new(
        config: Arc<SyncConfig>,
        repo: Arc<LibraryRepository>,
        snapshots: Arc<SnapshotStore>,
        gate: Arc<SafetyGate>,
        limiter: Arc<AdapterRateLimiter>,
    ) -> Self {
        Self {
            config,
            repo,
            snapshots,
            gate,
            limiter,
        }
    }

    /// Apply the selected subset of a plan. Every progress update and the
    /// terminal outcome flow through `progress`; the returned summary
    /// duplicates the terminal event for direct callers.
    pub async fn apply(
        &self,
        binding: &PlaylistPlatformBinding,
        playlist: &Playlist,
        adapter: &dyn PlatformAdapter,
        plan: &SyncPlan,
        selection: Option<&HashSet<String>>,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let started = std::time::Instant::now();
        match self
            .apply_inner(binding, playlist, adapter, plan, selection, progress, cancel)
            .await
        {
            Ok(summary) => {
                tracing::info!(
                    binding_id = binding.id,
                    applied = summary.applied_count,
                    skipped = summary.skipped_count,
                    failed = summary.failed_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sync apply finished"
                );
                emit(progress, ProgressEvent::finished(summary.clone())).await;
                Ok(summary)
            }
            Err(err) => {
                let state = match &err {
                    SyncError::Cancelled => ProgressState::Cancelled,
                    SyncError::Stopped => ProgressState::Stopped,
                    _ => ProgressState::Failed,
                };
                tracing::warn!(
                    binding_id = binding.id,
                    error = %err,
                    kind = err.kind(),
                    "sync apply aborted"
                );
                emit(progress, ProgressEvent::terminal(state, err.to_string())).await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_inner(
        &self,
        binding: &PlaylistPlatformBinding,
        playlist: &Playlist,
        adapter: &dyn PlatformAdapter,
        plan: &SyncPlan,
        selection: Option<&HashSet<String>>,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let platform = binding.platform;
        let capabilities = adapter.capabilities();
        let mut summary = SyncSummary::default();

        // 1. Selection: an explicit subset overrides the plan defaults.
        let mut selected = Vec::new();
        for change in &plan.changes {
            let wanted = match selection {
                Some(subset) => subset.contains(&change.change_id),
                None => change.user_selected,
            };
            if wanted {
                selected.push(change.clone());
            } else {
                let reason = if change.needs_confirmation {
                    "needs confirmation"
                } else {
                    "not selected"
                };
                summary.record(&change.change_id, ProgressState::Skipped, Some(reason.into()));
                emit(
                    progress,
                    ProgressEvent::change_with_message(
                        &change.change_id,
                        ProgressState::Skipped,
                        reason,
                    ),
                )
                .await;
            }
        }

        // 2. Safety gate.
        let verdict = self.gate.screen(playlist, binding, selected)?;
        for rejected in &verdict.rejected {
            let state = match rejected.severity {
                RejectionSeverity::Skip => ProgressState::Skipped,
                RejectionSeverity::Fail => ProgressState::Failed,
            };
            summary.record(&rejected.change.change_id, state, Some(rejected.reason.clone()));
            emit(
                progress,
                ProgressEvent::change_with_message(
                    &rejected.change.change_id,
                    state,
                    rejected.reason.clone(),
                ),
            )
            .await;
        }

        let mut changes = verdict.allowed;
        changes.sort_by_key(phase_rank);
        for change in &changes {
            emit(
                progress,
                ProgressEvent::change(&change.change_id, ProgressState::Pending),
            )
            .await;
        }

        // 3. One local transaction for every local mutation of this run,
        //    under the playlist's single-writer lock.
        let _writer = self.repo.lock_playlist(playlist.id).await;
        let mut tx = self.repo.begin().await?;
        let mut remote_playlist_id = binding.external_playlist_id.clone();

        for batch in group_batches(&changes, capabilities.max_batch_size) {
            self.check_interrupts(cancel)?;
            match batch {
                Batch::Single(change) => {
                    self.apply_single(
                        &mut tx,
                        binding,
                        playlist,
                        adapter,
                        change,
                        &mut remote_playlist_id,
                        &mut summary,
                        progress,
                        cancel,
                    )
                    .await?;
                }
                Batch::Remote(kind, chunk) => {
                    self.apply_remote_batch(
                        &mut tx,
                        platform,
                        adapter,
                        kind,
                        chunk,
                        &remote_playlist_id,
                        &mut summary,
                        progress,
                        cancel,
                    )
                    .await?;
                }
            }
        }

        self.check_interrupts(cancel)?;
        tx.commit().await?;

        // 4. Fresh snapshot, only when nothing failed: a failed change must
        //    re-surface in the next diff.
        if summary.failed_count == 0 {
            let platform_members: Vec<String> = if remote_playlist_id.is_empty() {
                Vec::new()
            } else {
                self.limiter
                    .execute_with_retry(platform, cancel, || {
                        adapter.fetch_playlist_tracks(&remote_playlist_id)
                    })
                    .await?
                    .into_iter()
                    .map(|t| t.external_id)
                    .collect()
            };
            let library_members = self.repo.member_track_ids(playlist.id).await?;
            let links = self.repo.links_for_platform(platform).await?;
            let link_pairs: HashMap<String, i64> = platform_members
                .iter()
                .filter_map(|ext| links.get(ext).map(|t| (ext.clone(), *t)))
                .collect();

            let snapshot = Snapshot::new(binding.id, library_members, platform_members, link_pairs);
            let mut tx = self.repo.begin().await?;
            self.snapshots.replace_tx(&mut tx, &snapshot).await?;
            tx.commit().await?;
            self.repo.touch_binding(binding.id, Utc::now()).await?;
        } else {
            tracing::warn!(
                binding_id = binding.id,
                failed = summary.failed_count,
                "snapshot left unchanged; failed changes will re-surface next sync"
            );
        }

        Ok(summary)
    }

    /// Apply one non-batchable change inside the local transaction.
    #[allow(clippy::too_many_arguments)]
    async fn apply_single(
        &self,
        tx: &mut SqliteConnection,
        binding: &PlaylistPlatformBinding,
        playlist: &Playlist,
        adapter: &dyn PlatformAdapter,
        change: &SyncChange,
        remote_playlist_id: &mut String,
        summary: &mut SyncSummary,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        emit(
            progress,
            ProgressEvent::change(&change.change_id, ProgressState::Running),
        )
        .await;

        let outcome: Result<Option<String>> = match (change.kind, change.direction) {
            (ChangeKind::Link, _) if change.track_id.is_none() => {
                self.create_remote_playlist(tx, binding, playlist, adapter, remote_playlist_id, cancel)
                    .await
            }
            (ChangeKind::Link, _) => self.apply_track_link(tx, binding.platform, change).await,
            (ChangeKind::Add, SyncDirection::PlatformToLibrary) => {
                self.apply_local_add(tx, binding.platform, playlist.id, change).await
            }
            (ChangeKind::Remove, SyncDirection::PlatformToLibrary) => match change.track_id {
                Some(track_id) => {
                    self.repo.remove_member_tx(&mut *tx, playlist.id, track_id).await?;
                    Ok(None)
                }
                None => Err(SyncError::not_found("no local counterpart for removal")),
            },
            (ChangeKind::Conflict, _) => self.apply_conflict(tx, binding.platform, change).await,
            // Outbound adds/removes are batched and never reach here.
            (kind, direction) => Err(SyncError::transient(format!(
                "unexpected single change {} {}",
                direction, kind
            ))),
        };

        match outcome {
            Ok(message) => {
                summary.record(&change.change_id, ProgressState::Succeeded, message.clone());
                emit(
                    progress,
                    ProgressEvent {
                        change_id: Some(change.change_id.clone()),
                        state: ProgressState::Succeeded,
                        message,
                        summary: None,
                    },
                )
                .await;
                Ok(())
            }
            Err(err) if err.is_job_fatal() => Err(err),
            Err(err) => {
                let state = if matches!(err, SyncError::NotFound { .. }) {
                    ProgressState::Skipped
                } else {
                    ProgressState::Failed
                };
                summary.record(&change.change_id, state, Some(err.to_string()));
                emit(
                    progress,
                    ProgressEvent::change_with_message(&change.change_id, state, err.to_string()),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn create_remote_playlist(
        &self,
        tx: &mut SqliteConnection,
        binding: &PlaylistPlatformBinding,
        playlist: &Playlist,
        adapter: &dyn PlatformAdapter,
        remote_playlist_id: &mut String,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        if !adapter.capabilities().can_create {
            return Err(SyncError::not_permitted(format!(
                "{} does not support playlist creation",
                binding.platform
            )));
        }
        let external_id = self
            .limiter
            .execute_with_retry(binding.platform, cancel, || {
                adapter.create_playlist(&playlist.name, "", true)
            })
            .await?;
        self.repo
            .set_binding_external_id_tx(&mut *tx, binding.id, &external_id)
            .await?;
        *remote_playlist_id = external_id.clone();
        Ok(Some(format!("created remote playlist {}", external_id)))
    }

    async fn apply_track_link(
        &self,
        tx: &mut SqliteConnection,
        platform: Platform,
        change: &SyncChange,
    ) -> Result<Option<String>> {
        let track_id = change
            .track_id
            .ok_or_else(|| SyncError::not_found("link change without a track"))?;
        let external_id = change
            .external_id
            .as_deref()
            .ok_or_else(|| SyncError::not_found("link change without an external id"))?;
        self.repo
            .upsert_link_tx(
                &mut *tx,
                track_id,
                platform,
                external_id,
                change.remote_track.as_ref().and_then(|t| t.uri.as_deref()),
                link_metadata(change.remote_track.as_ref()),
                change.match_confidence.unwrap_or(1.0),
            )
            .await?;
        Ok(None)
    }

    /// Import one remote member: attach it to its resolved track, or create
    /// a new local track from the remote metadata.
    async fn apply_local_add(
        &self,
        tx: &mut SqliteConnection,
        platform: Platform,
        playlist_id: i64,
        change: &SyncChange,
    ) -> Result<Option<String>> {
        let (track_id, created) = match change.track_id {
            Some(track_id) => (track_id, false),
            None => {
                let remote = change
                    .remote_track
                    .as_ref()
                    .ok_or_else(|| SyncError::not_found("no remote metadata to import"))?;
                let mut new_track = NewTrack::new(remote.title.clone(), remote.artist.clone());
                new_track.album = remote.album.clone();
                new_track.duration_ms = remote.duration_ms;
                new_track.content_hash = remote.content_hash.clone();
                (self.repo.create_track_tx(&mut *tx, new_track).await?, true)
            }
        };

        // A brand-new import is, by construction, exactly the remote track.
        if created {
            if let Some(external_id) = change.external_id.as_deref() {
                self.repo
                    .upsert_link_tx(
                        &mut *tx,
                        track_id,
                        platform,
                        external_id,
                        change.remote_track.as_ref().and_then(|t| t.uri.as_deref()),
                        link_metadata(change.remote_track.as_ref()),
                        1.0,
                    )
                    .await?;
            }
        }

        self.repo.add_member_tx(&mut *tx, playlist_id, track_id).await?;
        Ok(created.then(|| format!("imported as new track {}", track_id)))
    }

    async fn apply_conflict(
        &self,
        tx: &mut SqliteConnection,
        platform: Platform,
        change: &SyncChange,
    ) -> Result<Option<String>> {
        let track_id = change
            .track_id
            .ok_or_else(|| SyncError::not_found("conflict without a local track"))?;
        match change.conflict_resolution {
            None => Err(SyncError::not_found("conflict resolution not chosen")),
            Some(ConflictResolution::KeepLibrary) => {
                // Local metadata stands; the divergence is acknowledged.
                self.repo
                    .set_link_needs_refresh_tx(&mut *tx, track_id, platform, false)
                    .await?;
                Ok(Some("kept library metadata".into()))
            }
            Some(ConflictResolution::KeepPlatform) => {
                let remote = change
                    .remote_track
                    .as_ref()
                    .ok_or_else(|| SyncError::not_found("conflict without remote metadata"))?;
                self.repo
                    .update_track_metadata_tx(
                        &mut *tx,
                        track_id,
                        &remote.title,
                        &remote.artist,
                        remote.album.as_deref(),
                        remote.duration_ms,
                    )
                    .await?;
                self.repo
                    .set_link_needs_refresh_tx(&mut *tx, track_id, platform, false)
                    .await?;
                Ok(Some("took platform metadata".into()))
            }
        }
    }

    /// Apply one outbound batch (adds or removes) against the adapter,
    /// reporting per-item outcomes.
    #[allow(clippy::too_many_arguments)]
    async fn apply_remote_batch(
        &self,
        tx: &mut SqliteConnection,
        platform: Platform,
        adapter: &dyn PlatformAdapter,
        kind: ChangeKind,
        chunk: Vec<&SyncChange>,
        remote_playlist_id: &str,
        summary: &mut SyncSummary,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Changes with no remote counterpart cannot travel outbound.
        let (actionable, orphans): (Vec<&SyncChange>, Vec<&SyncChange>) =
            chunk.into_iter().partition(|c| c.external_id.is_some());
        for change in orphans {
            let reason = "no remote counterpart found";
            summary.record(&change.change_id, ProgressState::Skipped, Some(reason.into()));
            emit(
                progress,
                ProgressEvent::change_with_message(&change.change_id, ProgressState::Skipped, reason),
            )
            .await;
        }
        if actionable.is_empty() {
            return Ok(());
        }

        if remote_playlist_id.is_empty() {
            for change in actionable {
                let reason = "remote playlist was not created";
                summary.record(&change.change_id, ProgressState::Failed, Some(reason.into()));
                emit(
                    progress,
                    ProgressEvent::change_with_message(
                        &change.change_id,
                        ProgressState::Failed,
                        reason,
                    ),
                )
                .await;
            }
            return Ok(());
        }

        for change in &actionable {
            emit(
                progress,
                ProgressEvent::change(&change.change_id, ProgressState::Running),
            )
            .await;
        }
        let ids: Vec<String> = actionable
            .iter()
            .filter_map(|c| c.external_id.clone())
            .collect();

        let call = self
            .limiter
            .execute_with_retry(platform, cancel, || match kind {
                ChangeKind::Add => adapter.add_tracks(remote_playlist_id, &ids),
                _ => adapter.remove_tracks(remote_playlist_id, &ids),
            })
            .await;

        match call {
            Ok(outcome) => {
                let failures: HashMap<&str, &str> = outcome
                    .failed
                    .iter()
                    .map(|f| (f.external_id.as_str(), f.reason.as_str()))
                    .collect();
                for change in actionable {
                    let ext = change.external_id.as_deref().unwrap_or_default();
                    if let Some(reason) = failures.get(ext) {
                        summary.record(
                            &change.change_id,
                            ProgressState::Failed,
                            Some((*reason).to_string()),
                        );
                        emit(
                            progress,
                            ProgressEvent::change_with_message(
                                &change.change_id,
                                ProgressState::Failed,
                                *reason,
                            ),
                        )
                        .await;
                        continue;
                    }
                    // Successful export of a matched pair finalizes the link.
                    if kind == ChangeKind::Add {
                        if let (Some(track_id), Some(remote)) =
                            (change.track_id, change.remote_track.as_ref())
                        {
                            self.repo
                                .upsert_link_tx(
                                    &mut *tx,
                                    track_id,
                                    platform,
                                    ext,
                                    remote.uri.as_deref(),
                                    link_metadata(Some(remote)),
                                    change.match_confidence.unwrap_or(1.0),
                                )
                                .await?;
                        }
                    }
                    summary.record(&change.change_id, ProgressState::Succeeded, None);
                    emit(
                        progress,
                        ProgressEvent::change(&change.change_id, ProgressState::Succeeded),
                    )
                    .await;
                }
                Ok(())
            }
            Err(err @ SyncError::NotPermitted { .. }) => {
                for change in actionable {
                    summary.record(
                        &change.change_id,
                        ProgressState::Failed,
                        Some(err.to_string()),
                    );
                    emit(
                        progress,
                        ProgressEvent::change_with_message(
                            &change.change_id,
                            ProgressState::Failed,
                            err.to_string(),
                        ),
                    )
                    .await;
                }
                Ok(())
            }
            Err(err @ SyncError::NotFound { .. }) => {
                for change in actionable {
                    summary.record(
                        &change.change_id,
                        ProgressState::Skipped,
                        Some(err.to_string()),
                    );
                    emit(
                        progress,
                        ProgressEvent::change_with_message(
                            &change.change_id,
                            ProgressState::Skipped,
                            err.to_string(),
                        ),
                    )
                    .await;
                }
                Ok(())
            }
            // Auth failures, emergency stop, cancellation, and retry budget
            // exhaustion abort the whole job.
            Err(err) => Err(err),
        }
    }

    fn check_interrupts(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if self.gate.emergency_stop().is_engaged() {
            return Err(SyncError::Stopped);
        }
        Ok(())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

/// Work units: outbound adds/removes batch up to the adapter limit,
/// everything else applies one at a time.
enum Batch<'a> {
    Single(&'a SyncChange),
    Remote(ChangeKind, Vec<&'a SyncChange>),
}

fn group_batches(changes: &[SyncChange], max_batch_size: usize) -> Vec<Batch<'_>> {
    let max_batch_size = max_batch_size.max(1);
    let mut batches = Vec::new();
    let mut pending: Vec<&SyncChange> = Vec::new();
    let mut pending_kind = ChangeKind::Add;

    for change in changes {
        let batchable = change.direction == SyncDirection::LibraryToPlatform
            && matches!(change.kind, ChangeKind::Add | ChangeKind::Remove);
        if batchable {
            if !pending.is_empty() && (pending_kind != change.kind || pending.len() >= max_batch_size)
            {
                batches.push(Batch::Remote(pending_kind, std::mem::take(&mut pending)));
            }
            pending_kind = change.kind;
            pending.push(change);
        } else {
            if !pending.is_empty() {
                batches.push(Batch::Remote(pending_kind, std::mem::take(&mut pending)));
            }
            batches.push(Batch::Single(change));
        }
    }
    if !pending.is_empty() {
        batches.push(Batch::Remote(pending_kind, pending));
    }
    batches
}

fn link_metadata(remote: Option<&ExtTrack>) -> serde_json::Value {
    match remote {
        Some(track) if !track.raw.is_null() => track.raw.clone(),
        Some(track) => serde_json::to_value(track).unwrap_or_else(|_| serde_json::json!({})),
        None => serde_json::json!({}),
    }
}

async fn emit(progress: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) {
    // A dropped receiver means nobody is watching; the sync itself must not
    // fail over that.
    let _ = progress.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(kind: ChangeKind, direction: SyncDirection, id: &str) -> SyncChange {
        SyncChange {
            change_id: id.to_string(),
            binding_id: 1,
            direction,
            kind,
            track_id: Some(1),
            external_id: Some(format!("ext-{}", id)),
            remote_track: None,
            description: String::new(),
            user_selected: true,
            needs_confirmation: false,
            match_confidence: None,
            conflict_resolution: None,
        }
    }

    #[test]
    fn outbound_changes_batch_up_to_the_adapter_limit() {
        let changes = vec![
            change(ChangeKind::Add, SyncDirection::LibraryToPlatform, "a"),
            change(ChangeKind::Add, SyncDirection::LibraryToPlatform, "b"),
            change(ChangeKind::Add, SyncDirection::LibraryToPlatform, "c"),
            change(ChangeKind::Remove, SyncDirection::LibraryToPlatform, "d"),
            change(ChangeKind::Add, SyncDirection::PlatformToLibrary, "e"),
        ];
        let batches = group_batches(&changes, 2);

        match &batches[0] {
            Batch::Remote(ChangeKind::Add, chunk) => assert_eq!(chunk.len(), 2),
            _ => panic!("expected a full add batch"),
        }
        match &batches[1] {
            Batch::Remote(ChangeKind::Add, chunk) => assert_eq!(chunk.len(), 1),
            _ => panic!("expected the add remainder"),
        }
        match &batches[2] {
            Batch::Remote(ChangeKind::Remove, chunk) => assert_eq!(chunk.len(), 1),
            _ => panic!("expected the remove batch"),
        }
        assert!(matches!(batches[3], Batch::Single(_)));
        assert_eq!(batches.len(), 4);
    }

    #[test]
    fn phase_order_matches_the_documented_sequence() {
        let mut changes = vec![
            change(ChangeKind::Conflict, SyncDirection::PlatformToLibrary, "f"),
            change(ChangeKind::Remove, SyncDirection::PlatformToLibrary, "e"),
            change(ChangeKind::Remove, SyncDirection::LibraryToPlatform, "d"),
            change(ChangeKind::Add, SyncDirection::LibraryToPlatform, "c"),
            change(ChangeKind::Add, SyncDirection::PlatformToLibrary, "b"),
            change(ChangeKind::Link, SyncDirection::PlatformToLibrary, "a"),
        ];
        changes.sort_by_key(phase_rank);
        let order: Vec<&str> = changes.iter().map(|c| c.change_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e", "f"]);
    }
}
