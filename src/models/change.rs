//! Sync plan units, progress events, and job summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ExtTrack, Platform};

/// Which way a change flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    PlatformToLibrary,
    LibraryToPlatform,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncDirection::PlatformToLibrary => "platform_to_library",
            SyncDirection::LibraryToPlatform => "library_to_platform",
        };
        f.write_str(s)
    }
}

/// What a change does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Remove,
    Conflict,
    Link,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeKind::Add => "add",
            ChangeKind::Remove => "remove",
            ChangeKind::Conflict => "conflict",
            ChangeKind::Link => "link",
        };
        f.write_str(s)
    }
}

/// User's decision for a metadata conflict on a linked track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLibrary,
    KeepPlatform,
}

/// One unit of diff, previewable and individually selectable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChange {
    /// Stable id derived from binding, direction, kind and identifiers; the
    /// same divergence always hashes to the same id across runs.
    pub change_id: String,
    pub binding_id: i64,
    pub direction: SyncDirection,
    pub kind: ChangeKind,
    pub track_id: Option<i64>,
    pub external_id: Option<String>,
    /// Remote metadata for changes that may create local tracks or links.
    pub remote_track: Option<ExtTrack>,
    pub description: String,
    pub user_selected: bool,
    pub needs_confirmation: bool,
    pub match_confidence: Option<f64>,
    pub conflict_resolution: Option<ConflictResolution>,
}

impl SyncChange {
    pub fn compute_id(
        binding_id: i64,
        direction: SyncDirection,
        kind: ChangeKind,
        track_id: Option<i64>,
        external_id: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(binding_id.to_le_bytes());
        hasher.update(direction.to_string().as_bytes());
        hasher.update(kind.to_string().as_bytes());
        if let Some(id) = track_id {
            hasher.update(b"t");
            hasher.update(id.to_le_bytes());
        }
        if let Some(id) = external_id {
            hasher.update(b"e");
            hasher.update(id.as_bytes());
        }
        let digest = hasher.finalize();
        // 16 bytes of the digest is plenty for uniqueness and keeps ids short
        digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// An ordered, previewable list of changes for one binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPlan {
    pub binding_id: i64,
    pub platform: Platform,
    pub generated_at: DateTime<Utc>,
    pub changes: Vec<SyncChange>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes the user left selected (the default selection when no
    /// explicit subset is applied).
    pub fn selected(&self) -> impl Iterator<Item = &SyncChange> {
        self.changes.iter().filter(|c| c.user_selected)
    }

    pub fn find(&self, change_id: &str) -> Option<&SyncChange> {
        self.changes.iter().find(|c| c.change_id == change_id)
    }
}

/// Lifecycle state of one change, or of the job as a whole for terminal
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
    Stopped,
    Finished,
}

/// The core's sole runtime feedback to any front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub change_id: Option<String>,
    pub state: ProgressState,
    pub message: Option<String>,
    /// Present on the terminal `Finished` event only.
    pub summary: Option<SyncSummary>,
}

impl ProgressEvent {
    pub fn change(change_id: &str, state: ProgressState) -> Self {
        Self {
            change_id: Some(change_id.to_string()),
            state,
            message: None,
            summary: None,
        }
    }

    pub fn change_with_message(
        change_id: &str,
        state: ProgressState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            change_id: Some(change_id.to_string()),
            state,
            message: Some(message.into()),
            summary: None,
        }
    }

    pub fn terminal(state: ProgressState, message: impl Into<String>) -> Self {
        Self {
            change_id: None,
            state,
            message: Some(message.into()),
            summary: None,
        }
    }

    pub fn finished(summary: SyncSummary) -> Self {
        Self {
            change_id: None,
            state: ProgressState::Finished,
            message: None,
            summary: Some(summary),
        }
    }
}

/// Outcome of one change after execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeOutcome {
    pub change_id: String,
    pub state: ProgressState,
    pub message: Option<String>,
}

/// End-of-job report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub applied_count: u32,
    pub skipped_count: u32,
    pub failed_count: u32,
    pub details: Vec<ChangeOutcome>,
}

impl SyncSummary {
    pub fn record(&mut self, change_id: &str, state: ProgressState, message: Option<String>) {
        match state {
            ProgressState::Succeeded => self.applied_count += 1,
            ProgressState::Failed => self.failed_count += 1,
            ProgressState::Skipped => self.skipped_count += 1,
            _ => {}
        }
        self.details.push(ChangeOutcome {
            change_id: change_id.to_string(),
            state,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_ids_are_stable_and_distinct() {
        let a = SyncChange::compute_id(
            1,
            SyncDirection::LibraryToPlatform,
            ChangeKind::Add,
            Some(10),
            Some("sp:1"),
        );
        let b = SyncChange::compute_id(
            1,
            SyncDirection::LibraryToPlatform,
            ChangeKind::Add,
            Some(10),
            Some("sp:1"),
        );
        let c = SyncChange::compute_id(
            1,
            SyncDirection::LibraryToPlatform,
            ChangeKind::Remove,
            Some(10),
            Some("sp:1"),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn summary_counts_track_states() {
        let mut summary = SyncSummary::default();
        summary.record("a", ProgressState::Succeeded, None);
        summary.record("b", ProgressState::Skipped, Some("not selected".into()));
        summary.record("c", ProgressState::Failed, Some("remote 500".into()));
        summary.record("d", ProgressState::Succeeded, None);

        assert_eq!(summary.applied_count, 2);
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.details.len(), 4);
    }
}
