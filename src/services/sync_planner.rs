//! Turns a membership diff into an ordered, selectable sync plan.
//!
//! The plan honors the binding's sync mode, defaults unsafe operations to
//! unselected, and lists changes in the order the executor applies them so
//! previews read the same way execution runs.

use std::sync::Arc;

use chrono::Utc;

use crate::config::SyncConfig;
use crate::models::{
    ChangeKind, ExtTrack, Playlist, PlaylistPlatformBinding, SyncChange, SyncDirection, SyncMode,
    SyncPlan,
};
use crate::services::change_detector::MembershipDiff;

pub struct SyncPlanner {
    #[allow(dead_code)]
    config: Arc<SyncConfig>,
}

impl SyncPlanner {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self { config }
    }

    pub fn build_plan(
        &self,
        binding: &PlaylistPlatformBinding,
        playlist: &Playlist,
        diff: &MembershipDiff,
    ) -> SyncPlan {
        let mode = binding.effective_mode();
        let platform = binding.platform;
        let current_platform: std::collections::HashSet<&str> =
            diff.current_platform.iter().map(String::as_str).collect();
        let mut changes = Vec::new();

        let outbound = mode != SyncMode::ImportOnly && mode != SyncMode::MirrorFromPlatform;
        let inbound = mode != SyncMode::MirrorToPlatform;

        // Phase 1: link changes. Creating the remote counterpart comes
        // first; everything outbound depends on it.
        if outbound && !binding.has_remote_counterpart() {
            changes.push(self.change(
                binding,
                SyncDirection::LibraryToPlatform,
                ChangeKind::Link,
                None,
                None,
                None,
                format!("Create playlist '{}' on {}", playlist.name, platform),
                true,
                false,
                None,
            ));
        }
        for addition in &diff.platform_added {
            if addition.already_linked || addition.needs_confirmation {
                continue;
            }
            if let Some(track_id) = addition.resolved_track_id {
                changes.push(self.change(
                    binding,
                    SyncDirection::PlatformToLibrary,
                    ChangeKind::Link,
                    Some(track_id),
                    Some(addition.track.external_id.clone()),
                    Some(addition.track.clone()),
                    format!(
                        "Link '{}' to its {} counterpart",
                        addition.track.title, platform
                    ),
                    true,
                    false,
                    addition.match_confidence,
                ));
            }
        }
        if outbound {
            for addition in &diff.library_added {
                if addition.already_linked || addition.needs_confirmation {
                    continue;
                }
                if let (Some(external_id), Some(remote)) =
                    (&addition.external_id, &addition.proposed_remote)
                {
                    changes.push(self.change(
                        binding,
                        SyncDirection::LibraryToPlatform,
                        ChangeKind::Link,
                        Some(addition.track_id),
                        Some(external_id.clone()),
                        Some(remote.clone()),
                        format!("Link '{}' to its {} counterpart", addition.title, platform),
                        true,
                        false,
                        addition.match_confidence,
                    ));
                }
            }
        }

        // Phase 2: platform-to-library adds (local-only, safe).
        if inbound {
            for addition in &diff.platform_added {
                changes.push(self.change(
                    binding,
                    SyncDirection::PlatformToLibrary,
                    ChangeKind::Add,
                    addition.resolved_track_id,
                    Some(addition.track.external_id.clone()),
                    Some(addition.track.clone()),
                    match addition.resolved_track_id {
                        Some(_) if addition.needs_confirmation => format!(
                            "Import '{}' from {} (uncertain match, confirm)",
                            addition.track.title, platform
                        ),
                        Some(_) => {
                            format!("Import '{}' from {}", addition.track.title, platform)
                        }
                        None => format!(
                            "Import '{}' from {} as a new track",
                            addition.track.title, platform
                        ),
                    },
                    !addition.needs_confirmation,
                    addition.needs_confirmation,
                    addition.match_confidence,
                ));
            }
        }

        // Phase 3: library-to-platform adds.
        if outbound {
            for addition in &diff.library_added {
                changes.push(self.change(
                    binding,
                    SyncDirection::LibraryToPlatform,
                    ChangeKind::Add,
                    Some(addition.track_id),
                    addition.external_id.clone(),
                    addition.proposed_remote.clone(),
                    format!("Add '{}' to {}", addition.title, platform),
                    !addition.needs_confirmation,
                    addition.needs_confirmation,
                    addition.match_confidence,
                ));
            }
        }

        // Phases 4 and 5: removals. Under a mirror mode the mirror source
        // wins: an edit on the target side is undone rather than propagated.
        match mode {
            SyncMode::FullBidirectional => {
                for removal in &diff.library_removed {
                    changes.push(self.change(
                        binding,
                        SyncDirection::LibraryToPlatform,
                        ChangeKind::Remove,
                        Some(removal.track_id),
                        removal.external_id.clone(),
                        None,
                        format!(
                            "Remove '{}' from {}",
                            removal.title.as_deref().unwrap_or("unknown track"),
                            platform
                        ),
                        binding.is_personal,
                        false,
                        None,
                    ));
                }
                for removal in &diff.platform_removed {
                    changes.push(self.change(
                        binding,
                        SyncDirection::PlatformToLibrary,
                        ChangeKind::Remove,
                        removal.track_id,
                        Some(removal.external_id.clone()),
                        None,
                        format!("Remove track gone from {}", platform),
                        binding.is_personal,
                        false,
                        None,
                    ));
                }
            }
            SyncMode::AddOnly | SyncMode::ImportOnly => {
                // No removals propagate in either direction.
            }
            SyncMode::MirrorFromPlatform => {
                // Platform wins: revert local edits made since the snapshot.
                for addition in &diff.library_added {
                    changes.push(self.change(
                        binding,
                        SyncDirection::PlatformToLibrary,
                        ChangeKind::Remove,
                        Some(addition.track_id),
                        addition.external_id.clone(),
                        None,
                        format!("Undo local addition of '{}' (platform mirror)", addition.title),
                        binding.is_personal,
                        false,
                        None,
                    ));
                }
                for removal in &diff.library_removed {
                    // Restore only what the platform still has.
                    let still_remote = removal
                        .external_id
                        .as_deref()
                        .map(|e| current_platform.contains(e))
                        .unwrap_or(false);
                    if still_remote {
                        changes.push(self.change(
                            binding,
                            SyncDirection::PlatformToLibrary,
                            ChangeKind::Add,
                            Some(removal.track_id),
                            removal.external_id.clone(),
                            None,
                            format!(
                                "Restore '{}' removed locally (platform mirror)",
                                removal.title.as_deref().unwrap_or("unknown track")
                            ),
                            binding.is_personal,
                            false,
                            None,
                        ));
                    }
                }
                for removal in &diff.platform_removed {
                    changes.push(self.change(
                        binding,
                        SyncDirection::PlatformToLibrary,
                        ChangeKind::Remove,
                        removal.track_id,
                        Some(removal.external_id.clone()),
                        None,
                        format!("Remove track gone from {}", platform),
                        binding.is_personal,
                        false,
                        None,
                    ));
                }
            }
            SyncMode::MirrorToPlatform => {
                // Library wins: undo remote edits made since the snapshot.
                for addition in &diff.platform_added {
                    changes.push(self.change(
                        binding,
                        SyncDirection::LibraryToPlatform,
                        ChangeKind::Remove,
                        addition.resolved_track_id,
                        Some(addition.track.external_id.clone()),
                        None,
                        format!(
                            "Undo remote addition of '{}' (library mirror)",
                            addition.track.title
                        ),
                        binding.is_personal,
                        false,
                        None,
                    ));
                }
                for removal in &diff.platform_removed {
                    changes.push(self.change(
                        binding,
                        SyncDirection::LibraryToPlatform,
                        ChangeKind::Add,
                        removal.track_id,
                        Some(removal.external_id.clone()),
                        None,
                        "Restore track removed remotely (library mirror)".to_string(),
                        binding.is_personal,
                        false,
                        None,
                    ));
                }
                for removal in &diff.library_removed {
                    changes.push(self.change(
                        binding,
                        SyncDirection::LibraryToPlatform,
                        ChangeKind::Remove,
                        Some(removal.track_id),
                        removal.external_id.clone(),
                        None,
                        format!(
                            "Remove '{}' from {}",
                            removal.title.as_deref().unwrap_or("unknown track"),
                            platform
                        ),
                        binding.is_personal,
                        false,
                        None,
                    ));
                }
            }
        }

        // Phase 6: metadata conflicts, always opt-in.
        if inbound {
            for conflict in &diff.conflicts {
                changes.push(self.change(
                    binding,
                    SyncDirection::PlatformToLibrary,
                    ChangeKind::Conflict,
                    Some(conflict.track_id),
                    Some(conflict.remote.external_id.clone()),
                    Some(conflict.remote.clone()),
                    format!(
                        "Metadata differs for '{}' (remote: '{}')",
                        conflict.local_title, conflict.remote.title
                    ),
                    false,
                    true,
                    Some(conflict.confidence),
                ));
            }
        }

        SyncPlan {
            binding_id: binding.id,
            platform,
            generated_at: Utc::now(),
            changes,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn change(
        &self,
        binding: &PlaylistPlatformBinding,
        direction: SyncDirection,
        kind: ChangeKind,
        track_id: Option<i64>,
        external_id: Option<String>,
        remote_track: Option<ExtTrack>,
        description: String,
        user_selected: bool,
        needs_confirmation: bool,
        match_confidence: Option<f64>,
    ) -> SyncChange {
        let change_id = SyncChange::compute_id(
            binding.id,
            direction,
            kind,
            track_id,
            external_id.as_deref(),
        );
        SyncChange {
            change_id,
            binding_id: binding.id,
            direction,
            kind,
            track_id,
            external_id,
            remote_track,
            description,
            user_selected,
            needs_confirmation,
            match_confidence,
            conflict_resolution: None,
        }
    }
}
