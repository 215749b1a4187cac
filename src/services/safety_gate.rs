//! Policy filter between planner output and executor input.
//!
//! The gate strips changes that would touch content the user does not own,
//! protects the system collection, enforces the test-prefix policy, and
//! honors the process-wide emergency stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{ChangeKind, Playlist, PlaylistPlatformBinding, SyncChange, SyncDirection};

/// Process-wide kill switch. Readable by every component; when engaged, the
/// gate rejects every change and jobs terminate with `Stopped`.
#[derive(Clone, Default)]
pub struct EmergencyStop(Arc<AtomicBool>);

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        self.0.store(true, Ordering::SeqCst);
        tracing::warn!("emergency stop engaged");
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
        tracing::info!("emergency stop released");
    }

    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a rejected change should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionSeverity {
    /// Stripped from the plan and reported as skipped.
    Skip,
    /// Hard failure, reported as failed without calling the adapter.
    Fail,
}

#[derive(Debug, Clone)]
pub struct RejectedChange {
    pub change: SyncChange,
    pub reason: String,
    pub severity: RejectionSeverity,
}

#[derive(Debug, Default)]
pub struct GateVerdict {
    pub allowed: Vec<SyncChange>,
    pub rejected: Vec<RejectedChange>,
}

pub struct SafetyGate {
    config: Arc<SyncConfig>,
    stop: EmergencyStop,
}

impl SafetyGate {
    pub fn new(config: Arc<SyncConfig>, stop: EmergencyStop) -> Self {
        Self { config, stop }
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.stop
    }

    /// Screen a list of changes against every policy. Fails outright with
    /// `Stopped` when the emergency stop is engaged.
    pub fn screen(
        &self,
        playlist: &Playlist,
        binding: &PlaylistPlatformBinding,
        changes: Vec<SyncChange>,
    ) -> Result<GateVerdict> {
        if self.stop.is_engaged() {
            return Err(SyncError::Stopped);
        }

        let mut verdict = GateVerdict::default();
        for change in changes {
            match self.check(playlist, binding, &change) {
                None => verdict.allowed.push(change),
                Some((reason, severity)) => {
                    tracing::warn!(
                        change_id = %change.change_id,
                        reason = %reason,
                        "safety gate rejected change"
                    );
                    verdict.rejected.push(RejectedChange {
                        change,
                        reason,
                        severity,
                    });
                }
            }
        }
        Ok(verdict)
    }

    fn check(
        &self,
        playlist: &Playlist,
        binding: &PlaylistPlatformBinding,
        change: &SyncChange,
    ) -> Option<(String, RejectionSeverity)> {
        let remote_mutating = mutates_remote(change);

        if remote_mutating && !binding.is_personal {
            return Some((
                format!(
                    "remote playlist on {} is not owned by the user; import-only",
                    binding.platform
                ),
                RejectionSeverity::Skip,
            ));
        }

        if playlist.is_system && change.kind == ChangeKind::Remove {
            return Some((
                "the system collection never loses tracks through sync".to_string(),
                RejectionSeverity::Skip,
            ));
        }

        if self.config.test_mode.enabled && remote_mutating {
            let name = &playlist.name;
            let allowed = self
                .config
                .test_mode
                .prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()));
            if !allowed {
                return Some((
                    format!(
                        "test mode: playlist '{}' does not carry an allowed prefix",
                        name
                    ),
                    RejectionSeverity::Fail,
                ));
            }
        }

        None
    }
}

/// Whether applying this change issues a mutating call to the remote
/// platform. Track-level link changes and all platform-to-library changes
/// only write locally.
fn mutates_remote(change: &SyncChange) -> bool {
    match change.direction {
        SyncDirection::PlatformToLibrary => false,
        SyncDirection::LibraryToPlatform => match change.kind {
            ChangeKind::Add | ChangeKind::Remove => true,
            // A binding-level link creates the remote playlist.
            ChangeKind::Link => change.track_id.is_none(),
            ChangeKind::Conflict => false,
        },
    }
}
