//! Playlist synchronization core for a cross-platform music library.
//!
//! Keeps a local canonical library in step with playlists held by external
//! music platforms: three-way diffs against per-binding snapshots, fuzzy
//! cross-platform track identity, previewable and selectable sync plans,
//! and an executor that tolerates partial remote failure behind a rate
//! limiter and a safety gate. Front-ends, credential storage and the
//! per-platform HTTP clients live outside this crate and plug in through
//! [`PlatformAdapter`] and [`CredentialProvider`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use config::{RetryConfig, SyncConfig, TestModeConfig};
pub use database::{initialize_database, initialize_schema, DatabaseConfig};
pub use error::{Result, SyncError};
pub use models::*;
pub use services::adapter::{CredentialProvider, PlatformAdapter, TrackQuery};
pub use services::change_detector::{ChangeDetector, MembershipDiff};
pub use services::job_queue::{
    JobPriority, JobState, JobTicket, SyncJob, SyncJobHandler, SyncJobQueue,
};
pub use services::matching::{LocalTrackFacts, MatchDecision, MatchOutcome, TrackMatcher};
pub use services::rate_limiter::AdapterRateLimiter;
pub use services::repository::{LibraryRepository, TrackSearch, SYSTEM_COLLECTION_NAME};
pub use services::safety_gate::{EmergencyStop, SafetyGate};
pub use services::snapshot_store::SnapshotStore;
pub use services::sync_executor::SyncExecutor;
pub use services::sync_planner::SyncPlanner;

/// The wired-up synchronization core: every service plus the registered
/// platform adapters. Front-ends hold one of these and drive it through
/// [`SyncCore::preview`], [`SyncCore::sync_binding`], or a
/// [`SyncJobQueue`] built over it.
pub struct SyncCore {
    config: Arc<SyncConfig>,
    repo: Arc<LibraryRepository>,
    snapshots: Arc<SnapshotStore>,
    matcher: Arc<TrackMatcher>,
    limiter: Arc<AdapterRateLimiter>,
    gate: Arc<SafetyGate>,
    detector: ChangeDetector,
    planner: SyncPlanner,
    executor: SyncExecutor,
    adapters: DashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl SyncCore {
    pub fn new(pool: SqlitePool, config: SyncConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let repo = Arc::new(LibraryRepository::new(pool));
        let snapshots = Arc::new(SnapshotStore::new(Arc::clone(&repo)));
        let matcher = Arc::new(TrackMatcher::new(&config));
        let limiter = Arc::new(AdapterRateLimiter::new(config.retry.clone()));
        let gate = Arc::new(SafetyGate::new(Arc::clone(&config), EmergencyStop::new()));

        let detector = ChangeDetector::new(
            Arc::clone(&repo),
            Arc::clone(&snapshots),
            Arc::clone(&matcher),
            Arc::clone(&limiter),
        );
        let planner = SyncPlanner::new(Arc::clone(&config));
        let executor = SyncExecutor::new(
            Arc::clone(&config),
            Arc::clone(&repo),
            Arc::clone(&snapshots),
            Arc::clone(&gate),
            Arc::clone(&limiter),
        );

        Arc::new(Self {
            config,
            repo,
            snapshots,
            matcher,
            limiter,
            gate,
            detector,
            planner,
            executor,
            adapters: DashMap::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<LibraryRepository> {
        &self.repo
    }

    pub fn snapshot_store(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn matcher(&self) -> &Arc<TrackMatcher> {
        &self.matcher
    }

    /// Handle to the process-wide emergency stop flag.
    pub fn emergency_stop(&self) -> EmergencyStop {
        self.gate.emergency_stop().clone()
    }

    /// Register one platform adapter and size its rate-limit bucket from
    /// its declared budget.
    pub fn register_adapter(&self, adapter: Arc<dyn PlatformAdapter>) {
        let platform = adapter.platform();
        self.limiter
            .register(platform, adapter.capabilities().rate_budget_per_minute);
        tracing::info!(platform = %platform, "platform adapter registered");
        self.adapters.insert(platform, adapter);
    }

    pub fn adapter(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>> {
        self.adapters
            .get(&platform)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SyncError::not_found(format!("adapter for {}", platform)))
    }

    /// Remote playlists visible on one platform, for binding setup.
    pub async fn list_remote_playlists(
        &self,
        platform: Platform,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtPlaylist>> {
        let adapter = self.adapter(platform)?;
        self.limiter
            .execute_with_retry(platform, cancel, || adapter.list_playlists())
            .await
    }

    async fn binding_context(
        &self,
        binding_id: i64,
    ) -> Result<(PlaylistPlatformBinding, Playlist, Arc<dyn PlatformAdapter>)> {
        let binding = self
            .repo
            .get_binding(binding_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("binding {}", binding_id)))?;
        let playlist = self
            .repo
            .get_playlist(binding.playlist_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("playlist {}", binding.playlist_id)))?;
        let adapter = self.adapter(binding.platform)?;
        Ok((binding, playlist, adapter))
    }

    /// Compute the plan for one binding without applying anything. This is
    /// what a front-end shows as the sync preview.
    pub async fn preview(
        &self,
        binding_id: i64,
        cancel: &CancellationToken,
    ) -> Result<SyncPlan> {
        let (binding, playlist, adapter) = self.binding_context(binding_id).await?;
        let diff = self
            .detector
            .detect(&binding, adapter.as_ref(), cancel)
            .await?;
        Ok(self.planner.build_plan(&binding, &playlist, &diff))
    }

    /// Detect, plan and apply in one pass. `selection` narrows the plan to
    /// explicit change ids; otherwise the plan defaults apply.
    pub async fn sync_binding(
        &self,
        binding_id: i64,
        plan: Option<SyncPlan>,
        selection: Option<&HashSet<String>>,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let (binding, playlist, adapter) = self.binding_context(binding_id).await?;
        let plan = match plan {
            Some(plan) => plan,
            None => {
                let diff = self
                    .detector
                    .detect(&binding, adapter.as_ref(), cancel)
                    .await?;
                self.planner.build_plan(&binding, &playlist, &diff)
            }
        };
        self.executor
            .apply(
                &binding,
                &playlist,
                adapter.as_ref(),
                &plan,
                selection,
                progress,
                cancel,
            )
            .await
    }
}

#[async_trait]
impl SyncJobHandler for SyncCore {
    async fn run(
        &self,
        job: &SyncJob,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<SyncSummary> {
        self.sync_binding(
            job.binding_id,
            job.plan.clone(),
            job.selection.as_ref(),
            &progress,
            &cancel,
        )
        .await
    }
}
