pub mod adapter;
pub mod change_detector;
pub mod job_queue;
pub mod matching;
pub mod rate_limiter;
pub mod repository;
pub mod safety_gate;
pub mod snapshot_store;
pub mod stubs;
pub mod sync_executor;
pub mod sync_planner;

pub use adapter::{CredentialProvider, PlatformAdapter, TrackQuery};
pub use change_detector::{ChangeDetector, MembershipDiff};
pub use job_queue::{JobPriority, JobState, JobTicket, SyncJob, SyncJobHandler, SyncJobQueue};
pub use matching::{LocalTrackFacts, MatchDecision, MatchOutcome, TrackMatcher};
pub use rate_limiter::AdapterRateLimiter;
pub use repository::{LibraryRepository, TrackSearch, SYSTEM_COLLECTION_NAME};
pub use safety_gate::{EmergencyStop, GateVerdict, RejectionSeverity, SafetyGate};
pub use snapshot_store::SnapshotStore;
pub use sync_executor::SyncExecutor;
pub use sync_planner::SyncPlanner;
