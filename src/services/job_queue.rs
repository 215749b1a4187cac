//! Queue of sync jobs with bounded concurrency and cooperative cancellation.
//!
//! Jobs are FIFO with a foreground priority that jumps the queue. A worker
//! pool of `max_global_sync_concurrency` tasks drains it; per-platform
//! semaphores bound concurrent use of one adapter, and a per-binding lock
//! keeps jobs on the same binding strictly serial.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{Platform, ProgressEvent, ProgressState, SyncPlan, SyncSummary};

/// Capacity of each job's progress channel.
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPriority {
    Normal,
    /// User-initiated; jumps ahead of queued background work.
    Foreground,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One sync request, scoped to a single binding
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub id: Uuid,
    pub binding_id: i64,
    pub platform: Platform,
    pub priority: JobPriority,
    /// A previewed plan to apply; when absent the handler derives one.
    pub plan: Option<SyncPlan>,
    /// Explicit change selection; when absent the plan defaults apply.
    pub selection: Option<HashSet<String>>,
}

impl SyncJob {
    pub fn new(binding_id: i64, platform: Platform) -> Self {
        Self {
            id: Uuid::new_v4(),
            binding_id,
            platform,
            priority: JobPriority::Normal,
            plan: None,
            selection: None,
        }
    }

    pub fn foreground(mut self) -> Self {
        self.priority = JobPriority::Foreground;
        self
    }

    pub fn with_plan(mut self, plan: SyncPlan, selection: Option<HashSet<String>>) -> Self {
        self.plan = Some(plan);
        self.selection = selection;
        self
    }
}

/// Executes one job; implemented by the sync core.
#[async_trait]
pub trait SyncJobHandler: Send + Sync {
    async fn run(
        &self,
        job: &SyncJob,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> Result<SyncSummary>;
}

/// Caller's handle on a submitted job
pub struct JobTicket {
    pub job_id: Uuid,
    pub progress: mpsc::Receiver<ProgressEvent>,
    cancel: CancellationToken,
}

impl JobTicket {
    /// Request cooperative cancellation of this job.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct QueuedJob {
    job: SyncJob,
    progress: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

pub struct SyncJobQueue {
    handler: Arc<dyn SyncJobHandler>,
    queue: Arc<Mutex<VecDeque<QueuedJob>>>,
    notify: Arc<Notify>,
    adapter_slots: Arc<DashMap<Platform, Arc<Semaphore>>>,
    binding_locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
    states: Arc<DashMap<Uuid, JobState>>,
    cancels: Arc<DashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    per_adapter_limit: usize,
    worker_count: usize,
}

impl SyncJobQueue {
    pub fn new(config: &SyncConfig, handler: Arc<dyn SyncJobHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            adapter_slots: Arc::new(DashMap::new()),
            binding_locks: Arc::new(DashMap::new()),
            states: Arc::new(DashMap::new()),
            cancels: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            per_adapter_limit: config.max_per_adapter_concurrency,
            worker_count: config.max_global_sync_concurrency,
        })
    }

    /// Spawn the worker pool. Idempotent per queue instance.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.worker_count {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                queue.run_worker(worker_id).await;
            }));
        }
        tracing::info!(workers = self.worker_count, "sync job queue started");
    }

    /// Enqueue a job. Foreground jobs go to the head of the queue.
    pub async fn submit(&self, job: SyncJob) -> JobTicket {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let ticket = JobTicket {
            job_id: job.id,
            progress: rx,
            cancel: cancel.clone(),
        };

        self.states.insert(job.id, JobState::Queued);
        self.cancels.insert(job.id, cancel.clone());
        tracing::info!(
            job_id = %job.id,
            binding_id = job.binding_id,
            platform = %job.platform,
            priority = ?job.priority,
            "sync job enqueued"
        );

        let queued = QueuedJob {
            job,
            progress: tx,
            cancel,
        };
        {
            let mut queue = self.queue.lock().await;
            match queued.job.priority {
                JobPriority::Foreground => queue.push_front(queued),
                JobPriority::Normal => queue.push_back(queued),
            }
        }
        self.notify.notify_one();
        ticket
    }

    pub fn state(&self, job_id: &Uuid) -> Option<JobState> {
        self.states.get(job_id).map(|s| *s)
    }

    /// Request cancellation of one queued or running job.
    pub fn cancel(&self, job_id: &Uuid) {
        if let Some(token) = self.cancels.get(job_id) {
            token.cancel();
        }
    }

    /// Cancel everything; used to drain the queue under emergency stop.
    pub fn cancel_all(&self) {
        for entry in self.cancels.iter() {
            entry.value().cancel();
        }
    }

    /// Stop the worker pool. Queued jobs stay queued; running jobs finish
    /// their current step.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
        tracing::info!("sync job queue stopped");
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "sync worker started");
        loop {
            let next = { self.queue.lock().await.pop_front() };
            match next {
                Some(queued) => self.process(queued).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
        tracing::debug!(worker_id, "sync worker stopped");
    }

    async fn process(&self, queued: QueuedJob) {
        let QueuedJob {
            job,
            progress,
            cancel,
        } = queued;

        if cancel.is_cancelled() {
            self.finish(&job.id, JobState::Cancelled);
            let _ = progress
                .send(ProgressEvent::terminal(
                    ProgressState::Cancelled,
                    "cancelled before start",
                ))
                .await;
            return;
        }

        // Strict serial ordering per binding; bounded concurrency per
        // adapter.
        let binding_lock = self
            .binding_locks
            .entry(job.binding_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _binding_guard = binding_lock.lock().await;

        let slots = self
            .adapter_slots
            .entry(job.platform)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_adapter_limit)))
            .clone();
        let _permit = match slots.acquire().await {
            Ok(permit) => permit,
            // The semaphore is never closed while the queue lives.
            Err(_) => return,
        };

        self.states.insert(job.id, JobState::Running);
        tracing::info!(job_id = %job.id, binding_id = job.binding_id, "sync job running");

        match self.handler.run(&job, progress, cancel).await {
            Ok(summary) => {
                tracing::info!(
                    job_id = %job.id,
                    applied = summary.applied_count,
                    skipped = summary.skipped_count,
                    failed = summary.failed_count,
                    "sync job completed"
                );
                self.finish(&job.id, JobState::Completed);
            }
            Err(SyncError::Cancelled) => self.finish(&job.id, JobState::Cancelled),
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "sync job failed");
                self.finish(&job.id, JobState::Failed);
            }
        }
    }

    fn finish(&self, job_id: &Uuid, state: JobState) {
        self.states.insert(*job_id, state);
        self.cancels.remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Handler that records execution order and simulates slow work.
    struct RecordingHandler {
        running: AtomicUsize,
        max_running: AtomicUsize,
        order: Mutex<Vec<Uuid>>,
        delay: Duration,
    }

    impl RecordingHandler {
        fn new(delay: Duration) -> Self {
            Self {
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    #[async_trait]
    impl SyncJobHandler for RecordingHandler {
        async fn run(
            &self,
            job: &SyncJob,
            _progress: mpsc::Sender<ProgressEvent>,
            cancel: CancellationToken,
        ) -> Result<SyncSummary> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.order.lock().await.push(job.id);

            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    return Err(SyncError::Cancelled);
                }
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(SyncSummary::default())
        }
    }

    fn config(workers: usize, per_adapter: usize) -> SyncConfig {
        SyncConfig {
            max_global_sync_concurrency: workers,
            max_per_adapter_concurrency: per_adapter,
            ..Default::default()
        }
    }

    async fn wait_for(queue: &SyncJobQueue, job_id: &Uuid, state: JobState) {
        for _ in 0..400 {
            if queue.state(job_id) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached {:?}", job_id, state);
    }

    #[tokio::test]
    async fn per_adapter_concurrency_is_bounded() {
        let handler = Arc::new(RecordingHandler::new(Duration::from_millis(30)));
        let queue = SyncJobQueue::new(&config(4, 1), handler.clone());
        queue.start().await;

        let mut ids = Vec::new();
        for binding in 0..4 {
            let ticket = queue.submit(SyncJob::new(binding, Platform::Spotify)).await;
            ids.push(ticket.job_id);
        }
        for id in &ids {
            wait_for(&queue, id, JobState::Completed).await;
        }
        // Four workers, one platform, per-adapter limit 1.
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn foreground_jobs_jump_the_queue() {
        let handler = Arc::new(RecordingHandler::new(Duration::from_millis(20)));
        // One worker so queue order is observable.
        let queue = SyncJobQueue::new(&config(1, 1), handler.clone());

        let _a = queue.submit(SyncJob::new(1, Platform::Spotify)).await;
        let _b = queue.submit(SyncJob::new(2, Platform::Spotify)).await;
        let fg_ticket = queue
            .submit(SyncJob::new(3, Platform::Spotify).foreground())
            .await;
        let fg_id = fg_ticket.job_id;

        queue.start().await;
        wait_for(&queue, &fg_id, JobState::Completed).await;

        let order = handler.order.lock().await;
        assert_eq!(order[0], fg_id);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn jobs_on_one_binding_run_serially() {
        let handler = Arc::new(RecordingHandler::new(Duration::from_millis(25)));
        let queue = SyncJobQueue::new(&config(3, 3), handler.clone());
        queue.start().await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            let ticket = queue.submit(SyncJob::new(7, Platform::Youtube)).await;
            ids.push(ticket.job_id);
        }
        for id in &ids {
            wait_for(&queue, id, JobState::Completed).await;
        }
        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_reaches_queued_and_running_jobs() {
        let handler = Arc::new(RecordingHandler::new(Duration::from_secs(60)));
        let queue = SyncJobQueue::new(&config(1, 1), handler.clone());
        queue.start().await;

        let running = queue.submit(SyncJob::new(1, Platform::Discogs)).await;
        let mut waiting = queue.submit(SyncJob::new(2, Platform::Discogs)).await;
        wait_for(&queue, &running.job_id, JobState::Running).await;

        waiting.cancel();
        running.cancel();

        wait_for(&queue, &running.job_id, JobState::Cancelled).await;
        wait_for(&queue, &waiting.job_id, JobState::Cancelled).await;

        // The queued job never started and reports a terminal event.
        let event = waiting.progress.recv().await.unwrap();
        assert_eq!(event.state, ProgressState::Cancelled);
        queue.shutdown().await;
    }
}
