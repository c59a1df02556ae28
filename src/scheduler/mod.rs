//! The process-wide job table, FIFO pending queue, and retry/backoff orchestrator.
//!
//! A [`Scheduler`] is constructed once per process and shared behind an `Arc`.
//! It owns a single `tokio::sync::Mutex`-guarded [`State`] covering the job
//! table, the queue, the running-slot counter and the id allocator, plus a
//! [`Persistence`] handle and the top-level shutdown [`CancellationToken`].
//!
//! Lock ordering: the Scheduler may acquire a [`Job`]'s own lock only for
//! quick field reads or writes while holding its own lock (duplicate scans,
//! status flips). It never holds its lock across an I/O-producing call; the
//! Runner's per-line append path never re-enters the Scheduler at all.

pub mod error;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub use error::SchedulerError;

use crate::job::{Job, JobSnapshot, JobStatus};
use crate::persistence::{Persistence, PersistedState};
use crate::runner::{self, RunnerError};

/// How long a debounced save waits for the mutation burst to quiet down.
const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(250);

/// Base of the exponential backoff: `10s * 3^(attempt-1)`.
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Default concurrency cap used when `MAX_CONCURRENT` is unset.
pub const DEFAULT_MAX_CONCURRENT: u32 = 3;

/// Default retry cap used when `MAX_RETRIES` is unset.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Static configuration snapshotted at Scheduler construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrent: u32,
    pub max_retries: u32,
    pub download_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    /// Base duration for the exponential backoff. Defaults to 10s in
    /// production; tests may shrink this so retry scenarios run in
    /// milliseconds instead of the real 10s/30s/90s cadence.
    pub backoff_base: Duration,
}

impl Config {
    #[must_use]
    pub fn new(max_concurrent: u32, max_retries: u32, download_dir: PathBuf, data_dir: Option<PathBuf>) -> Self {
        Self { max_concurrent, max_retries, download_dir, data_dir, backoff_base: DEFAULT_BACKOFF_BASE }
    }
}

/// Per-URL outcome of a [`Scheduler::submit_bulk`] call.
#[derive(Debug, Clone)]
pub enum BulkOutcome {
    Admitted(JobSnapshot),
    Duplicate(String),
    EmptyUrl,
    ShutdownInProgress,
}

struct State {
    jobs: HashMap<String, Arc<Job>>,
    queue: VecDeque<String>,
    running: u32,
    next_id: u64,
}

impl State {
    fn new() -> Self {
        Self { jobs: HashMap::new(), queue: VecDeque::new(), running: 0, next_id: 1 }
    }
}

/// Admits one URL under an already-held [`State`] lock: allocates the id,
/// inserts the job, and either reserves a slot or enqueues it.
async fn admit_locked(state: &mut State, max_retries: u32, max_concurrent: u32, url: String) -> (Arc<Job>, bool) {
    let id = state.next_id.to_string();
    state.next_id += 1;
    let job = Arc::new(Job::new(id.clone(), url, max_retries));
    state.jobs.insert(id.clone(), Arc::clone(&job));

    let dispatch_now = state.running < max_concurrent;
    if dispatch_now {
        state.running += 1;
    } else {
        job.broadcast_status(JobStatus::Queued).await;
        state.queue.push_back(id);
    }
    (job, dispatch_now)
}

/// Maintains the set of all jobs, the FIFO pending queue, the running
/// counter, admission policy, retry orchestration with backoff, and
/// cancellation.
pub struct Scheduler {
    state: Mutex<State>,
    config: Config,
    shutdown: CancellationToken,
    persistence: Persistence,
    debounce_pending: Mutex<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let persistence = Persistence::new(config.data_dir.clone());
        Arc::new(Self {
            state: Mutex::new(State::new()),
            config,
            shutdown: CancellationToken::new(),
            persistence,
            debounce_pending: Mutex::new(false),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// A clone of the top-level shutdown token, for callers (e.g. the signal
    /// handler in `main`) that need to observe it independently.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Loads persisted state. Terminal jobs are restored verbatim;
    /// non-terminal jobs are coerced to `queued`/`progress=0` and
    /// re-enqueued in `createdAt` order, honoring the original admission
    /// sequence across a restart.
    #[instrument(skip(self))]
    pub async fn load(self: &Arc<Self>) {
        let persisted = self.persistence.load().await;
        let mut state = self.state.lock().await;
        state.next_id = persisted.next_id;

        let mut terminal = Vec::new();
        let mut requeued = Vec::new();
        for snapshot in persisted.jobs {
            if snapshot.status.is_terminal() {
                terminal.push(snapshot);
            } else {
                requeued.push(snapshot);
            }
        }
        requeued.sort_by_key(|s| s.created_at);

        for snapshot in terminal {
            let id = snapshot.id.clone();
            state.jobs.insert(id, Arc::new(Job::from_snapshot(snapshot)));
        }
        for mut snapshot in requeued {
            snapshot.status = JobStatus::Queued;
            snapshot.progress = 0.0;
            let id = snapshot.id.clone();
            state.queue.push_back(id.clone());
            state.jobs.insert(id, Arc::new(Job::from_snapshot(snapshot)));
        }

        info!(jobs = state.jobs.len(), queued = state.queue.len(), "loaded persisted state");
    }

    /// Startup-only: dispatches queued jobs until the concurrency cap is
    /// reached or the queue is empty.
    pub async fn drain_queue(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if self.shutdown.is_cancelled() || state.running >= self.config.max_concurrent {
                    None
                } else if let Some(id) = state.queue.pop_front() {
                    state.running += 1;
                    state.jobs.get(&id).cloned()
                } else {
                    None
                }
            };
            match next {
                Some(job) => self.dispatch_task(job).await,
                None => break,
            }
        }
    }

    #[instrument(skip(self, url), fields(url))]
    pub async fn submit(self: &Arc<Self>, url: impl Into<String>) -> Result<JobSnapshot, SchedulerError> {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            return Err(SchedulerError::EmptyUrl);
        }
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutdownInProgress);
        }

        let (job, dispatch_now) = {
            let mut state = self.state.lock().await;
            if self.shutdown.is_cancelled() {
                return Err(SchedulerError::ShutdownInProgress);
            }
            for existing in state.jobs.values() {
                let (existing_url, status) = existing.url_and_status().await;
                if existing_url == url && status != JobStatus::Completed {
                    return Err(SchedulerError::Duplicate(url));
                }
            }
            admit_locked(&mut state, self.config.max_retries, self.config.max_concurrent, url).await
        };

        if dispatch_now {
            self.dispatch_task(Arc::clone(&job)).await;
        }
        self.schedule_save().await;
        Ok(job.snapshot().await)
    }

    /// Atomic admission of a batch of URLs: duplicates are checked against
    /// both the existing job table and URLs already admitted earlier in the
    /// same batch. One debounced save covers the whole batch.
    #[instrument(skip(self, urls), fields(count = urls.len()))]
    pub async fn submit_bulk(self: &Arc<Self>, urls: Vec<String>) -> Vec<BulkOutcome> {
        if self.shutdown.is_cancelled() {
            return urls.iter().map(|_| BulkOutcome::ShutdownInProgress).collect();
        }

        let mut results = Vec::with_capacity(urls.len());
        let mut dispatch_list = Vec::new();

        {
            let mut state = self.state.lock().await;
            if self.shutdown.is_cancelled() {
                return urls.iter().map(|_| BulkOutcome::ShutdownInProgress).collect();
            }

            let mut active_urls: HashSet<String> = HashSet::new();
            for existing in state.jobs.values() {
                let (existing_url, status) = existing.url_and_status().await;
                if status != JobStatus::Completed {
                    active_urls.insert(existing_url);
                }
            }

            for raw in urls {
                let url = raw.trim().to_string();
                if url.is_empty() {
                    results.push(BulkOutcome::EmptyUrl);
                    continue;
                }
                if active_urls.contains(&url) {
                    results.push(BulkOutcome::Duplicate(url));
                    continue;
                }
                active_urls.insert(url.clone());
                let (job, dispatch_now) =
                    admit_locked(&mut state, self.config.max_retries, self.config.max_concurrent, url).await;
                if dispatch_now {
                    dispatch_list.push(Arc::clone(&job));
                }
                results.push(BulkOutcome::Admitted(job.snapshot().await));
            }
        }

        for job in dispatch_list {
            self.dispatch_task(job).await;
        }
        self.schedule_save().await;
        results
    }

    pub async fn get(&self, id: &str) -> Option<JobSnapshot> {
        let job = self.state.lock().await.jobs.get(id).cloned()?;
        Some(job.snapshot().await)
    }

    /// A newest-first snapshot list, for listing endpoints.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<Job>> = self.state.lock().await.jobs.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(jobs.len());
        for job in jobs {
            snapshots.push(job.snapshot().await);
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    /// Registers a live subscriber on `id`'s job, if it exists.
    pub async fn subscribe(&self, id: &str) -> Option<(Vec<String>, u64, tokio::sync::mpsc::Receiver<crate::job::JobEvent>)> {
        let job = self.state.lock().await.jobs.get(id).cloned()?;
        Some(job.subscribe().await)
    }

    /// Permitted only when the job is currently `failed`. Resets the
    /// attempt history and re-admits it under the normal dispatch rule.
    #[instrument(skip(self))]
    pub async fn retry(self: &Arc<Self>, id: &str) -> Result<JobSnapshot, SchedulerError> {
        let job = {
            let state = self.state.lock().await;
            state.jobs.get(id).cloned().ok_or_else(|| SchedulerError::NotFound(id.to_string()))?
        };
        if job.status().await != JobStatus::Failed {
            return Err(SchedulerError::NotFailed(id.to_string()));
        }
        job.reset_for_retry().await;

        let dispatch_now = {
            let mut state = self.state.lock().await;
            if state.running < self.config.max_concurrent {
                state.running += 1;
                true
            } else {
                job.broadcast_status(JobStatus::Queued).await;
                state.queue.push_back(id.to_string());
                false
            }
        };
        if dispatch_now {
            self.dispatch_task(Arc::clone(&job)).await;
        }
        self.schedule_save().await;
        Ok(job.snapshot().await)
    }

    /// Removes `id` from the queue if present, cancels its in-flight
    /// attempt or backoff wait if any, closes subscribers, and drops it
    /// from the job table. Safe to call at any job state, including for an
    /// id that does not exist.
    #[instrument(skip(self))]
    pub async fn delete(self: &Arc<Self>, id: &str) {
        let job = {
            let mut state = self.state.lock().await;
            state.queue.retain(|queued_id| queued_id != id);
            state.jobs.remove(id)
        };
        if let Some(job) = job {
            job.cancel().await;
            job.close_subscribers().await;
        }
        self.schedule_save().await;
    }

    /// Cancels every job, waits for every in-flight `run_download` task to
    /// actually return, then resets `running` to zero. Per the resolved
    /// open question this waits for cancellation to drain rather than
    /// accepting a transient overcount, trading deleteAll's latency for
    /// predictable slot accounting.
    #[instrument(skip(self))]
    pub async fn delete_all(self: &Arc<Self>) {
        let jobs: Vec<Arc<Job>> = {
            let mut state = self.state.lock().await;
            state.queue.clear();
            state.jobs.drain().map(|(_, job)| job).collect()
        };
        for job in &jobs {
            job.cancel().await;
            job.close_subscribers().await;
        }
        self.wait_for_drain().await;
        {
            let mut state = self.state.lock().await;
            state.running = 0;
        }
        self.schedule_save().await;
    }

    /// Signals the shutdown token, waits for every in-flight
    /// `run_download` task to return, then flushes a final save
    /// synchronously.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.wait_for_drain().await;
        self.save_now().await;
    }

    async fn wait_for_drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }

    async fn dispatch_task(self: &Arc<Self>, job: Arc<Job>) {
        let scheduler = Arc::clone(self);
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            scheduler.run_download(job).await;
        });
    }

    /// Decrements the running counter (this job's slot is being released),
    /// then pops and dispatches the next queued job if one exists and
    /// shutdown has not been signalled.
    async fn start_next_queued(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock().await;
            state.running = state.running.saturating_sub(1);
            if self.shutdown.is_cancelled() {
                None
            } else if let Some(id) = state.queue.pop_front() {
                state.running += 1;
                state.jobs.get(&id).cloned()
            } else {
                None
            }
        };
        if let Some(job) = next {
            self.dispatch_task(job).await;
        }
    }

    async fn try_acquire_slot(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.running < self.config.max_concurrent {
            state.running += 1;
            true
        } else {
            false
        }
    }

    async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.jobs.contains_key(id)
    }

    /// The retry/backoff orchestrator for one job, run in its own task for
    /// the duration of a single concurrency slot. Loops across attempts,
    /// releasing and reacquiring its slot around each backoff sleep.
    #[instrument(skip(self, job), fields(job_id = job.id()))]
    async fn run_download(self: Arc<Self>, job: Arc<Job>) {
        let url = job.url().await;
        let mut held_slot = true;

        loop {
            if !self.contains(job.id()).await {
                break;
            }

            job.broadcast_status(JobStatus::Running).await;
            self.schedule_save().await;
            job.next_attempt();

            let attempt_token = self.shutdown.child_token();
            let result = runner::execute_attempt(&job, &url, &self.config.download_dir, attempt_token).await;

            match result {
                Ok(()) => {
                    job.mark_completed().await;
                    self.schedule_save().await;
                    break;
                }
                Err(e) => {
                    if !self.contains(job.id()).await {
                        break;
                    }
                    if self.shutdown.is_cancelled() {
                        // Leave status as `running`; reload will re-queue it.
                        break;
                    }
                    if matches!(e, RunnerError::Cancelled) {
                        // Job-specific cancellation (delete) raced the
                        // table check above; treat as deleted.
                        break;
                    }

                    let retry_count = job.increment_retry_count().await;
                    job.record_attempt_error(e.to_string()).await;
                    let max_retries = job.max_retries().await;

                    if retry_count >= max_retries {
                        job.mark_failed(e.to_string()).await;
                        self.schedule_save().await;
                        break;
                    }

                    let backoff = self.config.backoff_base * 3u32.pow(retry_count - 1);
                    job.begin_retry_wait(retry_count, max_retries, backoff.as_secs()).await;

                    // Release the slot before sleeping so backoff never starves the queue.
                    self.start_next_queued().await;
                    held_slot = false;

                    let backoff_token = self.shutdown.child_token();
                    job.set_cancel(Some(backoff_token.clone())).await;
                    tokio::select! {
                        biased;
                        () = backoff_token.cancelled() => {
                            job.set_cancel(None).await;
                            return;
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                    job.set_cancel(None).await;

                    if !self.contains(job.id()).await {
                        return;
                    }

                    if self.try_acquire_slot().await {
                        held_slot = true;
                    } else {
                        job.broadcast_status(JobStatus::Queued).await;
                        let mut state = self.state.lock().await;
                        state.queue.push_back(job.id().to_string());
                        drop(state);
                        self.schedule_save().await;
                        return;
                    }
                }
            }
        }

        if held_slot {
            self.start_next_queued().await;
        }
    }

    async fn snapshot_state(&self) -> PersistedState {
        let state = self.state.lock().await;
        let next_id = state.next_id;
        let jobs: Vec<Arc<Job>> = state.jobs.values().cloned().collect();
        drop(state);

        let mut snapshots = Vec::with_capacity(jobs.len());
        for job in jobs {
            snapshots.push(job.snapshot().await);
        }
        PersistedState { next_id, jobs: snapshots }
    }

    async fn save_now(&self) {
        let state = self.snapshot_state().await;
        if let Err(e) = self.persistence.save(&state).await {
            warn!(error = %e, "failed to persist scheduler state");
        }
    }

    /// Arms a quiet-period timer on the first call of a burst; subsequent
    /// calls while one is already pending are no-ops, since the eventual
    /// fire always reads the latest in-memory state.
    async fn schedule_save(self: &Arc<Self>) {
        {
            let mut pending = self.debounce_pending.lock().await;
            if *pending {
                return;
            }
            *pending = true;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_INTERVAL).await;
            {
                let mut pending = scheduler.debounce_pending.lock().await;
                *pending = false;
            }
            scheduler.save_now().await;
        });
    }
}
