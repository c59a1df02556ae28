//! A single download attempt chain: status, output buffer, and live subscribers.
//!
//! A `Job` is the unit the Scheduler dispatches and the Runner executes against.
//! Its own mutex is distinct from the Scheduler's process-wide lock so that the
//! Runner's per-line append path never has to re-enter the Scheduler (see the
//! lock-ordering discussion on [`crate::scheduler::Scheduler`]).

mod status;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub use status::JobStatus;

/// Maximum number of output lines retained per job; oldest lines are dropped on overflow.
pub const MAX_OUTPUT_LINES: usize = 500;

/// Bounded capacity of each subscriber's live-event channel.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 128;

fn progress_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[download\]\s+([\d.]+)%").unwrap_or_else(|e| {
            unreachable!("progress regex is a fixed literal and always compiles: {e}")
        })
    })
}

/// Milliseconds since the Unix epoch, used for `createdAt`/`doneAt` timestamps.
///
/// Matches the rest of this crate family's preference for plain epoch integers
/// over pulling in a calendar/timezone dependency that nothing here needs.
#[must_use]
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A live event broadcast to every subscriber of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    /// One line of raw output.
    Message(String),
    /// The raw numeric text matched by the progress regex (e.g. `"42.5"`).
    Progress(String),
    /// A status transition.
    Status(JobStatus),
}

/// A bounded live-event sink registered against a job.
pub type Subscriber = mpsc::Sender<JobEvent>;

struct Inner {
    url: String,
    status: JobStatus,
    created_at: u64,
    done_at: Option<u64>,
    error: String,
    progress: f64,
    retry_count: u32,
    max_retries: u32,
    output: Vec<String>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
    cancel: Option<CancellationToken>,
}

/// A mutable record of one download attempt chain.
///
/// All mutable state lives behind a single `tokio::sync::Mutex` scoped to this
/// job; the Scheduler holds its own separate lock for the job table and queue.
pub struct Job {
    id: String,
    inner: Mutex<Inner>,
    /// Count of attempts started, used to label retry output lines; not part of
    /// the persisted snapshot, only meaningful while the job is in-flight.
    attempt: AtomicU64,
}

/// Immutable-at-a-point-in-time view of a job, used for listings and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub created_at: u64,
    pub done_at: Option<u64>,
    pub error: String,
    pub progress: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub output: Vec<String>,
}

impl Job {
    /// Creates a new job in `pending` status with an empty output buffer.
    #[must_use]
    pub fn new(id: String, url: String, max_retries: u32) -> Self {
        Self::from_snapshot(JobSnapshot {
            id,
            url,
            status: JobStatus::Pending,
            created_at: now_unix_millis(),
            done_at: None,
            error: String::new(),
            progress: 0.0,
            retry_count: 0,
            max_retries,
            output: Vec::new(),
        })
    }

    /// Reconstructs a job from a persisted (or freshly built) snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: JobSnapshot) -> Self {
        Self {
            id: snapshot.id,
            inner: Mutex::new(Inner {
                url: snapshot.url,
                status: snapshot.status,
                created_at: snapshot.created_at,
                done_at: snapshot.done_at,
                error: snapshot.error,
                progress: snapshot.progress,
                retry_count: snapshot.retry_count,
                max_retries: snapshot.max_retries,
                output: snapshot.output,
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
                cancel: None,
            }),
            attempt: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn url(&self) -> String {
        self.inner.lock().await.url.clone()
    }

    pub async fn status(&self) -> JobStatus {
        self.inner.lock().await.status
    }

    /// Reads `url` and `status` under a single lock acquisition, for the
    /// Scheduler's duplicate-detection scan.
    pub async fn url_and_status(&self) -> (String, JobStatus) {
        let inner = self.inner.lock().await;
        (inner.url.clone(), inner.status)
    }

    pub async fn created_at(&self) -> u64 {
        self.inner.lock().await.created_at
    }

    pub async fn retry_count(&self) -> u32 {
        self.inner.lock().await.retry_count
    }

    pub async fn max_retries(&self) -> u32 {
        self.inner.lock().await.max_retries
    }

    /// Takes a consistent point-in-time snapshot for listing or persistence.
    pub async fn snapshot(&self) -> JobSnapshot {
        let inner = self.inner.lock().await;
        JobSnapshot {
            id: self.id.clone(),
            url: inner.url.clone(),
            status: inner.status,
            created_at: inner.created_at,
            done_at: inner.done_at,
            error: inner.error.clone(),
            progress: inner.progress,
            retry_count: inner.retry_count,
            max_retries: inner.max_retries,
            output: inner.output.clone(),
        }
    }

    /// Appends one parsed output line: enforces the history cap, extracts
    /// progress, and broadcasts `progress` (if matched) then `message` events.
    pub async fn append(&self, line: &str) {
        let mut inner = self.inner.lock().await;
        inner.output.push(line.to_string());
        if inner.output.len() > MAX_OUTPUT_LINES {
            let overflow = inner.output.len() - MAX_OUTPUT_LINES;
            inner.output.drain(0..overflow);
        }

        if let Some(captures) = progress_regex().captures(line) {
            if let Some(m) = captures.get(1) {
                let raw = m.as_str().to_string();
                if let Ok(value) = raw.parse::<f64>() {
                    inner.progress = value;
                }
                broadcast(&mut inner.subscribers, JobEvent::Progress(raw));
            }
        }

        broadcast(&mut inner.subscribers, JobEvent::Message(line.to_string()));
    }

    /// Sets `status` and broadcasts a `status` event.
    pub async fn broadcast_status(&self, status: JobStatus) {
        let mut inner = self.inner.lock().await;
        inner.status = status;
        broadcast(&mut inner.subscribers, JobEvent::Status(status));
    }

    /// Registers a new subscriber, returning the current output snapshot and a
    /// receiver. The snapshot and registration happen under the same lock so no
    /// line can be appended between the two.
    pub async fn subscribe(&self) -> (Vec<String>, u64, mpsc::Receiver<JobEvent>) {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.insert(id, tx);
        (inner.output.clone(), id, rx)
    }

    /// Removes and closes one subscriber by the id returned from `subscribe`.
    pub async fn unsubscribe(&self, subscriber_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.remove(&subscriber_id);
    }

    /// Closes and clears all subscribers. Dropping every sender closes the
    /// corresponding receivers, which is how transport-layer readers learn the
    /// job reached a terminal state.
    pub async fn close_subscribers(&self) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.clear();
    }

    /// Sets the cancellation handle for the attempt currently in flight.
    pub async fn set_cancel(&self, token: Option<CancellationToken>) {
        self.inner.lock().await.cancel = token;
    }

    /// Fires the job's cancellation handle, if one is set.
    pub async fn cancel(&self) {
        if let Some(token) = self.inner.lock().await.cancel.as_ref() {
            token.cancel();
        }
    }

    /// Records the next attempt number and returns it (1-based).
    pub fn next_attempt(&self) -> u64 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resets mutable fields for a manual retry of a `failed` job.
    pub async fn reset_for_retry(&self) {
        let mut inner = self.inner.lock().await;
        inner.error.clear();
        inner.done_at = None;
        inner.progress = 0.0;
        inner.retry_count = 0;
        inner.output.clear();
        self.attempt.store(0, Ordering::SeqCst);
    }

    /// Marks the job completed: `progress=100`, `doneAt=now`, closes subscribers.
    pub async fn mark_completed(&self) {
        let mut inner = self.inner.lock().await;
        inner.status = JobStatus::Completed;
        inner.progress = 100.0;
        inner.done_at = Some(now_unix_millis());
        inner.cancel = None;
        broadcast(&mut inner.subscribers, JobEvent::Status(JobStatus::Completed));
        inner.subscribers.clear();
    }

    /// Marks the job terminally failed with the given error text.
    pub async fn mark_failed(&self, error: String) {
        let mut inner = self.inner.lock().await;
        inner.status = JobStatus::Failed;
        inner.error = error;
        inner.done_at = Some(now_unix_millis());
        inner.cancel = None;
        broadcast(&mut inner.subscribers, JobEvent::Status(JobStatus::Failed));
        inner.subscribers.clear();
    }

    /// Records the error text from a non-terminal attempt failure without
    /// closing subscribers or marking a terminal state.
    pub async fn record_attempt_error(&self, error: String) {
        self.inner.lock().await.error = error;
    }

    /// Increments `retryCount`, returning the new value.
    pub async fn increment_retry_count(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.retry_count += 1;
        inner.retry_count
    }

    /// Appends a synthetic retry-notice line and resets `progress=0`.
    pub async fn begin_retry_wait(&self, attempt: u32, max_retries: u32, delay_secs: u64) {
        let mut inner = self.inner.lock().await;
        inner.status = JobStatus::Retrying;
        inner.progress = 0.0;
        let line = format!("--- Retry {attempt}/{max_retries} in {delay_secs}s ---");
        inner.output.push(line.clone());
        if inner.output.len() > MAX_OUTPUT_LINES {
            let overflow = inner.output.len() - MAX_OUTPUT_LINES;
            inner.output.drain(0..overflow);
        }
        broadcast(&mut inner.subscribers, JobEvent::Status(JobStatus::Retrying));
        broadcast(&mut inner.subscribers, JobEvent::Message(line));
    }
}

/// Non-blocking fan-out: a full subscriber channel silently drops the event.
fn broadcast(subscribers: &mut HashMap<u64, Subscriber>, event: JobEvent) {
    subscribers.retain(|_, tx| match tx.try_send(event.clone()) {
        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}
