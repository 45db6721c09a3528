//! Job tracking.
//!
//! Long-running server operations return a job id and report progress as
//! pushes on the `core.get_jobs` topic. [`JobWaiter`] consumes that topic,
//! keeps the latest raw state of every job it has seen and resolves
//! [`JobWaiter::wait_for`] calls when their job reaches a terminal status.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use truenas_core::value::FieldMapExt;
use truenas_core::{ClientError, FieldMap, FieldValue, JobId, Result};
use truenas_ddp::{Connection, MethodInvoker, PushEvent, PushKind, SubscriptionQueue};

use crate::cache::query_rows;

/// Topic carrying job updates; also the job query method.
pub const JOBS_TOPIC: &str = "core.get_jobs";

const ENTITY: &str = "job";

// ─────────────────────────────────────────────────────────────────────────────
// Job state
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Queued, not started.
    Waiting,
    /// In progress.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failed,
    /// Cancelled before finishing.
    Aborted,
}

impl JobStatus {
    /// Parse the wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WAITING" => Some(Self::Waiting),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    /// Whether no further transition can occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress reported by a running job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobProgress {
    /// Completion percentage, when reported.
    pub percent: Option<f64>,
    /// Human-readable step description.
    pub description: Option<String>,
}

/// Decoded state of one job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobState {
    /// Job id.
    pub id: JobId,
    /// Method that created the job.
    pub method: String,
    /// Current status.
    pub status: JobStatus,
    /// Result payload (`Null` until the job succeeds).
    pub result: FieldValue,
    /// Error message of a failed job.
    pub error: Option<String>,
    /// Last reported progress.
    pub progress: JobProgress,
    /// Arguments the job was started with.
    pub arguments: Vec<FieldValue>,
    /// When the job started running.
    pub time_started: Option<DateTime<Utc>>,
    /// When the job finished.
    pub time_finished: Option<DateTime<Utc>>,
}

impl JobState {
    /// Decode a raw `core.get_jobs` document.
    pub fn decode(raw: &FieldMap) -> Result<Self> {
        let state = raw.require_str(ENTITY, "state")?;
        let status = JobStatus::parse(state)
            .ok_or_else(|| ClientError::decode(ENTITY, "state", format!("unexpected value {state:?}")))?;
        let progress = match raw.get("progress") {
            None | Some(FieldValue::Null) => JobProgress::default(),
            Some(FieldValue::Map(progress)) => JobProgress {
                percent: progress.get("percent").and_then(FieldValue::as_f64),
                description: progress
                    .get("description")
                    .and_then(FieldValue::as_str)
                    .map(str::to_owned),
            },
            Some(other) => {
                return Err(ClientError::decode(
                    ENTITY,
                    "progress",
                    format!("expected map, got {}", other.type_name()),
                ));
            }
        };
        Ok(Self {
            id: raw.require_i64(ENTITY, "id")?,
            method: raw.require_str(ENTITY, "method")?.to_string(),
            status,
            result: raw.get("result").cloned().unwrap_or(FieldValue::Null),
            error: raw.optional_str(ENTITY, "error")?.map(str::to_owned),
            progress,
            arguments: raw
                .get("arguments")
                .and_then(FieldValue::as_list)
                .map(<[FieldValue]>::to_vec)
                .unwrap_or_default(),
            time_started: optional_date(raw, "time_started")?,
            time_finished: optional_date(raw, "time_finished")?,
        })
    }

    /// Best-effort state of a job known only from partial pushes.
    ///
    /// Fields missing from `raw` are left empty; `method` is blank when the
    /// job's creation was never seen.
    fn partial(id: JobId, status: JobStatus, raw: &FieldMap) -> Self {
        Self {
            id,
            method: raw.get("method").and_then(FieldValue::as_str).unwrap_or_default().to_string(),
            status,
            result: raw.get("result").cloned().unwrap_or(FieldValue::Null),
            error: raw.get("error").and_then(FieldValue::as_str).map(str::to_owned),
            progress: JobProgress::default(),
            arguments: Vec::new(),
            time_started: None,
            time_finished: None,
        }
    }

    /// Whether the job reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The job's result, or its error as [`ClientError::JobFailed`].
    ///
    /// Fails with [`ClientError::Precondition`] while the job is still
    /// running.
    pub fn result_or_error(&self) -> Result<FieldValue> {
        if !self.is_terminal() {
            return Err(ClientError::Precondition(format!(
                "job {} is still {}",
                self.id, self.status
            )));
        }
        if let Some(message) = &self.error {
            return Err(ClientError::JobFailed {
                id: self.id,
                message: message.clone(),
            });
        }
        if self.status == JobStatus::Aborted {
            return Err(ClientError::JobFailed {
                id: self.id,
                message: "aborted".to_string(),
            });
        }
        Ok(self.result.clone())
    }
}

/// Terminal state of a raw job document, if its `state` is terminal.
///
/// Only `state` has to be present; a document that does not fully decode
/// still settles its job.
fn settled(id: JobId, raw: &FieldMap) -> Option<JobState> {
    let status = raw.get("state").and_then(FieldValue::as_str).and_then(JobStatus::parse)?;
    if !status.is_terminal() {
        return None;
    }
    Some(JobState::decode(raw).unwrap_or_else(|e| {
        debug!(id, error = %e, "terminal job update is partial");
        JobState::partial(id, status, raw)
    }))
}

fn optional_date(raw: &FieldMap, field: &str) -> Result<Option<DateTime<Utc>>> {
    match raw.get(field) {
        None | Some(FieldValue::Null) => Ok(None),
        Some(FieldValue::Date(date)) => Ok(Some(*date)),
        Some(other) => Err(ClientError::decode(
            ENTITY,
            field,
            format!("expected date, got {}", other.type_name()),
        )),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Waiter
// ─────────────────────────────────────────────────────────────────────────────

type WaitReply = oneshot::Sender<Result<JobState>>;

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, FieldMap>,
    waiters: HashMap<JobId, WaitReply>,
    stopped: Option<String>,
}

impl JobTable {
    fn apply(&mut self, event: PushEvent) {
        let id = event
            .id
            .as_i64()
            .or_else(|| event.fields.get("id").and_then(FieldValue::as_i64));
        let Some(id) = id else {
            warn!(id = ?event.id, "job update without an integer id");
            return;
        };

        let raw = self.jobs.entry(id).or_default();
        match event.kind {
            PushKind::Added => *raw = event.fields,
            PushKind::Changed => raw.extend(event.fields),
        }
        let _ = raw.entry("id".to_string()).or_insert(FieldValue::Integer(id));
        debug!(id, state = raw.get("state").and_then(FieldValue::as_str), "job update");
        self.resolve(id);
    }

    /// Hand a terminal state to the waiter for `id`, if there is one.
    fn resolve(&mut self, id: JobId) {
        if !self.waiters.contains_key(&id) {
            return;
        }
        let Some(state) = self.terminal(id) else {
            return;
        };
        if let Some(waiter) = self.waiters.remove(&id) {
            let _ = waiter.send(Ok(state));
        }
    }

    fn terminal(&self, id: JobId) -> Option<JobState> {
        settled(id, self.jobs.get(&id)?)
    }

    fn stop(&mut self, reason: &str) {
        if self.stopped.is_none() {
            self.stopped = Some(reason.to_string());
        }
        let cancelled = self.waiters.len();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(ClientError::Cancelled(reason.to_string())));
        }
        if cancelled > 0 {
            debug!(cancelled, reason, "job waits cancelled");
        }
    }
}

/// Consumer of the job topic.
///
/// At most one [`wait_for`](Self::wait_for) may be outstanding per job id.
/// When the topic ends (unsubscribed, connection closed) or
/// [`stop`](Self::stop) is called, every outstanding wait resolves with
/// [`ClientError::Cancelled`].
pub struct JobWaiter {
    topic: String,
    table: Arc<Mutex<JobTable>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for JobWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("JobWaiter")
            .field("topic", &self.topic)
            .field("jobs", &table.jobs.len())
            .field("waiters", &table.waiters.len())
            .field("stopped", &table.stopped)
            .finish_non_exhaustive()
    }
}

impl JobWaiter {
    /// Subscribe to [`JOBS_TOPIC`] on `connection` and start consuming it.
    pub async fn subscribe(connection: &Connection) -> Result<Self> {
        let queue = connection.subscribe(JOBS_TOPIC).await?;
        Ok(Self::start(queue))
    }

    /// Start consuming an already-subscribed queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(queue: SubscriptionQueue) -> Self {
        let topic = queue.topic().to_string();
        let table = Arc::new(Mutex::new(JobTable::default()));
        let task = tokio::spawn(consume(queue, Arc::clone(&table)));
        Self {
            topic,
            table,
            task: Mutex::new(Some(task)),
        }
    }

    /// Topic this waiter consumes.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait until job `id` reaches a terminal status.
    ///
    /// Returns immediately when a terminal state is already cached. The
    /// returned state may describe a failed job; use
    /// [`JobState::result_or_error`] to turn that into an error.
    pub async fn wait_for(&self, id: JobId) -> Result<JobState> {
        let rx = {
            let mut table = self.table.lock();
            if let Some(reason) = &table.stopped {
                return Err(ClientError::Cancelled(reason.clone()));
            }
            if let Some(state) = table.terminal(id) {
                return Ok(state);
            }
            // A waiter whose caller went away does not block a new one.
            if table.waiters.get(&id).is_some_and(|waiter| !waiter.is_closed()) {
                return Err(ClientError::DuplicateJobWait(id));
            }
            let (tx, rx) = oneshot::channel();
            let _ = table.waiters.insert(id, tx);
            rx
        };
        rx.await
            .map_err(|_| ClientError::Cancelled("job waiter dropped".to_string()))?
    }

    /// Cached state of job `id`, if any update for it was seen.
    pub fn cached(&self, id: JobId) -> Option<Result<JobState>> {
        let table = self.table.lock();
        table.jobs.get(&id).map(JobState::decode)
    }

    /// State of job `id`, from the cache or from the server.
    ///
    /// The server is queried unless the cached document fully decodes.
    /// Fields pushed for the job take precedence over the queried row.
    pub async fn get_job(&self, invoker: &dyn MethodInvoker, id: JobId) -> Result<JobState> {
        if let Some(Ok(state)) = self.cached(id) {
            return Ok(state);
        }
        let result = invoker
            .invoke(JOBS_TOPIC, vec![json!([["id", "=", id]])])
            .await?;
        let Some(raw) = query_rows(JOBS_TOPIC, result)?.into_iter().next() else {
            return Err(ClientError::NotFound {
                kind: ENTITY,
                key: id.to_string(),
            });
        };
        let mut table = self.table.lock();
        let entry = table.jobs.entry(id).or_default();
        let mut merged = raw;
        merged.extend(std::mem::take(entry));
        entry.clone_from(&merged);
        table.resolve(id);
        JobState::decode(&merged)
    }

    /// Number of outstanding waits.
    pub fn pending_waits(&self) -> usize {
        self.table.lock().waiters.len()
    }

    /// Whether the waiter stopped consuming.
    pub fn is_stopped(&self) -> bool {
        self.table.lock().stopped.is_some()
    }

    /// Stop consuming and cancel every outstanding wait.
    ///
    /// Does not unsubscribe the topic; the owner of the connection does.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.table.lock().stop("job waiter stopped");
    }
}

impl Drop for JobWaiter {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Invoke a job-returning method and wait for the job to finish.
pub(crate) async fn run_job(
    invoker: &dyn MethodInvoker,
    jobs: &JobWaiter,
    method: &str,
    params: Vec<Value>,
) -> Result<JobState> {
    let reply = invoker.invoke(method, params).await?;
    let Some(id) = reply.as_i64() else {
        return Err(ClientError::ProtocolViolation(format!(
            "{method} returned {}, expected a job id",
            reply.type_name()
        )));
    };
    debug!(method, id, "waiting for job");
    jobs.wait_for(id).await
}

async fn consume(mut queue: SubscriptionQueue, table: Arc<Mutex<JobTable>>) {
    while let Some(event) = queue.recv().await {
        table.lock().apply(event);
    }
    debug!(topic = queue.topic(), "job subscription ended");
    table.lock().stop("job subscription ended");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedInvoker;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::time::timeout;
    use truenas_core::value::field_map_from_json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn event(kind: PushKind, id: i64, fields: serde_json::Value) -> PushEvent {
        PushEvent {
            kind,
            collection: JOBS_TOPIC.to_string(),
            id: FieldValue::Integer(id),
            fields: field_map_from_json(fields).unwrap(),
        }
    }

    fn job(id: i64, state: &str) -> PushEvent {
        event(
            PushKind::Added,
            id,
            json!({"id": id, "method": "jail.start", "state": state, "result": null, "error": null}),
        )
    }

    fn waiter() -> (UnboundedSender<PushEvent>, JobWaiter) {
        let (tx, queue) = SubscriptionQueue::channel(JOBS_TOPIC);
        (tx, JobWaiter::start(queue))
    }

    async fn settle(waiter: &JobWaiter, id: JobId) {
        timeout(TIMEOUT, async {
            while waiter.cached(id).is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn status_parse_and_terminal() {
        assert_eq!(JobStatus::parse("RUNNING"), Some(JobStatus::Running));
        assert_eq!(JobStatus::parse("running"), None);
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Aborted.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
        assert_eq!(JobStatus::Failed.to_string(), "FAILED");
    }

    #[test]
    fn decodes_full_document() {
        let raw = field_map_from_json(json!({
            "id": 12,
            "method": "pool.scrub",
            "state": "RUNNING",
            "arguments": [3, "START"],
            "progress": {"percent": 40, "description": "scrubbing"},
            "result": null,
            "error": null,
            "time_started": {"$date": 1_600_000_000_000_i64},
            "time_finished": null
        }))
        .unwrap();

        let state = JobState::decode(&raw).unwrap();
        assert_eq!(state.id, 12);
        assert_eq!(state.method, "pool.scrub");
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(state.progress.percent, Some(40.0));
        assert_eq!(state.progress.description.as_deref(), Some("scrubbing"));
        assert_eq!(state.arguments.len(), 2);
        assert_eq!(state.time_started.unwrap().timestamp(), 1_600_000_000);
        assert!(state.time_finished.is_none());
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let raw = field_map_from_json(json!({"id": 1, "method": "m", "state": "PAUSED"})).unwrap();
        let err = JobState::decode(&raw).unwrap_err();
        assert_matches!(err, ClientError::Decode { entity: "job", field, .. } if field == "state");
    }

    #[test]
    fn result_or_error() {
        let raw = field_map_from_json(json!({"id": 1, "method": "m", "state": "SUCCESS", "result": true})).unwrap();
        assert_eq!(JobState::decode(&raw).unwrap().result_or_error().unwrap(), FieldValue::Bool(true));

        let raw = field_map_from_json(json!({"id": 2, "method": "m", "state": "FAILED", "error": "boom"})).unwrap();
        let err = JobState::decode(&raw).unwrap().result_or_error().unwrap_err();
        assert_matches!(err, ClientError::JobFailed { id: 2, message } if message == "boom");

        let raw = field_map_from_json(json!({"id": 3, "method": "m", "state": "RUNNING"})).unwrap();
        let err = JobState::decode(&raw).unwrap().result_or_error().unwrap_err();
        assert_matches!(err, ClientError::Precondition(_));

        let raw = field_map_from_json(json!({"id": 4, "method": "m", "state": "ABORTED"})).unwrap();
        let err = JobState::decode(&raw).unwrap().result_or_error().unwrap_err();
        assert_matches!(err, ClientError::JobFailed { id: 4, .. });
    }

    #[tokio::test]
    async fn wait_resolves_on_terminal_push() {
        let (tx, waiter) = waiter();
        let waiter = Arc::new(waiter);

        let wait = tokio::spawn({
            let waiter = Arc::clone(&waiter);
            async move { waiter.wait_for(7).await }
        });
        timeout(TIMEOUT, async {
            while waiter.pending_waits() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        tx.send(job(7, "RUNNING")).unwrap();
        tx.send(job(7, "SUCCESS")).unwrap();

        let state = timeout(TIMEOUT, wait).await.unwrap().unwrap().unwrap();
        assert_eq!(state.id, 7);
        assert_eq!(state.status, JobStatus::Success);
        assert_eq!(waiter.pending_waits(), 0);
    }

    #[tokio::test]
    async fn changed_push_merges_fields() {
        let (tx, waiter) = waiter();
        tx.send(job(3, "RUNNING")).unwrap();
        tx.send(event(PushKind::Changed, 3, json!({"state": "SUCCESS", "result": 42})))
            .unwrap();

        let state = timeout(TIMEOUT, waiter.wait_for(3)).await.unwrap().unwrap();
        assert_eq!(state.method, "jail.start");
        assert_eq!(state.result, FieldValue::Integer(42));
    }

    #[tokio::test]
    async fn changed_only_terminal_job_resolves_wait() {
        let (tx, waiter) = waiter();
        let waiter = Arc::new(waiter);
        let wait = tokio::spawn({
            let waiter = Arc::clone(&waiter);
            async move { waiter.wait_for(42).await }
        });
        timeout(TIMEOUT, async {
            while waiter.pending_waits() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Started before the subscription, so no `added` was ever seen.
        tx.send(event(PushKind::Changed, 42, json!({"id": 42, "state": "SUCCESS", "result": true})))
            .unwrap();

        let state = timeout(TIMEOUT, wait).await.unwrap().unwrap().unwrap();
        assert_eq!(state.id, 42);
        assert_eq!(state.status, JobStatus::Success);
        assert!(state.method.is_empty());
        assert_eq!(state.result_or_error().unwrap(), FieldValue::Bool(true));
    }

    #[tokio::test]
    async fn changed_only_failure_carries_error() {
        let (tx, waiter) = waiter();
        tx.send(event(PushKind::Changed, 13, json!({"state": "FAILED", "error": "no space"})))
            .unwrap();
        settle(&waiter, 13).await;

        let state = timeout(TIMEOUT, waiter.wait_for(13)).await.unwrap().unwrap();
        assert_matches!(state.result_or_error(), Err(ClientError::JobFailed { id: 13, message }) if message == "no space");
    }

    #[tokio::test]
    async fn wait_on_finished_job_returns_immediately() {
        let (tx, waiter) = waiter();
        tx.send(job(5, "FAILED")).unwrap();
        settle(&waiter, 5).await;

        let state = waiter.wait_for(5).await.unwrap();
        assert_eq!(state.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn second_wait_for_same_job_fails_fast() {
        let (_tx, waiter) = waiter();
        let waiter = Arc::new(waiter);
        let first = tokio::spawn({
            let waiter = Arc::clone(&waiter);
            async move { waiter.wait_for(9).await }
        });
        timeout(TIMEOUT, async {
            while waiter.pending_waits() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let err = waiter.wait_for(9).await.unwrap_err();
        assert_matches!(err, ClientError::DuplicateJobWait(9));
        assert!(!first.is_finished());

        waiter.stop();
        let err = timeout(TIMEOUT, first).await.unwrap().unwrap().unwrap_err();
        assert_matches!(err, ClientError::Cancelled(_));
    }

    #[tokio::test]
    async fn abandoned_wait_does_not_block_a_new_one() {
        let (tx, waiter) = waiter();
        let abandoned = timeout(Duration::from_millis(20), waiter.wait_for(4)).await;
        assert!(abandoned.is_err());

        let again = waiter.wait_for(4);
        tx.send(job(4, "SUCCESS")).unwrap();
        let state = timeout(TIMEOUT, again).await.unwrap().unwrap();
        assert_eq!(state.id, 4);
    }

    #[tokio::test]
    async fn queue_end_cancels_waits() {
        let (tx, waiter) = waiter();
        let waiter = Arc::new(waiter);
        let wait = tokio::spawn({
            let waiter = Arc::clone(&waiter);
            async move { waiter.wait_for(1).await }
        });
        timeout(TIMEOUT, async {
            while waiter.pending_waits() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        drop(tx);

        let err = timeout(TIMEOUT, wait).await.unwrap().unwrap().unwrap_err();
        assert_matches!(err, ClientError::Cancelled(reason) if reason == "job subscription ended");
        assert!(waiter.is_stopped());
        assert_matches!(waiter.wait_for(2).await, Err(ClientError::Cancelled(_)));
    }

    #[tokio::test]
    async fn update_without_id_is_ignored() {
        let (tx, waiter) = waiter();
        tx.send(PushEvent {
            kind: PushKind::Added,
            collection: JOBS_TOPIC.to_string(),
            id: FieldValue::Null,
            fields: field_map_from_json(json!({"state": "SUCCESS"})).unwrap(),
        })
        .unwrap();
        tx.send(job(8, "SUCCESS")).unwrap();
        settle(&waiter, 8).await;

        assert!(!waiter.is_stopped());
        assert!(waiter.cached(8).unwrap().is_ok());
    }

    #[tokio::test]
    async fn get_job_prefers_cache() {
        let (tx, waiter) = waiter();
        tx.send(job(6, "RUNNING")).unwrap();
        settle(&waiter, 6).await;
        let invoker = ScriptedInvoker::new();

        let state = waiter.get_job(&invoker, 6).await.unwrap();
        assert_eq!(state.status, JobStatus::Running);
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn get_job_queries_by_id_and_caches() {
        let (_tx, waiter) = waiter();
        let invoker = ScriptedInvoker::new();
        invoker.reply(
            JOBS_TOPIC,
            json!([{"id": 11, "method": "vm.stop", "state": "SUCCESS", "result": null}]),
        );

        let state = waiter.get_job(&invoker, 11).await.unwrap();
        assert_eq!(state.method, "vm.stop");
        assert_eq!(invoker.calls_to(JOBS_TOPIC), vec![vec![json!([["id", "=", 11]])]]);

        // Cached now, and terminal, so waiting returns at once.
        assert_eq!(waiter.wait_for(11).await.unwrap().id, 11);
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn get_job_with_partial_cache_asks_the_server() {
        let (tx, waiter) = waiter();
        tx.send(event(PushKind::Changed, 43, json!({"id": 43, "state": "RUNNING"})))
            .unwrap();
        settle(&waiter, 43).await;
        let invoker = ScriptedInvoker::new();
        invoker.reply(
            JOBS_TOPIC,
            json!([{"id": 43, "method": "pool.scrub", "state": "WAITING", "arguments": [1]}]),
        );

        let state = waiter.get_job(&invoker, 43).await.unwrap();

        assert_eq!(invoker.calls_to(JOBS_TOPIC).len(), 1);
        assert_eq!(state.method, "pool.scrub");
        // The pushed status is newer than the queried row.
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(state.arguments, vec![FieldValue::Integer(1)]);
        assert!(waiter.cached(43).unwrap().is_ok());
    }

    #[tokio::test]
    async fn get_job_unknown_id_is_not_found() {
        let (_tx, waiter) = waiter();
        let invoker = ScriptedInvoker::new();
        invoker.reply(JOBS_TOPIC, json!([]));

        let err = waiter.get_job(&invoker, 99).await.unwrap_err();
        assert_matches!(err, ClientError::NotFound { kind: "job", key } if key == "99");
    }
}
