//! FreeBSD jails, keyed by name.
//!
//! Start, stop and restart are jobs: each call waits for its job to finish
//! and patches the cached status when the job succeeds.

use std::fmt;

use serde_json::json;
use tracing::info;
use truenas_core::value::FieldMapExt;
use truenas_core::{ClientError, FieldMap, FieldValue, Result};

use crate::cache::{CachedEntity, EntityKind};
use crate::job::run_job;

const ENTITY: &str = "jail";

/// Whether a jail is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JailStatus {
    /// Running.
    Up,
    /// Stopped.
    Down,
}

impl JailStatus {
    /// Parse the wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

impl fmt::Display for JailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

/// Decoded state of one jail.
#[derive(Clone, Debug, PartialEq)]
pub struct JailState {
    /// Jail name.
    pub name: String,
    /// Running or stopped.
    pub status: JailStatus,
}

/// Jail entity kind.
#[derive(Debug)]
pub struct JailKind;

impl EntityKind for JailKind {
    type Key = String;
    type State = JailState;

    const NAME: &'static str = ENTITY;
    const QUERY_METHOD: &'static str = "jail.query";
    const SELECT: &'static [&'static str] = &["id", "state"];

    fn decode(row: &FieldMap) -> Result<(String, JailState)> {
        let name = row.require_str(ENTITY, "id")?.to_string();
        let raw = row.require_str(ENTITY, "state")?;
        let status = JailStatus::parse(raw)
            .ok_or_else(|| ClientError::decode(ENTITY, "state", format!("unexpected value {raw:?}")))?;
        Ok((name.clone(), JailState { name, status }))
    }
}

/// A cached jail.
pub type Jail = CachedEntity<JailKind>;

impl CachedEntity<JailKind> {
    /// Jail name.
    pub fn name(&self) -> &str {
        self.key()
    }

    /// Current status; only readable while the jail exists.
    pub fn status(&self) -> Result<JailStatus> {
        self.read_live("status", |s| s.status)
    }

    fn require_status(&self, expected: JailStatus, complaint: &str) -> Result<()> {
        if self.status()? == expected {
            Ok(())
        } else {
            Err(ClientError::Precondition(format!("jail {} {complaint}", self.name())))
        }
    }

    /// Start a stopped jail and wait for it to come up.
    pub async fn start(&self) -> Result<FieldValue> {
        self.require_status(JailStatus::Down, "is already running")?;
        let result = self
            .lifecycle("jail.start", vec![json!(self.name())])
            .await?;
        let _ = self.patch(|s| s.status = JailStatus::Up);
        Ok(result)
    }

    /// Stop a running jail and wait for it to go down.
    pub async fn stop(&self, force: bool) -> Result<FieldValue> {
        self.require_status(JailStatus::Up, "is not running")?;
        let result = self
            .lifecycle("jail.stop", vec![json!(self.name()), json!(force)])
            .await?;
        let _ = self.patch(|s| s.status = JailStatus::Down);
        Ok(result)
    }

    /// Restart a running jail and wait for it to finish.
    pub async fn restart(&self) -> Result<FieldValue> {
        self.require_status(JailStatus::Up, "is not running")?;
        let result = self
            .lifecycle("jail.restart", vec![json!(self.name())])
            .await?;
        let _ = self.patch(|s| s.status = JailStatus::Up);
        Ok(result)
    }

    async fn lifecycle(&self, method: &str, params: Vec<serde_json::Value>) -> Result<FieldValue> {
        let invoker = self.invoker()?;
        let jobs = self.jobs()?;
        let job = run_job(invoker.as_ref(), &jobs, method, params).await?;
        info!(jail = %self.name(), method, status = %job.status, "jail job finished");
        job.result_or_error()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Reconciler;
    use crate::job::{JOBS_TOPIC, JobWaiter};
    use crate::testing::ScriptedInvoker;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::time::timeout;
    use truenas_core::value::field_map_from_json;
    use truenas_ddp::{PushEvent, PushKind, SubscriptionQueue};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        invoker: Arc<ScriptedInvoker>,
        pushes: UnboundedSender<PushEvent>,
        jails: Reconciler<JailKind>,
    }

    fn fixture() -> Fixture {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply(
            "jail.query",
            json!([{"id": "web", "state": "down"}, {"id": "db", "state": "up"}]),
        );
        let (pushes, queue) = SubscriptionQueue::channel(JOBS_TOPIC);
        let jobs = Arc::new(JobWaiter::start(queue));
        let jails = Reconciler::with_jobs(invoker.clone(), jobs);
        Fixture {
            invoker,
            pushes,
            jails,
        }
    }

    fn finished(id: i64, method: &str, state: &str, error: Option<&str>) -> PushEvent {
        PushEvent {
            kind: PushKind::Added,
            collection: JOBS_TOPIC.to_string(),
            id: FieldValue::Integer(id),
            fields: field_map_from_json(json!({
                "id": id, "method": method, "state": state, "result": true, "error": error
            }))
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn start_waits_for_job_and_marks_up() {
        let f = fixture();
        f.invoker.reply("jail.start", json!(31));
        let jails = f.jails.refresh().await.unwrap();
        let web = Arc::clone(&jails[0]);
        assert_eq!(web.status().unwrap(), JailStatus::Down);

        f.pushes.send(finished(31, "jail.start", "SUCCESS", None)).unwrap();
        let result = timeout(TIMEOUT, web.start()).await.unwrap().unwrap();

        assert_eq!(result, FieldValue::Bool(true));
        assert_eq!(web.status().unwrap(), JailStatus::Up);
        assert_eq!(f.invoker.calls_to("jail.start"), vec![vec![json!("web")]]);
    }

    #[tokio::test]
    async fn stop_passes_force_and_marks_down() {
        let f = fixture();
        f.invoker.reply("jail.stop", json!(32));
        let jails = f.jails.refresh().await.unwrap();
        let db = Arc::clone(&jails[1]);

        f.pushes.send(finished(32, "jail.stop", "SUCCESS", None)).unwrap();
        let _ = timeout(TIMEOUT, db.stop(true)).await.unwrap().unwrap();

        assert_eq!(db.status().unwrap(), JailStatus::Down);
        assert_eq!(f.invoker.calls_to("jail.stop"), vec![vec![json!("db"), json!(true)]]);
    }

    #[tokio::test]
    async fn failed_job_is_an_error_and_keeps_status() {
        let f = fixture();
        f.invoker.reply("jail.start", json!(33));
        let jails = f.jails.refresh().await.unwrap();

        f.pushes
            .send(finished(33, "jail.start", "FAILED", Some("no such interface")))
            .unwrap();
        let err = timeout(TIMEOUT, jails[0].start()).await.unwrap().unwrap_err();

        assert_matches!(err, ClientError::JobFailed { id: 33, message } if message == "no such interface");
        assert_eq!(jails[0].status().unwrap(), JailStatus::Down);
    }

    #[tokio::test]
    async fn wrong_status_fails_before_any_call() {
        let f = fixture();
        let jails = f.jails.refresh().await.unwrap();

        assert_matches!(jails[0].stop(false).await, Err(ClientError::Precondition(_)));
        assert_matches!(jails[0].restart().await, Err(ClientError::Precondition(_)));
        assert_matches!(jails[1].start().await, Err(ClientError::Precondition(msg)) if msg.contains("already running"));
        assert_eq!(f.invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn vanished_jail_status_is_a_precondition() {
        let f = fixture();
        let jails = f.jails.refresh().await.unwrap();
        f.invoker.reply("jail.query", json!([]));
        // The fixture's listing is consumed first, then the empty one sticks.
        let _ = f.jails.refresh().await.unwrap();
        let _ = f.jails.refresh().await.unwrap();

        assert_eq!(jails[0].name(), "web");
        assert_matches!(jails[0].status(), Err(ClientError::Precondition(_)));
        assert_matches!(jails[0].start().await, Err(ClientError::Precondition(_)));
    }

    #[tokio::test]
    async fn non_integer_job_id_is_a_protocol_violation() {
        let f = fixture();
        f.invoker.reply("jail.start", json!(true));
        let jails = f.jails.refresh().await.unwrap();

        assert_matches!(jails[0].start().await, Err(ClientError::ProtocolViolation(_)));
    }
}
