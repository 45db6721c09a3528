//! Virtual machines, keyed by integer id.
//!
//! Start, stop and restart wait for their job, then re-read `vm.status` so
//! the cached status reflects what the hypervisor reports afterwards.

use std::fmt;

use serde_json::{Value, json};
use tracing::info;
use truenas_core::value::FieldMapExt;
use truenas_core::{ClientError, FieldMap, FieldValue, Result};

use crate::cache::{CachedEntity, EntityKind};
use crate::job::run_job;

const ENTITY: &str = "vm";

/// Hypervisor state of a virtual machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VmStatus {
    /// Running.
    Running,
    /// Stopped.
    Stopped,
    /// Failed to start or crashed.
    Error,
}

impl VmStatus {
    /// Parse the wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(Self::Running),
            "STOPPED" => Some(Self::Stopped),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        })
    }
}

/// Decoded state of one virtual machine.
#[derive(Clone, Debug, PartialEq)]
pub struct VmState {
    /// Numeric id.
    pub id: i64,
    /// Name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Hypervisor state.
    pub status: VmStatus,
}

/// Decode a `{"state": "RUNNING", ..}` status document.
fn decode_status(doc: &FieldMap) -> Result<VmStatus> {
    let Some(raw) = doc.get("state").and_then(FieldValue::as_str) else {
        return Err(ClientError::decode(ENTITY, "status.state", "missing"));
    };
    VmStatus::parse(raw)
        .ok_or_else(|| ClientError::decode(ENTITY, "status.state", format!("unexpected value {raw:?}")))
}

/// Virtual machine entity kind.
#[derive(Debug)]
pub struct VmKind;

impl EntityKind for VmKind {
    type Key = i64;
    type State = VmState;

    const NAME: &'static str = ENTITY;
    const QUERY_METHOD: &'static str = "vm.query";
    const SELECT: &'static [&'static str] = &["id", "name", "description", "status"];

    fn decode(row: &FieldMap) -> Result<(i64, VmState)> {
        let id = row.require_i64(ENTITY, "id")?;
        let state = VmState {
            id,
            name: row.require_str(ENTITY, "name")?.to_string(),
            description: row
                .optional_str(ENTITY, "description")?
                .unwrap_or_default()
                .to_string(),
            status: decode_status(row.require_map(ENTITY, "status")?)?,
        };
        Ok((id, state))
    }
}

/// A cached virtual machine.
pub type VirtualMachine = CachedEntity<VmKind>;

impl CachedEntity<VmKind> {
    /// Numeric id.
    pub fn id(&self) -> i64 {
        *self.key()
    }

    /// Name.
    pub fn name(&self) -> String {
        self.read(|s| s.name.clone())
    }

    /// Description.
    pub fn description(&self) -> String {
        self.read(|s| s.description.clone())
    }

    /// Hypervisor state; only readable while the machine exists.
    pub fn status(&self) -> Result<VmStatus> {
        self.read_live("status", |s| s.status)
    }

    /// Start the machine and wait for the start job.
    pub async fn start(&self, overcommit: bool) -> Result<FieldValue> {
        self.lifecycle("vm.start", vec![json!(self.id()), json!({ "overcommit": overcommit })])
            .await
    }

    /// Stop the machine and wait for the stop job.
    ///
    /// With `force`, the machine is powered off if it does not shut down in
    /// time.
    pub async fn stop(&self, force: bool) -> Result<FieldValue> {
        self.lifecycle(
            "vm.stop",
            vec![json!(self.id()), json!({ "force_after_timeout": force })],
        )
        .await
    }

    /// Restart the machine and wait for the restart job.
    pub async fn restart(&self) -> Result<FieldValue> {
        self.lifecycle("vm.restart", vec![json!(self.id())]).await
    }

    async fn lifecycle(&self, method: &str, params: Vec<Value>) -> Result<FieldValue> {
        let _ = self.status()?;
        let invoker = self.invoker()?;
        let jobs = self.jobs()?;
        let job = run_job(invoker.as_ref(), &jobs, method, params).await?;

        let reply = invoker.invoke("vm.status", vec![json!(self.id())]).await?;
        let Some(doc) = reply.as_map() else {
            return Err(ClientError::ProtocolViolation(format!(
                "vm.status returned {}, expected a map",
                reply.type_name()
            )));
        };
        let status = decode_status(doc)?;
        let _ = self.patch(|s| s.status = status);
        info!(vm = self.id(), method, job = %job.status, %status, "vm job finished");
        job.result_or_error()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
