//! The `Machine` facade.
//!
//! One [`Machine`] owns one authenticated [`Connection`], the job waiter
//! subscribed on it, and one reconciler per entity kind. Entity wrappers
//! returned by the `get_*` calls stay valid (and live) across later calls.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use truenas_core::{ClientError, Credentials, FieldMap, FieldValue, JobId, Result};
use truenas_ddp::{ConnectOptions, Connection, ConnectionState, MethodInvoker, SubscriptionQueue};
use truenas_settings::ClientSettings;

use crate::cache::Reconciler;
use crate::dataset::{Dataset, DatasetKind};
use crate::disk::{Disk, DiskKind};
use crate::jail::{Jail, JailKind};
use crate::job::{JobState, JobWaiter};
use crate::pool::{Pool, PoolKind};
use crate::vm::{VirtualMachine, VmKind};

/// A connected, caching client for one appliance.
pub struct Machine {
    connection: Arc<Connection>,
    jobs: Arc<JobWaiter>,
    disks: Reconciler<DiskKind>,
    pools: Reconciler<PoolKind>,
    datasets: Reconciler<DatasetKind>,
    jails: Reconciler<JailKind>,
    vms: Reconciler<VmKind>,
}

impl Machine {
    /// Connect using layered settings.
    pub async fn create(settings: &ClientSettings) -> Result<Self> {
        settings.validate()?;
        let credentials = settings.credentials()?;
        let options = ConnectOptions {
            handshake_timeout: settings.handshake_timeout(),
            command_buffer: settings.command_buffer,
        };
        Self::connect(&settings.url(), &credentials, &options).await
    }

    /// Connect to `url` and authenticate.
    pub async fn connect(url: &str, credentials: &Credentials, options: &ConnectOptions) -> Result<Self> {
        let connection = Connection::connect(url, credentials, options).await?;
        Self::from_connection(connection).await
    }

    /// Build on an already-open connection.
    ///
    /// Closes the connection if the job subscription cannot be set up.
    pub async fn from_connection(connection: Connection) -> Result<Self> {
        let jobs = match JobWaiter::subscribe(&connection).await {
            Ok(jobs) => Arc::new(jobs),
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };
        let connection = Arc::new(connection);
        let invoker: Arc<dyn MethodInvoker> = connection.clone();
        info!(session = %connection.session(), "machine ready");
        Ok(Self {
            disks: Reconciler::new(Arc::clone(&invoker)),
            pools: Reconciler::new(Arc::clone(&invoker)),
            datasets: Reconciler::new(Arc::clone(&invoker)),
            jails: Reconciler::with_jobs(Arc::clone(&invoker), Arc::clone(&jobs)),
            vms: Reconciler::with_jobs(invoker, Arc::clone(&jobs)),
            connection,
            jobs,
        })
    }

    // ── Protocol ────────────────────────────────────────────────────────

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Connection lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Invoke a remote method.
    pub async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<FieldValue> {
        self.connection.invoke(method, params).await
    }

    /// Subscribe to a topic.
    pub async fn subscribe(&self, topic: &str) -> Result<SubscriptionQueue> {
        self.connection.subscribe(topic).await
    }

    /// Cancel a topic subscription.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.connection.unsubscribe(topic).await
    }

    /// `system.info` of the appliance.
    pub async fn get_system_info(&self) -> Result<FieldMap> {
        match self.invoke("system.info", Vec::new()).await? {
            FieldValue::Map(info) => Ok(info),
            other => Err(ClientError::ProtocolViolation(format!(
                "system.info returned {}, expected a map",
                other.type_name()
            ))),
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    /// The job waiter.
    pub fn jobs(&self) -> &JobWaiter {
        &self.jobs
    }

    /// State of a job, from the cache or the server.
    pub async fn get_job(&self, id: JobId) -> Result<JobState> {
        self.jobs.get_job(self.connection.as_ref(), id).await
    }

    /// Wait for a job to reach a terminal status.
    pub async fn wait_for_job(&self, id: JobId) -> Result<JobState> {
        self.jobs.wait_for(id).await
    }

    // ── Entities ────────────────────────────────────────────────────────

    /// Refresh disks, optionally with temperatures.
    pub async fn get_disks(&self, include_temperature: bool) -> Result<Vec<Arc<Disk>>> {
        self.disks.refresh_disks(include_temperature).await
    }

    /// Disks from the last refresh.
    pub fn disks(&self) -> Vec<Arc<Disk>> {
        self.disks.entities()
    }

    /// Refresh pools.
    pub async fn get_pools(&self) -> Result<Vec<Arc<Pool>>> {
        self.pools.refresh().await
    }

    /// Pools from the last refresh.
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.entities()
    }

    /// Refresh datasets.
    pub async fn get_datasets(&self) -> Result<Vec<Arc<Dataset>>> {
        self.datasets.refresh().await
    }

    /// Datasets from the last refresh.
    pub fn datasets(&self) -> Vec<Arc<Dataset>> {
        self.datasets.entities()
    }

    /// Refresh jails.
    pub async fn get_jails(&self) -> Result<Vec<Arc<Jail>>> {
        self.jails.refresh().await
    }

    /// Jails from the last refresh.
    pub fn jails(&self) -> Vec<Arc<Jail>> {
        self.jails.entities()
    }

    /// Refresh virtual machines.
    pub async fn get_vms(&self) -> Result<Vec<Arc<VirtualMachine>>> {
        self.vms.refresh().await
    }

    /// Virtual machines from the last refresh.
    pub fn vms(&self) -> Vec<Arc<VirtualMachine>> {
        self.vms.entities()
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Stop the job waiter, then close the connection.
    ///
    /// Outstanding job waits resolve with [`ClientError::Cancelled`];
    /// outstanding calls with [`ClientError::ConnectionClosed`].
    pub async fn close(&self) {
        if self.connection.state().is_open() {
            if let Err(e) = self.connection.unsubscribe(self.jobs.topic()).await {
                debug!(error = %e, "job topic unsubscribe");
            }
        }
        self.jobs.stop();
        self.connection.close().await;
        info!("machine closed");
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}
