//! # truenas-client
//!
//! Caching client built on the [`truenas_ddp`] protocol engine.
//!
//! - **Machine**: [`Machine`] connects, starts the job waiter and exposes
//!   one cache per entity kind
//! - **Jobs**: [`JobWaiter`] turns `core.get_jobs` pushes into awaitable
//!   job completions
//! - **Caches**: [`Reconciler`] keeps [`CachedEntity`] wrappers identity-stable
//!   across refreshes, with last-known-good snapshots for entities that
//!   disappear
//! - **Entities**: disks, pools, datasets, jails and virtual machines

#![deny(unsafe_code)]

pub mod cache;
pub mod dataset;
pub mod disk;
pub mod jail;
pub mod job;
pub mod machine;
pub mod pool;
pub mod vm;

#[cfg(test)]
mod testing;

pub use cache::{CachedEntity, EntityKind, Reconciler};
pub use dataset::{Dataset, DatasetKind, DatasetProperty, DatasetType, PropertySource};
pub use disk::{Disk, DiskKind, DiskType};
pub use jail::{Jail, JailKind, JailStatus};
pub use job::{JOBS_TOPIC, JobProgress, JobState, JobStatus, JobWaiter};
pub use machine::Machine;
pub use pool::{Pool, PoolKind, PoolStatus};
pub use vm::{VirtualMachine, VmKind, VmStatus};
