//! Storage pools, keyed by GUID.

use std::fmt;

use truenas_core::value::FieldMapExt;
use truenas_core::{ClientError, FieldMap, FieldValue, Result};

use crate::cache::{CachedEntity, EntityKind};

const ENTITY: &str = "pool";

/// ZFS pool health.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolStatus {
    /// Degraded but usable.
    Degraded,
    /// Faulted.
    Faulted,
    /// Taken offline.
    Offline,
    /// Healthy.
    Online,
    /// Device removed.
    Removed,
    /// Cannot be opened.
    Unavail,
    /// Status not known to the server.
    Unknown,
}

impl PoolStatus {
    /// Parse the wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DEGRADED" => Some(Self::Degraded),
            "FAULTED" => Some(Self::Faulted),
            "OFFLINE" => Some(Self::Offline),
            "ONLINE" => Some(Self::Online),
            "REMOVED" => Some(Self::Removed),
            "UNAVAIL" => Some(Self::Unavail),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Degraded => "DEGRADED",
            Self::Faulted => "FAULTED",
            Self::Offline => "OFFLINE",
            Self::Online => "ONLINE",
            Self::Removed => "REMOVED",
            Self::Unavail => "UNAVAIL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded state of one pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolState {
    /// Pool GUID.
    pub guid: String,
    /// Numeric id.
    pub id: i64,
    /// Pool name.
    pub name: String,
    /// Encryption mode (0 = none).
    pub encrypt: i64,
    /// Whether an encrypted pool is unlocked.
    pub is_decrypted: bool,
    /// Health.
    pub status: PoolStatus,
    /// Vdev layout as reported by the server.
    pub topology: FieldMap,
}

/// Pool entity kind.
#[derive(Debug)]
pub struct PoolKind;

impl EntityKind for PoolKind {
    type Key = String;
    type State = PoolState;

    const NAME: &'static str = ENTITY;
    const QUERY_METHOD: &'static str = "pool.query";
    const SELECT: &'static [&'static str] = &[
        "encrypt",
        "encryptkey",
        "guid",
        "id",
        "is_decrypted",
        "name",
        "status",
        "topology",
    ];

    fn decode(row: &FieldMap) -> Result<(String, PoolState)> {
        let guid = row.require_str(ENTITY, "guid")?.to_string();
        let raw_status = row.require_str(ENTITY, "status")?;
        let status = PoolStatus::parse(raw_status).ok_or_else(|| {
            ClientError::decode(ENTITY, "status", format!("unexpected value {raw_status:?}"))
        })?;
        let topology = match row.get("topology") {
            None | Some(FieldValue::Null) => FieldMap::new(),
            Some(_) => row.require_map(ENTITY, "topology")?.clone(),
        };
        let state = PoolState {
            guid: guid.clone(),
            id: row.require_i64(ENTITY, "id")?,
            name: row.require_str(ENTITY, "name")?.to_string(),
            encrypt: row.optional_i64(ENTITY, "encrypt")?.unwrap_or_default(),
            is_decrypted: row.require_bool(ENTITY, "is_decrypted")?,
            status,
            topology,
        };
        Ok((guid, state))
    }
}

/// A cached pool.
pub type Pool = CachedEntity<PoolKind>;

impl CachedEntity<PoolKind> {
    /// Pool GUID.
    pub fn guid(&self) -> &str {
        self.key()
    }

    /// Numeric id.
    pub fn id(&self) -> i64 {
        self.read(|s| s.id)
    }

    /// Pool name.
    pub fn name(&self) -> String {
        self.read(|s| s.name.clone())
    }

    /// Encryption mode.
    pub fn encrypt(&self) -> i64 {
        self.read(|s| s.encrypt)
    }

    /// Whether an encrypted pool is unlocked.
    pub fn is_decrypted(&self) -> bool {
        self.read(|s| s.is_decrypted)
    }

    /// Health.
    pub fn status(&self) -> PoolStatus {
        self.read(|s| s.status)
    }

    /// Vdev layout.
    pub fn topology(&self) -> FieldMap {
        self.read(|s| s.topology.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
