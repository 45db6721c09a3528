//! Physical disks, keyed by serial number.

use std::fmt;
use std::sync::Arc;

use serde_json::json;
use truenas_core::value::FieldMapExt;
use truenas_core::{ClientError, FieldMap, FieldValue, Result};

use crate::cache::{CachedEntity, EntityKind, Reconciler, query_rows};

const ENTITY: &str = "disk";

/// Method returning temperatures for a list of disk names.
pub const TEMPERATURES_METHOD: &str = "disk.temperatures";

/// Rotational or solid-state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiskType {
    /// Spinning disk.
    Hdd,
    /// Solid-state disk.
    Ssd,
}

impl DiskType {
    /// Parse the wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HDD" => Some(Self::Hdd),
            "SSD" => Some(Self::Ssd),
            _ => None,
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hdd => "HDD",
            Self::Ssd => "SSD",
        })
    }
}

/// Decoded state of one disk.
#[derive(Clone, Debug, PartialEq)]
pub struct DiskState {
    /// Device name (`ada0`, `sdb`).
    pub name: String,
    /// Serial number, trimmed.
    pub serial: String,
    /// Model string.
    pub model: String,
    /// User description.
    pub description: String,
    /// Size in bytes.
    pub size: i64,
    /// Rotational or solid-state.
    pub disk_type: DiskType,
    /// Temperature in °C, when requested and reported.
    pub temperature: Option<f64>,
}

/// Disk entity kind.
#[derive(Debug)]
pub struct DiskKind;

impl EntityKind for DiskKind {
    type Key = String;
    type State = DiskState;

    const NAME: &'static str = ENTITY;
    const QUERY_METHOD: &'static str = "disk.query";
    const SELECT: &'static [&'static str] =
        &["description", "model", "name", "serial", "size", "type"];

    fn decode(row: &FieldMap) -> Result<(String, DiskState)> {
        let serial = row.require_str(ENTITY, "serial")?.trim().to_string();
        let raw_type = row.require_str(ENTITY, "type")?;
        let disk_type = DiskType::parse(raw_type).ok_or_else(|| {
            ClientError::decode(ENTITY, "type", format!("unexpected value {raw_type:?}"))
        })?;
        let state = DiskState {
            name: row.require_str(ENTITY, "name")?.to_string(),
            serial: serial.clone(),
            model: row.optional_str(ENTITY, "model")?.unwrap_or_default().to_string(),
            description: row
                .optional_str(ENTITY, "description")?
                .unwrap_or_default()
                .to_string(),
            size: row.require_i64(ENTITY, "size")?,
            disk_type,
            temperature: row.get("temperature").and_then(FieldValue::as_f64),
        };
        Ok((serial, state))
    }
}

/// A cached disk.
pub type Disk = CachedEntity<DiskKind>;

impl Reconciler<DiskKind> {
    /// Refresh, optionally merging `disk.temperatures` into each disk.
    pub async fn refresh_disks(&self, include_temperature: bool) -> Result<Vec<Arc<Disk>>> {
        if !include_temperature {
            return self.refresh().await;
        }
        let invoker = self.invoker();
        let result = invoker
            .invoke(DiskKind::QUERY_METHOD, DiskKind::query_params())
            .await?;
        let mut rows = query_rows(DiskKind::QUERY_METHOD, result)?;

        let names: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("name").and_then(FieldValue::as_str))
            .map(str::to_owned)
            .collect();
        let temperatures = match invoker.invoke(TEMPERATURES_METHOD, vec![json!(names)]).await? {
            FieldValue::Map(map) => map,
            FieldValue::Null => FieldMap::new(),
            other => {
                return Err(ClientError::ProtocolViolation(format!(
                    "{TEMPERATURES_METHOD} returned {}, expected a map",
                    other.type_name()
                )));
            }
        };
        for row in &mut rows {
            let Some(name) = row.get("name").and_then(FieldValue::as_str).map(str::to_owned) else {
                continue;
            };
            let temperature = temperatures.get(&name).cloned().unwrap_or(FieldValue::Null);
            let _ = row.insert("temperature".to_string(), temperature);
        }
        self.reconcile_rows(&rows)
    }
}

impl CachedEntity<DiskKind> {
    /// Serial number.
    pub fn serial(&self) -> &str {
        self.key()
    }

    /// Device name.
    pub fn name(&self) -> String {
        self.read(|s| s.name.clone())
    }

    /// Model string.
    pub fn model(&self) -> String {
        self.read(|s| s.model.clone())
    }

    /// User description.
    pub fn description(&self) -> String {
        self.read(|s| s.description.clone())
    }

    /// Size in bytes.
    pub fn size(&self) -> i64 {
        self.read(|s| s.size)
    }

    /// Rotational or solid-state.
    pub fn disk_type(&self) -> DiskType {
        self.read(|s| s.disk_type)
    }

    /// Current temperature in °C.
    ///
    /// Only readable while the disk is reported by the server; `None` when
    /// the last refresh did not ask for temperatures or the disk reports none.
    pub fn temperature(&self) -> Result<Option<f64>> {
        self.read_live("temperature", |s| s.temperature)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
