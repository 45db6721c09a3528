//! ZFS datasets and volumes, keyed by dataset id (`tank/media`).
//!
//! Most dataset attributes arrive as property documents of the form
//! `{"parsed": .., "rawvalue": "..", "value": "..", "source": "LOCAL"}`.

use std::collections::BTreeMap;
use std::fmt;

use truenas_core::value::FieldMapExt;
use truenas_core::{ClientError, FieldMap, FieldValue, Result};

use crate::cache::{CachedEntity, EntityKind};

const ENTITY: &str = "dataset";

/// Property documents decoded from a query row.
const PROPERTIES: &[&str] = &["available", "comments", "compressratio", "used"];

/// Filesystem or block volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatasetType {
    /// Filesystem dataset.
    Filesystem,
    /// Block volume (zvol).
    Volume,
}

impl DatasetType {
    /// Parse the wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "FILESYSTEM" => Some(Self::Filesystem),
            "VOLUME" => Some(Self::Volume),
            _ => None,
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Filesystem => "FILESYSTEM",
            Self::Volume => "VOLUME",
        })
    }
}

/// Where a property value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertySource {
    /// Built-in default.
    Default,
    /// Inherited from a parent dataset.
    Inherited,
    /// Set on this dataset.
    Local,
    /// Not applicable (read-only statistics).
    None,
}

impl PropertySource {
    /// Parse the wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DEFAULT" => Some(Self::Default),
            "INHERITED" => Some(Self::Inherited),
            "LOCAL" => Some(Self::Local),
            "NONE" => Some(Self::None),
            _ => None,
        }
    }
}

/// One dataset property document.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetProperty {
    /// Value parsed by the server (number, string or `Null`).
    pub parsed: FieldValue,
    /// Raw ZFS value.
    pub raw_value: String,
    /// Human-readable value.
    pub value: Option<String>,
    /// Where the value comes from.
    pub source: PropertySource,
}

impl DatasetProperty {
    fn decode(name: &str, doc: &FieldMap) -> Result<Self> {
        let source = match doc.get("source") {
            None | Some(FieldValue::Null) => PropertySource::None,
            Some(FieldValue::String(raw)) => PropertySource::parse(raw).ok_or_else(|| {
                ClientError::decode(ENTITY, format!("{name}.source"), format!("unexpected value {raw:?}"))
            })?,
            Some(other) => {
                return Err(ClientError::decode(
                    ENTITY,
                    format!("{name}.source"),
                    format!("expected string, got {}", other.type_name()),
                ));
            }
        };
        Ok(Self {
            parsed: doc.get("parsed").cloned().unwrap_or(FieldValue::Null),
            raw_value: doc
                .get("rawvalue")
                .and_then(FieldValue::as_str)
                .unwrap_or_default()
                .to_string(),
            value: doc.get("value").and_then(FieldValue::as_str).map(str::to_owned),
            source,
        })
    }

    fn parsed_i64(&self, name: &str) -> Result<i64> {
        match &self.parsed {
            FieldValue::Integer(n) => Ok(*n),
            FieldValue::String(s) => s
                .trim()
                .parse()
                .map_err(|_| ClientError::decode(ENTITY, name, format!("not an integer: {s:?}"))),
            other => Err(ClientError::decode(
                ENTITY,
                name,
                format!("expected integer, got {}", other.type_name()),
            )),
        }
    }

    fn parsed_f64(&self, name: &str) -> Result<f64> {
        if let Some(n) = self.parsed.as_f64() {
            return Ok(n);
        }
        match &self.parsed {
            FieldValue::String(s) => s
                .trim()
                .parse()
                .map_err(|_| ClientError::decode(ENTITY, name, format!("not a number: {s:?}"))),
            other => Err(ClientError::decode(
                ENTITY,
                name,
                format!("expected number, got {}", other.type_name()),
            )),
        }
    }
}

/// Decoded state of one dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetState {
    /// Dataset id (`pool/path`).
    pub id: String,
    /// Owning pool name.
    pub pool: String,
    /// Filesystem or volume.
    pub dataset_type: DatasetType,
    /// Bytes available.
    pub available_bytes: i64,
    /// Bytes used.
    pub used_bytes: i64,
    /// Compression ratio (`1.0` = uncompressed).
    pub compression_ratio: f64,
    /// User comments.
    pub comments: Option<String>,
    /// Every property document that was reported, by name.
    pub properties: BTreeMap<String, DatasetProperty>,
}

/// Dataset entity kind.
#[derive(Debug)]
pub struct DatasetKind;

impl EntityKind for DatasetKind {
    type Key = String;
    type State = DatasetState;

    const NAME: &'static str = ENTITY;
    const QUERY_METHOD: &'static str = "pool.dataset.query";
    const SELECT: &'static [&'static str] = &[
        "available",
        "comments",
        "compressratio",
        "id",
        "pool",
        "type",
        "used",
    ];

    fn decode(row: &FieldMap) -> Result<(String, DatasetState)> {
        let id = row.require_str(ENTITY, "id")?.to_string();
        let raw_type = row.require_str(ENTITY, "type")?;
        let dataset_type = DatasetType::parse(raw_type).ok_or_else(|| {
            ClientError::decode(ENTITY, "type", format!("unexpected value {raw_type:?}"))
        })?;

        let mut properties = BTreeMap::new();
        for name in PROPERTIES {
            match row.get(*name) {
                None | Some(FieldValue::Null) => {}
                Some(_) => {
                    let doc = row.require_map(ENTITY, name)?;
                    let _ = properties.insert((*name).to_string(), DatasetProperty::decode(name, doc)?);
                }
            }
        }
        let state = DatasetState {
            id: id.clone(),
            pool: row.require_str(ENTITY, "pool")?.to_string(),
            dataset_type,
            available_bytes: required(&properties, "available")?.parsed_i64("available")?,
            used_bytes: required(&properties, "used")?.parsed_i64("used")?,
            compression_ratio: required(&properties, "compressratio")?.parsed_f64("compressratio")?,
            comments: properties
                .get("comments")
                .and_then(|p| p.parsed.as_str())
                .map(str::to_owned),
            properties,
        };
        Ok((id, state))
    }
}

fn required<'a>(
    properties: &'a BTreeMap<String, DatasetProperty>,
    name: &str,
) -> Result<&'a DatasetProperty> {
    properties
        .get(name)
        .ok_or_else(|| ClientError::decode(ENTITY, name, "missing"))
}

/// A cached dataset.
pub type Dataset = CachedEntity<DatasetKind>;

impl CachedEntity<DatasetKind> {
    /// Dataset id.
    pub fn id(&self) -> &str {
        self.key()
    }

    /// Owning pool name.
    pub fn pool_name(&self) -> String {
        self.read(|s| s.pool.clone())
    }

    /// Filesystem or volume.
    pub fn dataset_type(&self) -> DatasetType {
        self.read(|s| s.dataset_type)
    }

    /// Bytes available.
    pub fn available_bytes(&self) -> i64 {
        self.read(|s| s.available_bytes)
    }

    /// Bytes used.
    pub fn used_bytes(&self) -> i64 {
        self.read(|s| s.used_bytes)
    }

    /// Available plus used bytes, from the same state.
    pub fn total_bytes(&self) -> i64 {
        self.read(|s| s.available_bytes.saturating_add(s.used_bytes))
    }

    /// Compression ratio.
    pub fn compression_ratio(&self) -> f64 {
        self.read(|s| s.compression_ratio)
    }

    /// User comments.
    pub fn comments(&self) -> Option<String> {
        self.read(|s| s.comments.clone())
    }

    /// A property document by name.
    pub fn property(&self, name: &str) -> Option<DatasetProperty> {
        self.read(|s| s.properties.get(name).cloned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
