//! Stat source readers and the data model they produce.
//!
//! Readers turn one entity into zero or more [`StatRecord`]s for a single
//! [`StatCategory`]. Everything here is cycle-scoped: nothing is cached
//! between collection cycles.

pub mod cgroup;
pub mod cpu;
pub mod disk;
pub mod memory;
pub mod network;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use cpu::{CpuAcctReader, DomainInfoReader};
pub use disk::{BlkioReader, DiskReader};
pub use memory::{MemoryStatReader, MemoryStatsReader};
pub use network::InterfaceReader;

/// Running state reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityState {
    Running,
    NotRunning,
}

/// A virtual machine or container discovered in the current cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier (domain UUID or container name)
    pub id: String,
    /// Display name
    pub name: String,
    pub state: EntityState,
}

impl Entity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: EntityState) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == EntityState::Running
    }
}

/// Kind of measurement source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StatCategory {
    Cpu,
    Memory,
    NetworkInterface,
    BlockDevice,
}

impl StatCategory {
    /// Short label used as the `category` tag value
    pub fn label(&self) -> &'static str {
        match self {
            StatCategory::Cpu => "cpu",
            StatCategory::Memory => "mem",
            StatCategory::NetworkInterface => "net",
            StatCategory::BlockDevice => "io",
        }
    }

    /// Tag key carrying the sub-resource name for per-device records
    pub fn sub_resource_tag(&self) -> Option<&'static str> {
        match self {
            StatCategory::NetworkInterface => Some("interface"),
            StatCategory::BlockDevice => Some("disk"),
            StatCategory::Cpu | StatCategory::Memory => None,
        }
    }
}

impl fmt::Display for StatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatCategory::Cpu => write!(f, "cpu"),
            StatCategory::Memory => write!(f, "memory"),
            StatCategory::NetworkInterface => write!(f, "network-interface"),
            StatCategory::BlockDevice => write!(f, "block-device"),
        }
    }
}

/// A numeric field value. Fields are never strings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

/// Counters above `i64::MAX` saturate to `i64::MAX`. Kernel and hypervisor
/// counters do not reach 2^63 in practice, and both output formats carry
/// signed integers only.
impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Int(i64::from(v))
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
        }
    }
}

pub type Fields = BTreeMap<String, MetricValue>;
pub type Tags = BTreeMap<String, String>;

/// Raw output of one reader for one entity (and sub-resource, if any)
#[derive(Debug, Clone, PartialEq)]
pub struct StatRecord {
    pub entity: String,
    pub category: StatCategory,
    /// Interface or disk name for per-device categories
    pub sub_resource: Option<String>,
    pub fields: Fields,
}

impl StatRecord {
    pub fn new(entity: &Entity, category: StatCategory) -> Self {
        Self {
            entity: entity.id.clone(),
            category,
            sub_resource: None,
            fields: Fields::new(),
        }
    }

    pub fn for_device(entity: &Entity, category: StatCategory, device: impl Into<String>) -> Self {
        Self {
            sub_resource: Some(device.into()),
            ..Self::new(entity, category)
        }
    }

    /// Set a field. Unsigned values past `i64::MAX` are stored as `i64::MAX`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<MetricValue>) {
        self.fields.insert(name.into(), value.into());
    }
}

/// The unit handed to the emission boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub name: String,
    pub tags: Tags,
    pub fields: Fields,
}

/// A source of one stat category.
#[async_trait]
pub trait StatReader: Send + Sync {
    fn category(&self) -> StatCategory;

    /// Read every record this category yields for `entity`.
    ///
    /// [`CollectError::NotFound`](crate::error::CollectError::NotFound) means
    /// the source has nothing for this entity and is not a failure.
    async fn read(&self, entity: &Entity) -> Result<Vec<StatRecord>>;
}
