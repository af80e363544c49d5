//! Read-only hypervisor query boundary for virtual machine mode.
//!
//! A [`Hypervisor`] opens one [`HypervisorConnection`] per collection cycle.
//! The connection is only used for listing and stat queries and must be
//! closed when the cycle ends.

pub mod virsh;

use crate::error::Result;
use crate::metrics::Entity;
use async_trait::async_trait;
use std::sync::Arc;

pub use virsh::Virsh;

/// Structured info block for one domain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainInfo {
    /// CPU time accumulated since start, in nanoseconds
    pub cpu_time: u64,
    pub nr_virt_cpu: u32,
    /// Balloon ceiling in KiB
    pub max_mem: u64,
    /// Current balloon size in KiB
    pub memory: u64,
}

/// Memory statistics tags, numbered as libvirt numbers them
pub mod memory_tag {
    pub const SWAP_IN: i32 = 0;
    pub const SWAP_OUT: i32 = 1;
    pub const MAJOR_FAULT: i32 = 2;
    pub const MINOR_FAULT: i32 = 3;
    pub const UNUSED: i32 = 4;
    pub const AVAILABLE: i32 = 5;
    pub const ACTUAL_BALLOON: i32 = 6;
    pub const RSS: i32 = 7;
    pub const USABLE: i32 = 8;
    pub const LAST_UPDATE: i32 = 9;
    pub const DISK_CACHES: i32 = 10;
    pub const HUGETLB_PGALLOC: i32 = 11;
    pub const HUGETLB_PGFAIL: i32 = 12;
}

/// One entry of the memory statistics vector, addressed by libvirt tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStat {
    pub tag: i32,
    pub val: u64,
}

/// Statistics class selector for combined stat queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsClass {
    Interface,
    Block,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceStats {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_pkts: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_pkts: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

/// Per-disk counters. Optional values are only present when reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockStats {
    pub name: String,
    pub rd_reqs: u64,
    pub rd_bytes: u64,
    pub wr_reqs: u64,
    pub wr_bytes: u64,
    pub errors: Option<u64>,
    pub rd_times: Option<u64>,
    pub wr_times: Option<u64>,
    pub fl_reqs: Option<u64>,
    pub fl_times: Option<u64>,
    pub allocation: Option<u64>,
    pub capacity: Option<u64>,
    pub physical: Option<u64>,
}

/// Result set of a combined stat query for one domain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainStats {
    pub domain: String,
    pub net: Vec<InterfaceStats>,
    pub block: Vec<BlockStats>,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Open a read-only connection to `uri`.
    async fn connect_read_only(&self, uri: &str) -> Result<Arc<dyn HypervisorConnection>>;
}

#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    /// Every defined domain, active or not, with its state. Running domains
    /// are identified by UUID.
    async fn list_all_domains(&self) -> Result<Vec<Entity>>;

    async fn domain_info(&self, domain: &Entity) -> Result<DomainInfo>;

    /// The memory statistics vector. May be empty.
    async fn memory_stats(&self, domain: &Entity) -> Result<Vec<MemoryStat>>;

    /// Combined stats query restricted to `class`, one result set per
    /// matching domain.
    async fn domain_stats(&self, domain: &Entity, class: StatsClass) -> Result<Vec<DomainStats>>;

    async fn close(&self);
}
