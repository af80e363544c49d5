//! CPU readers: hypervisor domain info and cgroup `cpuacct.stat`.

use super::cgroup::{self, CgroupLayout};
use super::{Entity, StatCategory, StatReader, StatRecord};
use crate::error::Result;
use crate::hypervisor::HypervisorConnection;
use async_trait::async_trait;
use std::sync::Arc;

/// Reads the domain info block: CPU time, vCPU count and balloon size
pub struct DomainInfoReader {
    conn: Arc<dyn HypervisorConnection>,
}

impl DomainInfoReader {
    pub fn new(conn: Arc<dyn HypervisorConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StatReader for DomainInfoReader {
    fn category(&self) -> StatCategory {
        StatCategory::Cpu
    }

    async fn read(&self, entity: &Entity) -> Result<Vec<StatRecord>> {
        let info = self.conn.domain_info(entity).await?;

        let mut record = StatRecord::new(entity, StatCategory::Cpu);
        record.set("cpu_time", info.cpu_time);
        record.set("nr_virt_cpu", info.nr_virt_cpu);
        record.set("max_mem", info.max_mem);
        record.set("memory", info.memory);
        Ok(vec![record])
    }
}

/// Reads `cpuacct.stat` (user/system ticks) for a container
pub struct CpuAcctReader {
    layout: CgroupLayout,
}

impl CpuAcctReader {
    pub const FILE: &'static str = "cpuacct.stat";

    pub fn new(layout: CgroupLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl StatReader for CpuAcctReader {
    fn category(&self) -> StatCategory {
        StatCategory::Cpu
    }

    async fn read(&self, entity: &Entity) -> Result<Vec<StatRecord>> {
        let path = self.layout.path("cpuacct", &entity.name, Self::FILE);
        let content = cgroup::read_file(&path).await?;

        let mut record = StatRecord::new(entity, StatCategory::Cpu);
        for (key, value) in cgroup::parse_pairs(&content, Self::FILE)? {
            record.set(key, value);
        }
        Ok(vec![record])
    }
}
