//! Memory readers: the hypervisor memory statistics vector and cgroup
//! `memory.stat`.

use super::cgroup::{self, CgroupLayout};
use super::{Entity, StatCategory, StatReader, StatRecord};
use crate::error::Result;
use crate::hypervisor::{memory_tag, HypervisorConnection, MemoryStat};
use async_trait::async_trait;
use std::sync::Arc;

/// Field name for a memory statistics tag, or `None` for tags that are not
/// translated (last update timestamp, disk caches, hugetlb counters, ...)
pub fn memory_stat_field(tag: i32) -> Option<&'static str> {
    let name = match tag {
        memory_tag::SWAP_IN => "mem_swap_in",
        memory_tag::SWAP_OUT => "mem_swap_out",
        memory_tag::MAJOR_FAULT => "mem_major_fault",
        memory_tag::MINOR_FAULT => "mem_minor_fault",
        memory_tag::UNUSED => "mem_unused",
        memory_tag::AVAILABLE => "mem_available",
        memory_tag::ACTUAL_BALLOON => "mem_actual_balloon",
        memory_tag::RSS => "mem_rss",
        memory_tag::USABLE => "mem_usable",
        _ => return None,
    };
    Some(name)
}

/// Translate a memory statistics vector into a record. Unknown tags are
/// dropped; an empty vector yields an empty record.
pub fn translate_memory_stats(entity: &Entity, stats: &[MemoryStat]) -> StatRecord {
    let mut record = StatRecord::new(entity, StatCategory::Memory);
    for stat in stats {
        if let Some(field) = memory_stat_field(stat.tag) {
            record.set(field, stat.val);
        }
    }
    record
}

/// Reads the balloon driver's memory statistics for a domain
pub struct MemoryStatsReader {
    conn: Arc<dyn HypervisorConnection>,
}

impl MemoryStatsReader {
    pub fn new(conn: Arc<dyn HypervisorConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StatReader for MemoryStatsReader {
    fn category(&self) -> StatCategory {
        StatCategory::Memory
    }

    async fn read(&self, entity: &Entity) -> Result<Vec<StatRecord>> {
        let stats = self.conn.memory_stats(entity).await?;
        if stats.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![translate_memory_stats(entity, &stats)])
    }
}

/// Reads `memory.stat` for a container
pub struct MemoryStatReader {
    layout: CgroupLayout,
}

impl MemoryStatReader {
    pub const FILE: &'static str = "memory.stat";

    pub fn new(layout: CgroupLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl StatReader for MemoryStatReader {
    fn category(&self) -> StatCategory {
        StatCategory::Memory
    }

    async fn read(&self, entity: &Entity) -> Result<Vec<StatRecord>> {
        let path = self.layout.path("memory", &entity.name, Self::FILE);
        let content = cgroup::read_file(&path).await?;

        let mut record = StatRecord::new(entity, StatCategory::Memory);
        for (key, value) in cgroup::parse_pairs(&content, Self::FILE)? {
            record.set(key, value);
        }
        Ok(vec![record])
    }
}
