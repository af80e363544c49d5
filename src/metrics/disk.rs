//! Block device readers: per-disk hypervisor counters and cgroup blkio
//! accounting files.

use super::cgroup::{self, CgroupLayout};
use super::network::single_result_set;
use super::{Entity, StatCategory, StatReader, StatRecord};
use crate::error::Result;
use crate::hypervisor::{HypervisorConnection, StatsClass};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Issues one block-class stats query per domain and expands the result set
/// into one record per disk
pub struct DiskReader {
    conn: Arc<dyn HypervisorConnection>,
}

impl DiskReader {
    pub fn new(conn: Arc<dyn HypervisorConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StatReader for DiskReader {
    fn category(&self) -> StatCategory {
        StatCategory::BlockDevice
    }

    async fn read(&self, entity: &Entity) -> Result<Vec<StatRecord>> {
        let sets = self.conn.domain_stats(entity, StatsClass::Block).await?;
        let set = single_result_set(entity, sets, "block")?;

        Ok(set
            .block
            .into_iter()
            .map(|disk| {
                let mut record =
                    StatRecord::for_device(entity, StatCategory::BlockDevice, disk.name);
                record.set("rd_req", disk.rd_reqs);
                record.set("rd_bytes", disk.rd_bytes);
                record.set("wr_req", disk.wr_reqs);
                record.set("wr_bytes", disk.wr_bytes);

                let optional = [
                    ("errs", disk.errors),
                    ("rd_times", disk.rd_times),
                    ("wr_times", disk.wr_times),
                    ("fl_req", disk.fl_reqs),
                    ("fl_times", disk.fl_times),
                    ("allocation", disk.allocation),
                    ("capacity", disk.capacity),
                    ("physical", disk.physical),
                ];
                for (name, value) in optional {
                    if let Some(value) = value {
                        record.set(name, value);
                    }
                }
                record
            })
            .collect())
    }
}

/// The eight blkio accounting files, flat and recursive
pub fn blkio_files() -> Vec<String> {
    ["blkio.sectors", "blkio.io_service_bytes", "blkio.io_serviced", "blkio.io_queued"]
        .iter()
        .flat_map(|base| [base.to_string(), format!("{}_recursive", base)])
        .collect()
}

/// Reads the blkio accounting files for a container into a single record.
///
/// Field names are the file name followed by the line key
/// (`blkio.sectors253:0`). An empty file is valid and contributes a single
/// zero field named after the file. Absent files are skipped.
pub struct BlkioReader {
    layout: CgroupLayout,
}

impl BlkioReader {
    pub fn new(layout: CgroupLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl StatReader for BlkioReader {
    fn category(&self) -> StatCategory {
        StatCategory::BlockDevice
    }

    async fn read(&self, entity: &Entity) -> Result<Vec<StatRecord>> {
        let mut record = StatRecord::new(entity, StatCategory::BlockDevice);
        let mut found = 0;

        for file in blkio_files() {
            let path = self.layout.path("blkio", &entity.name, &file);
            let content = match cgroup::read_file(&path).await {
                Ok(content) => content,
                Err(e) if e.is_not_found() => {
                    debug!(entity = %entity.id, file = %file, "blkio file absent");
                    continue;
                }
                Err(e) => return Err(e),
            };
            found += 1;

            if content.trim().is_empty() {
                record.set(file, 0i64);
                continue;
            }
            for (key, value) in cgroup::parse_pairs(&content, &file)? {
                record.set(format!("{}{}", file, key), value);
            }
        }

        if found == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectError;
    use crate::metrics::{EntityState, MetricValue};
    use std::path::Path;

    fn write_all(layout: &CgroupLayout, files: &[(&str, &str)]) {
        for (file, content) in files {
            let path = layout.path("blkio", "web", file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
    }

    fn layout(dir: &Path) -> CgroupLayout {
        CgroupLayout::new(dir, "lxc")
    }

    fn web() -> Entity {
        Entity::new("web", "web", EntityState::Running)
    }

    #[test]
    fn eight_files_flat_and_recursive() {
        let files = blkio_files();
        assert_eq!(files.len(), 8);
        assert!(files.contains(&"blkio.io_queued_recursive".to_string()));
        assert!(files.contains(&"blkio.sectors".to_string()));
    }

    #[tokio::test]
    async fn empty_file_is_zero_and_keys_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        write_all(
            &layout,
            &[("blkio.io_serviced", ""), ("blkio.sectors", "253:0 120\n")],
        );

        let records = BlkioReader::new(layout).read(&web()).await.unwrap();
        assert_eq!(records.len(), 1);
        let fields = &records[0].fields;
        assert_eq!(fields["blkio.io_serviced"], MetricValue::Int(0));
        assert_eq!(fields["blkio.sectors253:0"], MetricValue::Int(120));
        assert_eq!(fields.len(), 2);
    }

    #[tokio::test]
    async fn malformed_value_fails_the_reader() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        write_all(&layout, &[("blkio.sectors", "253:0 many\n")]);

        let err = BlkioReader::new(layout).read(&web()).await.unwrap_err();
        assert!(matches!(err, CollectError::Read(_)));
    }

    #[tokio::test]
    async fn no_blkio_files_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let records = BlkioReader::new(layout(dir.path()))
            .read(&web())
            .await
            .unwrap();
        assert!(records.is_empty());
    }
}
