//! LXC containers: enumeration through the `lxc` client and cgroup
//! accounting files.

use crate::assemble::Schema;
use crate::backend::{Backend, Session};
use crate::error::{CollectError, Result};
use crate::metrics::cgroup::CgroupLayout;
use crate::metrics::{
    BlkioReader, CpuAcctReader, Entity, EntityState, MemoryStatReader, StatReader,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// Parse `lxc list -c ns --format csv` output (`name,STATUS` per line).
pub fn parse_container_list(output: &str) -> Result<Vec<Entity>> {
    let mut containers = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut columns = line.split(',');
        let (Some(name), Some(status)) = (columns.next(), columns.next()) else {
            return Err(CollectError::Connection(format!(
                "malformed container row: {:?}",
                line
            )));
        };
        if name.is_empty() {
            return Err(CollectError::Connection(format!(
                "container row without name: {:?}",
                line
            )));
        }
        let state = if status.trim() == "RUNNING" {
            EntityState::Running
        } else {
            EntityState::NotRunning
        };
        containers.push(Entity::new(name, name, state));
    }
    Ok(containers)
}

pub struct LxcBackend {
    binary: PathBuf,
    layout: CgroupLayout,
    schema: Schema,
}

impl LxcBackend {
    pub fn new(binary: impl Into<PathBuf>, layout: CgroupLayout) -> Self {
        Self {
            binary: binary.into(),
            layout,
            schema: Schema::lxc(),
        }
    }
}

#[async_trait]
impl Backend for LxcBackend {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&self) -> Result<Box<dyn Session>> {
        let readers: Vec<Arc<dyn StatReader>> = vec![
            Arc::new(MemoryStatReader::new(self.layout.clone())),
            Arc::new(CpuAcctReader::new(self.layout.clone())),
            Arc::new(BlkioReader::new(self.layout.clone())),
        ];
        Ok(Box::new(LxcSession {
            binary: self.binary.clone(),
            readers,
        }))
    }
}

struct LxcSession {
    binary: PathBuf,
    readers: Vec<Arc<dyn StatReader>>,
}

#[async_trait]
impl Session for LxcSession {
    async fn list_entities(&self) -> Result<Vec<Entity>> {
        let args = ["list", "-c", "ns", "--format", "csv"];
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CollectError::Connection(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            return Err(CollectError::Connection(format!(
                "calling \"{} {}\" exited with {}: {}",
                self.binary.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| CollectError::Connection("lxc printed non-UTF-8 output".to_string()))?;
        parse_container_list(&stdout)
    }

    fn readers(&self) -> &[Arc<dyn StatReader>] {
        &self.readers
    }

    async fn close(&self) {}
}
