//! Backends bind a control plane to its stat readers and record schema.
//!
//! A [`Session`] is opened at the start of every cycle and closed at its
//! end; nothing in it outlives the cycle.

use crate::assemble::Schema;
use crate::error::Result;
use crate::hypervisor::{Hypervisor, HypervisorConnection};
use crate::metrics::{
    DiskReader, DomainInfoReader, Entity, InterfaceReader, MemoryStatsReader, StatReader,
};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Backend: Send + Sync {
    fn schema(&self) -> &Schema;

    /// Acquire the control-plane handle for one cycle.
    async fn open(&self) -> Result<Box<dyn Session>>;
}

#[async_trait]
pub trait Session: Send + Sync {
    /// Raw listing, including entities that are not running.
    async fn list_entities(&self) -> Result<Vec<Entity>>;

    fn readers(&self) -> &[Arc<dyn StatReader>];

    /// Release the control-plane handle.
    async fn close(&self);
}

/// Virtual machines managed through a read-only hypervisor connection
pub struct LibvirtBackend {
    uri: String,
    hypervisor: Arc<dyn Hypervisor>,
    schema: Schema,
}

impl LibvirtBackend {
    pub fn new(uri: impl Into<String>, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            uri: uri.into(),
            hypervisor,
            schema: Schema::libvirt(),
        }
    }
}

#[async_trait]
impl Backend for LibvirtBackend {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&self) -> Result<Box<dyn Session>> {
        let conn = self.hypervisor.connect_read_only(&self.uri).await?;
        let readers: Vec<Arc<dyn StatReader>> = vec![
            Arc::new(DomainInfoReader::new(conn.clone())),
            Arc::new(MemoryStatsReader::new(conn.clone())),
            Arc::new(InterfaceReader::new(conn.clone())),
            Arc::new(DiskReader::new(conn.clone())),
        ];
        Ok(Box::new(LibvirtSession { conn, readers }))
    }
}

struct LibvirtSession {
    conn: Arc<dyn HypervisorConnection>,
    readers: Vec<Arc<dyn StatReader>>,
}

#[async_trait]
impl Session for LibvirtSession {
    async fn list_entities(&self) -> Result<Vec<Entity>> {
        self.conn.list_all_domains().await
    }

    fn readers(&self) -> &[Arc<dyn StatReader>] {
        &self.readers
    }

    async fn close(&self) {
        self.conn.close().await;
    }
}
