//! Per-interface network counters for virtual machines.

use super::{Entity, StatCategory, StatReader, StatRecord};
use crate::error::{CollectError, Result};
use crate::hypervisor::{DomainStats, HypervisorConnection, StatsClass};
use async_trait::async_trait;
use std::sync::Arc;

/// Issues one interface-class stats query per domain and expands the result
/// set into one record per NIC
pub struct InterfaceReader {
    conn: Arc<dyn HypervisorConnection>,
}

impl InterfaceReader {
    pub fn new(conn: Arc<dyn HypervisorConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StatReader for InterfaceReader {
    fn category(&self) -> StatCategory {
        StatCategory::NetworkInterface
    }

    async fn read(&self, entity: &Entity) -> Result<Vec<StatRecord>> {
        let sets = self.conn.domain_stats(entity, StatsClass::Interface).await?;
        let set = single_result_set(entity, sets, "interface")?;

        Ok(set
            .net
            .into_iter()
            .map(|iface| {
                let mut record =
                    StatRecord::for_device(entity, StatCategory::NetworkInterface, iface.name);
                record.set("rx_bytes", iface.rx_bytes);
                record.set("rx_packets", iface.rx_pkts);
                record.set("rx_errs", iface.rx_errs);
                record.set("rx_drop", iface.rx_drop);
                record.set("tx_bytes", iface.tx_bytes);
                record.set("tx_packets", iface.tx_pkts);
                record.set("tx_errs", iface.tx_errs);
                record.set("tx_drop", iface.tx_drop);
                record
            })
            .collect())
    }
}

/// A stats query for one domain must return exactly one result set.
pub(crate) fn single_result_set(
    entity: &Entity,
    mut sets: Vec<DomainStats>,
    class: &str,
) -> Result<DomainStats> {
    match sets.len() {
        1 => Ok(sets.remove(0)),
        n => Err(CollectError::Read(format!(
            "{} stats query for {} returned {} result sets, expected 1",
            class, entity.id, n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{DomainInfo, InterfaceStats, MemoryStat};
    use crate::metrics::{EntityState, MetricValue};

    struct CannedStats(Vec<DomainStats>);

    #[async_trait]
    impl HypervisorConnection for CannedStats {
        async fn list_all_domains(&self) -> Result<Vec<Entity>> {
            Ok(Vec::new())
        }
        async fn domain_info(&self, _: &Entity) -> Result<DomainInfo> {
            Ok(DomainInfo::default())
        }
        async fn memory_stats(&self, _: &Entity) -> Result<Vec<MemoryStat>> {
            Ok(Vec::new())
        }
        async fn domain_stats(&self, _: &Entity, _: StatsClass) -> Result<Vec<DomainStats>> {
            Ok(self.0.clone())
        }
        async fn close(&self) {}
    }

    fn vm() -> Entity {
        Entity::new("uuid-a", "vm-a", EntityState::Running)
    }

    #[tokio::test]
    async fn one_record_per_interface() {
        let set = DomainStats {
            domain: "vm-a".into(),
            net: vec![
                InterfaceStats {
                    name: "vnet0".into(),
                    rx_bytes: 10,
                    tx_drop: 2,
                    ..Default::default()
                },
                InterfaceStats {
                    name: "vnet1".into(),
                    ..Default::default()
                },
            ],
            block: Vec::new(),
        };
        let reader = InterfaceReader::new(Arc::new(CannedStats(vec![set])));
        let records = reader.read(&vm()).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sub_resource.as_deref(), Some("vnet0"));
        assert_eq!(records[0].fields["rx_bytes"], MetricValue::Int(10));
        assert_eq!(records[0].fields["tx_drop"], MetricValue::Int(2));
        assert_eq!(records[0].fields.len(), 8);
        assert_eq!(records[1].sub_resource.as_deref(), Some("vnet1"));
    }

    #[tokio::test]
    async fn zero_or_many_result_sets_are_read_errors() {
        for sets in [Vec::new(), vec![DomainStats::default(), DomainStats::default()]] {
            let reader = InterfaceReader::new(Arc::new(CannedStats(sets)));
            assert!(matches!(reader.read(&vm()).await, Err(CollectError::Read(_))));
        }
    }
}
