//! Turns per-category stat records into tagged metric records.

use crate::error::Result;
use crate::filter::FilterSpec;
use crate::metrics::{Entity, Fields, MetricRecord, StatCategory, StatRecord, Tags};
use std::collections::BTreeMap;

/// Record naming and tagging rules for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Record name handed to the sink
    pub record_name: String,
    /// Tag key carrying the entity identifier
    pub entity_tag: String,
    /// Tag key carrying the category label, if categories are tagged
    pub category_tag: Option<String>,
    /// Merge every entity-scoped category into one record
    pub merge_entity_scoped: bool,
}

impl Schema {
    /// Virtual machines: cpu and memory merged, tagged by domain UUID.
    pub fn libvirt() -> Self {
        Self {
            record_name: "libvirt".to_string(),
            entity_tag: "uuid".to_string(),
            category_tag: None,
            merge_entity_scoped: true,
        }
    }

    /// Containers: one record per category, tagged by name and category.
    pub fn lxc() -> Self {
        Self {
            record_name: "lxc".to_string(),
            entity_tag: "name".to_string(),
            category_tag: Some("category".to_string()),
            merge_entity_scoped: false,
        }
    }

    fn tags(&self, entity: &Entity, category: Option<StatCategory>) -> Tags {
        let mut tags = Tags::new();
        tags.insert(self.entity_tag.clone(), entity.id.clone());
        if let (Some(key), Some(category)) = (&self.category_tag, category) {
            tags.insert(key.clone(), category.label().to_string());
        }
        tags
    }
}

/// Combine one entity's stat records into metric records.
///
/// Entity-scoped records are merged into one record or kept one per category
/// depending on `schema`; per-device records always become their own record
/// tagged with the device name. Field names are filtered by `metric_filter`;
/// records left without fields are still returned. Output order is stable
/// for a given input.
pub fn assemble(
    schema: &Schema,
    entity: &Entity,
    per_category: &BTreeMap<StatCategory, Vec<StatRecord>>,
    metric_filter: &FilterSpec,
) -> Result<Vec<MetricRecord>> {
    let mut records = Vec::new();
    let mut merged: Option<Fields> = None;

    for (category, stats) in per_category {
        for stat in stats {
            match &stat.sub_resource {
                Some(device) => {
                    let mut tags = schema.tags(entity, Some(*category));
                    if let Some(key) = category.sub_resource_tag() {
                        tags.insert(key.to_string(), device.clone());
                    }
                    records.push(MetricRecord {
                        name: schema.record_name.clone(),
                        tags,
                        fields: stat.fields.clone(),
                    });
                }
                None if schema.merge_entity_scoped => {
                    merged
                        .get_or_insert_with(Fields::new)
                        .extend(stat.fields.clone());
                }
                None => records.push(MetricRecord {
                    name: schema.record_name.clone(),
                    tags: schema.tags(entity, Some(*category)),
                    fields: stat.fields.clone(),
                }),
            }
        }
    }

    if let Some(fields) = merged {
        records.insert(
            0,
            MetricRecord {
                name: schema.record_name.clone(),
                tags: schema.tags(entity, None),
                fields,
            },
        );
    }

    for record in &mut records {
        metric_filter.retain_fields(&mut record.fields)?;
    }
    Ok(records)
}
