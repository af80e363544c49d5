//! Include/exclude selection shared by entity and metric-name filtering.

use crate::error::{CollectError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// An include/exclude pair over entity identifiers or metric names.
///
/// At most one side may be non-empty. Build it once at startup with
/// [`FilterSpec::new`] and pass it by reference into every call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub include: BTreeSet<String>,
    #[serde(default)]
    pub exclude: BTreeSet<String>,
}

impl FilterSpec {
    /// Build a validated spec. `target` names what is being filtered and
    /// only appears in the error message.
    pub fn new<I, E>(target: &str, include: I, exclude: E) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        let spec = Self {
            include: include.into_iter().collect(),
            exclude: exclude.into_iter().collect(),
        };
        spec.validate(target)?;
        Ok(spec)
    }

    pub fn include<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self {
            include: names.into_iter().map(Into::into).collect(),
            exclude: BTreeSet::new(),
        }
    }

    pub fn exclude<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self {
            include: BTreeSet::new(),
            exclude: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn validate(&self, target: &str) -> Result<()> {
        if !self.include.is_empty() && !self.exclude.is_empty() {
            return Err(CollectError::Config(format!(
                "{target} include and exclude are mutually exclusive"
            )));
        }
        Ok(())
    }

    /// Drop every field whose name does not survive the filter.
    pub fn retain_fields<V>(&self, fields: &mut BTreeMap<String, V>) -> Result<()> {
        let candidates: HashSet<String> = fields.keys().cloned().collect();
        let kept = select(candidates, self)?;
        fields.retain(|name, _| kept.contains(name));
        Ok(())
    }
}

/// Apply `spec` to `candidates`.
///
/// Fails with [`CollectError::Config`] when both sides of the spec are set,
/// regardless of the candidates. The result is a set; callers must not rely
/// on any iteration order.
pub fn select(candidates: HashSet<String>, spec: &FilterSpec) -> Result<HashSet<String>> {
    spec.validate("filter")?;
    if !spec.include.is_empty() {
        Ok(candidates
            .into_iter()
            .filter(|c| spec.include.contains(c))
            .collect())
    } else if !spec.exclude.is_empty() {
        Ok(candidates
            .into_iter()
            .filter(|c| !spec.exclude.contains(c))
            .collect())
    } else {
        Ok(candidates)
    }
}
