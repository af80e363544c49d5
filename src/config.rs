//! Configuration: optional JSON file overlaid by command line values,
//! validated once at startup.

use crate::cycle::CycleOptions;
use crate::error::{CollectError, Result};
use crate::filter::FilterSpec;
use crate::metrics::cgroup::CgroupLayout;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Virtual machines through virsh
    Libvirt,
    /// LXC containers through lxc and cgroup files
    Lxc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON Lines
    Json,
    /// InfluxDB line protocol
    Line,
}

/// Unvalidated settings. Every key is optional so file and command line
/// values can be layered.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub backend: Option<BackendKind>,
    pub uri: Option<String>,
    /// Sampling interval in seconds
    pub interval: Option<f64>,
    pub concurrency: Option<usize>,
    pub cgroup_root: Option<PathBuf>,
    pub cgroup_parent: Option<String>,
    pub format: Option<OutputFormat>,
    pub output: Option<PathBuf>,
    pub virsh: Option<PathBuf>,
    pub lxc: Option<PathBuf>,
    pub entity_include: Option<Vec<String>>,
    pub entity_exclude: Option<Vec<String>>,
    pub metric_include: Option<Vec<String>>,
    pub metric_exclude: Option<Vec<String>>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CollectError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CollectError::Config(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Layer `over` on top of `self`; values set in `over` win.
    pub fn merge(self, over: Settings) -> Settings {
        Settings {
            backend: over.backend.or(self.backend),
            uri: over.uri.or(self.uri),
            interval: over.interval.or(self.interval),
            concurrency: over.concurrency.or(self.concurrency),
            cgroup_root: over.cgroup_root.or(self.cgroup_root),
            cgroup_parent: over.cgroup_parent.or(self.cgroup_parent),
            format: over.format.or(self.format),
            output: over.output.or(self.output),
            virsh: over.virsh.or(self.virsh),
            lxc: over.lxc.or(self.lxc),
            entity_include: over.entity_include.or(self.entity_include),
            entity_exclude: over.entity_exclude.or(self.entity_exclude),
            metric_include: over.metric_include.or(self.metric_include),
            metric_exclude: over.metric_exclude.or(self.metric_exclude),
        }
    }
}

/// Validated, immutable configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend: BackendKind,
    pub uri: String,
    pub interval: Duration,
    pub concurrency: usize,
    pub cgroup: CgroupLayout,
    pub format: OutputFormat,
    /// `None` writes to stdout
    pub output: Option<PathBuf>,
    pub virsh: PathBuf,
    pub lxc: PathBuf,
    pub entity_filter: FilterSpec,
    pub metric_filter: FilterSpec,
}

impl Config {
    pub const DEFAULT_URI: &'static str = "qemu:///system";
    pub const DEFAULT_INTERVAL_SECS: f64 = 10.0;
    pub const DEFAULT_CONCURRENCY: usize = 4;

    pub fn cycle_options(&self) -> CycleOptions {
        CycleOptions {
            deadline: self.interval,
            concurrency: self.concurrency,
        }
    }
}

impl TryFrom<Settings> for Config {
    type Error = CollectError;

    fn try_from(s: Settings) -> Result<Self> {
        let interval = s.interval.unwrap_or(Self::DEFAULT_INTERVAL_SECS);
        if !interval.is_finite() || interval <= 0.0 {
            return Err(CollectError::Config(format!(
                "interval must be positive, got {}",
                interval
            )));
        }
        let interval = Duration::try_from_secs_f64(interval).map_err(|e| {
            CollectError::Config(format!("interval {} is out of range: {}", interval, e))
        })?;
        let concurrency = s.concurrency.unwrap_or(Self::DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(CollectError::Config("concurrency must be at least 1".to_string()));
        }

        let entity_filter = FilterSpec::new(
            "entity",
            clean(s.entity_include),
            clean(s.entity_exclude),
        )?;
        let metric_filter = FilterSpec::new(
            "metric",
            clean(s.metric_include),
            clean(s.metric_exclude),
        )?;

        let defaults = CgroupLayout::default();
        Ok(Config {
            backend: s.backend.unwrap_or(BackendKind::Libvirt),
            uri: s.uri.unwrap_or_else(|| Self::DEFAULT_URI.to_string()),
            interval,
            concurrency,
            cgroup: CgroupLayout::new(
                s.cgroup_root.unwrap_or(defaults.root),
                s.cgroup_parent.unwrap_or(defaults.parent),
            ),
            format: s.format.unwrap_or(OutputFormat::Json),
            output: s.output,
            virsh: s.virsh.unwrap_or_else(|| PathBuf::from("virsh")),
            lxc: s.lxc.unwrap_or_else(|| PathBuf::from("lxc")),
            entity_filter,
            metric_filter,
        })
    }
}

fn clean(names: Option<Vec<String>>) -> Vec<String> {
    names
        .unwrap_or_default()
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::try_from(Settings::default()).unwrap();
        assert_eq!(config.backend, BackendKind::Libvirt);
        assert_eq!(config.uri, "qemu:///system");
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.cgroup, CgroupLayout::default());
        assert!(config.entity_filter.is_empty());
        assert!(config.metric_filter.is_empty());
    }

    #[test]
    fn both_entity_lists_reject_startup() {
        let settings = Settings {
            entity_include: Some(vec!["web".into()]),
            entity_exclude: Some(vec!["db".into()]),
            ..Default::default()
        };
        assert!(matches!(
            Config::try_from(settings),
            Err(CollectError::Config(_))
        ));
    }

    #[test]
    fn both_metric_lists_reject_startup() {
        let settings = Settings {
            metric_include: Some(vec!["rss".into()]),
            metric_exclude: Some(vec!["cache".into()]),
            ..Default::default()
        };
        let err = Config::try_from(settings).unwrap_err();
        assert!(err
            .to_string()
            .contains("metric include and exclude are mutually exclusive"));
    }

    #[test]
    fn entity_and_metric_pairs_are_independent() {
        let settings = Settings {
            entity_include: Some(vec!["web".into()]),
            metric_exclude: Some(vec!["rx_drop".into(), " ".into()]),
            ..Default::default()
        };
        let config = Config::try_from(settings).unwrap();
        assert_eq!(config.metric_filter, FilterSpec::exclude(["rx_drop"]));
        assert_eq!(config.entity_filter, FilterSpec::include(["web"]));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let settings = Settings {
            interval: Some(0.0),
            ..Default::default()
        };
        assert!(Config::try_from(settings).is_err());
    }

    #[test]
    fn huge_interval_is_config_error() {
        let settings = Settings {
            interval: Some(1e20),
            ..Default::default()
        };
        assert!(matches!(
            Config::try_from(settings),
            Err(CollectError::Config(_))
        ));
    }

    #[test]
    fn command_line_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = r#"{"backend": "lxc", "interval": 30, "metric_exclude": ["cache"],
            "cgroup_parent": ""}"#;
        file.write_all(json.as_bytes()).unwrap();

        let from_file = Settings::load(file.path()).unwrap();
        let cli = Settings {
            interval: Some(5.0),
            metric_exclude: Some(vec!["rss".into()]),
            ..Default::default()
        };
        let config = Config::try_from(from_file.merge(cli)).unwrap();

        assert_eq!(config.backend, BackendKind::Lxc);
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.metric_filter, FilterSpec::exclude(["rss"]));
        assert_eq!(config.cgroup.parent, "");
    }

    #[test]
    fn unknown_keys_are_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"metrics_whitelist": []}}"#).unwrap();
        assert!(matches!(
            Settings::load(file.path()),
            Err(CollectError::Config(_))
        ));
    }
}
