//! cgroup v1 accounting files for LXC containers.
//!
//! Files live at `<root>/<controller>/<parent>/<container>/<file>` and hold
//! newline separated `<key> <value>` pairs with integer values.

use crate::error::{CollectError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Where container cgroups are mounted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupLayout {
    pub root: PathBuf,
    /// Directory between the controller and the container, `lxc` by default
    pub parent: String,
}

impl CgroupLayout {
    pub fn new(root: impl Into<PathBuf>, parent: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            parent: parent.into(),
        }
    }

    pub fn path(&self, controller: &str, container: &str, file: &str) -> PathBuf {
        let mut path = self.root.join(controller);
        if !self.parent.is_empty() {
            path.push(&self.parent);
        }
        path.join(container).join(file)
    }
}

impl Default for CgroupLayout {
    fn default() -> Self {
        Self::new("/sys/fs/cgroup", "lxc")
    }
}

/// Read a pseudo-file. A missing file maps to [`CollectError::NotFound`].
pub async fn read_file(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(CollectError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(CollectError::Read(format!("failed to read {}: {}", path.display(), e))),
    }
}

/// Parse `<key> <value>` lines.
///
/// Lines with more than two tokens (`8:0 Read 4096`) use every token but the
/// last as the key, joined by `_`. Blank lines are skipped; any value that is
/// not an integer fails the whole file.
pub fn parse_pairs(content: &str, source: &str) -> Result<Vec<(String, i64)>> {
    let mut pairs = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((value, key)) = parts.split_last() else {
            continue;
        };
        if key.is_empty() {
            return Err(CollectError::Read(format!(
                "{}:{}: expected `<key> <value>`, got {:?}",
                source,
                lineno + 1,
                line
            )));
        }
        let value: i64 = value.parse().map_err(|_| {
            CollectError::Read(format!(
                "{}:{}: value {:?} is not an integer",
                source,
                lineno + 1,
                value
            ))
        })?;
        pairs.push((key.join("_"), value));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_joins_controller_parent_and_container() {
        let layout = CgroupLayout::default();
        assert_eq!(
            layout.path("memory", "web", "memory.stat"),
            PathBuf::from("/sys/fs/cgroup/memory/lxc/web/memory.stat")
        );
        let flat = CgroupLayout::new("/cg", "");
        assert_eq!(
            flat.path("blkio", "db", "blkio.sectors"),
            PathBuf::from("/cg/blkio/db/blkio.sectors")
        );
    }

    #[test]
    fn parses_two_and_three_token_lines() {
        let content = "cache 4096\nrss 8192\n\n8:0 Read 12\n";
        let pairs = parse_pairs(content, "memory.stat").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("cache".to_string(), 4096),
                ("rss".to_string(), 8192),
                ("8:0_Read".to_string(), 12),
            ]
        );
    }

    #[test]
    fn non_integer_value_is_read_error() {
        let err = parse_pairs("user 12\nsystem abc\n", "cpuacct.stat")
            .unwrap_err();
        assert!(matches!(err, CollectError::Read(msg) if msg.contains("cpuacct.stat:2")));
    }

    #[test]
    fn lone_token_is_read_error() {
        assert!(matches!(
            parse_pairs("Total\n", "blkio.io_serviced"),
            Err(CollectError::Read(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(&dir.path().join("absent")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
