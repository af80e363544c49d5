//! Hypervisor backend driving the `virsh` CLI in read-only mode.

use super::{
    memory_tag, BlockStats, DomainInfo, DomainStats, Hypervisor, HypervisorConnection,
    InterfaceStats, MemoryStat, StatsClass,
};
use crate::error::{CollectError, Result};
use crate::metrics::{Entity, EntityState};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// `domuuid` lookups in flight while listing
const UUID_LOOKUPS: usize = 8;

/// Factory for `virsh` connections
#[derive(Debug, Clone)]
pub struct Virsh {
    binary: PathBuf,
}

impl Virsh {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for Virsh {
    fn default() -> Self {
        Self::new("virsh")
    }
}

#[async_trait]
impl Hypervisor for Virsh {
    async fn connect_read_only(&self, uri: &str) -> Result<Arc<dyn HypervisorConnection>> {
        let conn = VirshConnection {
            binary: self.binary.clone(),
            uri: uri.to_string(),
        };
        // `virsh uri` fails fast when the daemon is unreachable
        conn.run(&["uri"]).await.map_err(connection_error)?;
        debug!(uri = %uri, "Opened read-only hypervisor connection");
        Ok(Arc::new(conn))
    }
}

struct VirshConnection {
    binary: PathBuf,
    uri: String,
}

impl VirshConnection {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--readonly")
            .arg("--connect")
            .arg(&self.uri)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CollectError::Read(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_missing_domain(&stderr) {
                return Err(CollectError::NotFound(stderr));
            }
            return Err(CollectError::Read(format!(
                "`virsh {}` exited with {}: {}",
                args.join(" "),
                output.status,
                stderr
            )));
        }

        String::from_utf8(output.stdout).map_err(|_| {
            CollectError::Read(format!("`virsh {}` printed non-UTF-8 output", args.join(" ")))
        })
    }

    /// Resolve a listed domain to an entity. Running domains are keyed by
    /// UUID; `None` when the domain disappeared after listing.
    async fn lookup(&self, name: String, state: EntityState) -> Result<Option<Entity>> {
        if state != EntityState::Running {
            return Ok(Some(Entity::new(name.clone(), name, state)));
        }
        match self.run(&["domuuid", &name]).await {
            Ok(out) => Ok(Some(Entity::new(out.trim(), name, state))),
            Err(e) if e.is_not_found() => {
                debug!(domain = %name, "Domain vanished while listing");
                Ok(None)
            }
            Err(e) => Err(connection_error(e)),
        }
    }
}

#[async_trait]
impl HypervisorConnection for VirshConnection {
    /// Inactive domains are never sampled, so they keep their name as id
    /// and skip the UUID lookup.
    async fn list_all_domains(&self) -> Result<Vec<Entity>> {
        let listing = self.run(&["list", "--all"]).await.map_err(connection_error)?;

        let lookups: Vec<Result<Option<Entity>>> = stream::iter(parse_domain_list(&listing)?)
            .map(|(name, state)| self.lookup(name, state))
            .buffered(UUID_LOOKUPS)
            .collect()
            .await;

        let mut domains = Vec::new();
        for lookup in lookups {
            if let Some(domain) = lookup? {
                domains.push(domain);
            }
        }
        Ok(domains)
    }

    async fn domain_info(&self, domain: &Entity) -> Result<DomainInfo> {
        let info_args = ["dominfo", &domain.id];
        let cpu_args = ["domstats", "--cpu-total", &domain.id];
        let (info, cpu) = tokio::try_join!(self.run(&info_args), self.run(&cpu_args),)?;
        let mut info = parse_dominfo(&info)?;
        info.cpu_time = parse_cpu_time(&cpu)?;
        Ok(info)
    }

    async fn memory_stats(&self, domain: &Entity) -> Result<Vec<MemoryStat>> {
        let output = self.run(&["dommemstat", &domain.id]).await?;
        Ok(parse_dommemstat(&output))
    }

    async fn domain_stats(&self, domain: &Entity, class: StatsClass) -> Result<Vec<DomainStats>> {
        let selector = match class {
            StatsClass::Interface => "--interface",
            StatsClass::Block => "--block",
        };
        parse_domstats(&self.run(&["domstats", selector, &domain.id]).await?)
    }

    async fn close(&self) {
        // Every virsh invocation holds its own connection; nothing stays open.
        debug!(uri = %self.uri, "Closed hypervisor connection");
    }
}

fn connection_error(err: CollectError) -> CollectError {
    match err {
        CollectError::Read(msg) | CollectError::NotFound(msg) => CollectError::Connection(msg),
        other => other,
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("Domain not found") || stderr.contains("failed to get domain")
}

/// Parse the `virsh list --all` table into `(name, state)` pairs.
pub fn parse_domain_list(output: &str) -> Result<Vec<(String, EntityState)>> {
    let mut lines = output.lines();
    // Header and dashed separator precede the rows
    let separated = lines
        .by_ref()
        .any(|line| line.trim_start().starts_with("---"));
    if !separated {
        return Err(CollectError::Connection(format!(
            "unexpected `virsh list` output: {:?}",
            output.trim()
        )));
    }

    let mut domains = Vec::new();
    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() < 3 {
            return Err(CollectError::Connection(format!(
                "malformed domain row: {:?}",
                line
            )));
        }
        let state = if parts[2..].join(" ") == "running" {
            EntityState::Running
        } else {
            EntityState::NotRunning
        };
        domains.push((parts[1].to_string(), state));
    }
    Ok(domains)
}

/// Parse `virsh dominfo` output for the vCPU count and balloon sizes.
///
/// `dominfo` prints CPU time rounded to 100ms, so `cpu_time` is left at zero
/// here and filled from [`parse_cpu_time`].
pub fn parse_dominfo(output: &str) -> Result<DomainInfo> {
    let mut info = DomainInfo::default();
    let mut saw_cpus = false;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "CPU(s)" => {
                info.nr_virt_cpu = value
                    .parse()
                    .map_err(|_| CollectError::Read(format!("bad CPU(s) value {:?}", value)))?;
                saw_cpus = true;
            }
            "Max memory" => info.max_mem = parse_kib(value)?,
            "Used memory" => info.memory = parse_kib(value)?,
            _ => {}
        }
    }

    if !saw_cpus {
        return Err(CollectError::Read(
            "dominfo output has no CPU(s) line".to_string(),
        ));
    }
    Ok(info)
}

/// Exact CPU time in nanoseconds from `virsh domstats --cpu-total`.
pub fn parse_cpu_time(output: &str) -> Result<u64> {
    let value = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("cpu.time="))
        .ok_or_else(|| CollectError::Read("domstats output has no cpu.time".to_string()))?;
    value
        .parse()
        .map_err(|_| CollectError::Read(format!("cpu.time is not a counter: {:?}", value)))
}

fn parse_kib(value: &str) -> Result<u64> {
    value
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| CollectError::Read(format!("bad memory value {:?}", value)))
}

/// Translate `virsh dommemstat` names back into libvirt tags. Unknown names
/// are skipped.
pub fn parse_dommemstat(output: &str) -> Vec<MemoryStat> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let tag = memstat_tag(parts.next()?)?;
            let val = parts.next()?.parse().ok()?;
            Some(MemoryStat { tag, val })
        })
        .collect()
}

fn memstat_tag(name: &str) -> Option<i32> {
    let tag = match name {
        "swap_in" => memory_tag::SWAP_IN,
        "swap_out" => memory_tag::SWAP_OUT,
        "major_fault" => memory_tag::MAJOR_FAULT,
        "minor_fault" => memory_tag::MINOR_FAULT,
        "unused" => memory_tag::UNUSED,
        "available" => memory_tag::AVAILABLE,
        "actual" => memory_tag::ACTUAL_BALLOON,
        "rss" => memory_tag::RSS,
        "usable" => memory_tag::USABLE,
        "last_update" => memory_tag::LAST_UPDATE,
        "disk_caches" => memory_tag::DISK_CACHES,
        "hugetlb_pgalloc" => memory_tag::HUGETLB_PGALLOC,
        "hugetlb_pgfail" => memory_tag::HUGETLB_PGFAIL,
        _ => return None,
    };
    Some(tag)
}

/// Parse `virsh domstats` output into one result set per `Domain:` block.
pub fn parse_domstats(output: &str) -> Result<Vec<DomainStats>> {
    let mut sets = Vec::new();
    let mut current: Option<(String, BTreeMap<String, String>)> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix("Domain:") {
            if let Some((domain, values)) = current.take() {
                sets.push(build_domain_stats(domain, &values)?);
            }
            let name = name.trim().trim_matches('\'').to_string();
            current = Some((name, BTreeMap::new()));
            continue;
        }
        let Some((_, values)) = current.as_mut() else {
            return Err(CollectError::Read(format!(
                "stat line before any domain: {:?}",
                line
            )));
        };
        let Some((key, value)) = line.split_once('=') else {
            return Err(CollectError::Read(format!("malformed stat line: {:?}", line)));
        };
        values.insert(key.to_string(), value.to_string());
    }
    if let Some((domain, values)) = current {
        sets.push(build_domain_stats(domain, &values)?);
    }
    Ok(sets)
}

fn build_domain_stats(domain: String, values: &BTreeMap<String, String>) -> Result<DomainStats> {
    let mut stats = DomainStats {
        domain,
        ..Default::default()
    };

    for i in 0..count(values, "net")? {
        let get = |field: &str| counter(values, &format!("net.{}.{}", i, field));
        stats.net.push(InterfaceStats {
            name: name(values, "net", i)?,
            rx_bytes: get("rx.bytes")?.unwrap_or(0),
            rx_pkts: get("rx.pkts")?.unwrap_or(0),
            rx_errs: get("rx.errs")?.unwrap_or(0),
            rx_drop: get("rx.drop")?.unwrap_or(0),
            tx_bytes: get("tx.bytes")?.unwrap_or(0),
            tx_pkts: get("tx.pkts")?.unwrap_or(0),
            tx_errs: get("tx.errs")?.unwrap_or(0),
            tx_drop: get("tx.drop")?.unwrap_or(0),
        });
    }

    for i in 0..count(values, "block")? {
        let get = |field: &str| counter(values, &format!("block.{}.{}", i, field));
        stats.block.push(BlockStats {
            name: name(values, "block", i)?,
            rd_reqs: get("rd.reqs")?.unwrap_or(0),
            rd_bytes: get("rd.bytes")?.unwrap_or(0),
            wr_reqs: get("wr.reqs")?.unwrap_or(0),
            wr_bytes: get("wr.bytes")?.unwrap_or(0),
            errors: get("errors")?,
            rd_times: get("rd.times")?,
            wr_times: get("wr.times")?,
            fl_reqs: get("fl.reqs")?,
            fl_times: get("fl.times")?,
            allocation: get("allocation")?,
            capacity: get("capacity")?,
            physical: get("physical")?,
        });
    }

    Ok(stats)
}

fn count(values: &BTreeMap<String, String>, prefix: &str) -> Result<usize> {
    Ok(counter(values, &format!("{}.count", prefix))?.unwrap_or(0) as usize)
}

fn name(values: &BTreeMap<String, String>, prefix: &str, index: usize) -> Result<String> {
    values
        .get(&format!("{}.{}.name", prefix, index))
        .cloned()
        .ok_or_else(|| CollectError::Read(format!("{}.{} has no name", prefix, index)))
}

fn counter(values: &BTreeMap<String, String>, key: &str) -> Result<Option<u64>> {
    values
        .get(key)
        .map(|v| {
            v.parse()
                .map_err(|_| CollectError::Read(format!("{} is not a counter: {:?}", key, v)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    const LIST: &str = " Id   Name   State
-----------------------
 1    vm-a   running
 -    vm-b   shut off

";

    /// A stand-in `virsh` that answers from a shell `case` on the
    /// subcommand. The first three arguments are `--readonly --connect <uri>`.
    fn fake_virsh(dir: &Path, cases: &str) -> Virsh {
        let path = dir.join("virsh");
        let script = format!("#!/bin/sh\nshift 3\ncase \"$1\" in\n{}\nesac\n", cases);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Virsh::new(path)
    }

    const HEALTHY: &str = r#"
  uri) echo "test:///default" ;;
  list)
    echo ' Id   Name      State'
    echo '-----------------------'
    echo ' 1    vm-a      running'
    echo ' 2    vm-gone   running'
    echo ' -    vm-off    shut off' ;;
  domuuid)
    case "$2" in
      vm-a) echo "uuid-a" ;;
      vm-gone) echo "error: failed to get domain 'vm-gone'" >&2; exit 1 ;;
      *) echo "error: unexpected lookup of $2" >&2; exit 1 ;;
    esac ;;
  dominfo)
    case "$2" in
      uuid-a)
        echo 'CPU(s):         2'
        echo 'CPU time:       51.5s'
        echo 'Max memory:     2097152 KiB'
        echo 'Used memory:    1048576 KiB' ;;
      *) echo "error: Domain not found: no domain with matching uuid '$2'" >&2; exit 1 ;;
    esac ;;
  domstats) printf "Domain: 'vm-a'\n  cpu.time=51534567890\n  cpu.user=1000\n" ;;
  dommemstat) echo "error: internal error: agent unavailable" >&2; exit 1 ;;
"#;

    fn vm(id: &str) -> Entity {
        Entity::new(id, id, EntityState::Running)
    }

    #[test]
    fn domain_list_keeps_state() {
        let domains = parse_domain_list(LIST).unwrap();
        assert_eq!(
            domains,
            vec![
                ("vm-a".to_string(), EntityState::Running),
                ("vm-b".to_string(), EntityState::NotRunning),
            ]
        );
    }

    #[test]
    fn garbage_listing_is_connection_error() {
        let err = parse_domain_list("error: no connection driver available").unwrap_err();
        assert!(matches!(err, CollectError::Connection(_)));
    }

    #[test]
    fn dominfo_fields() {
        let out = "Id:             1
Name:           vm-a
UUID:           0b1c0f3a-0000-4000-8000-000000000001
State:          running
CPU(s):         2
CPU time:       51.5s
Max memory:     2097152 KiB
Used memory:    1048576 KiB
";
        let info = parse_dominfo(out).unwrap();
        assert_eq!(
            info,
            DomainInfo {
                cpu_time: 0,
                nr_virt_cpu: 2,
                max_mem: 2097152,
                memory: 1048576,
            }
        );
    }

    #[test]
    fn dominfo_without_cpus_is_read_error() {
        assert!(matches!(
            parse_dominfo("Name: vm-a\n"),
            Err(CollectError::Read(_))
        ));
    }

    #[test]
    fn cpu_time_keeps_nanoseconds() {
        let out = "Domain: 'vm-a'\n  cpu.time=51534567890\n  cpu.user=1000\n";
        assert_eq!(parse_cpu_time(out).unwrap(), 51_534_567_890);
        assert!(matches!(
            parse_cpu_time("Domain: 'vm-a'\n"),
            Err(CollectError::Read(_))
        ));
    }

    #[test]
    fn dommemstat_maps_names_to_tags() {
        let stats = parse_dommemstat("actual 2097152\navailable 204800\nusable 102400\nbogus 1\n");
        assert_eq!(
            stats,
            vec![
                MemoryStat {
                    tag: memory_tag::ACTUAL_BALLOON,
                    val: 2097152,
                },
                MemoryStat {
                    tag: memory_tag::AVAILABLE,
                    val: 204800,
                },
                MemoryStat {
                    tag: memory_tag::USABLE,
                    val: 102400,
                },
            ]
        );
    }

    #[test]
    fn domstats_interfaces_and_disks() {
        let out = "Domain: 'vm-a'
  net.count=1
  net.0.name=vnet0
  net.0.rx.bytes=100
  net.0.rx.pkts=2
  net.0.rx.errs=0
  net.0.rx.drop=1
  net.0.tx.bytes=200
  net.0.tx.pkts=3
  net.0.tx.errs=0
  net.0.tx.drop=0
  block.count=1
  block.0.name=vda
  block.0.rd.reqs=10
  block.0.rd.bytes=4096
  block.0.wr.reqs=5
  block.0.wr.bytes=2048
  block.0.capacity=10737418240

";
        let sets = parse_domstats(out).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].domain, "vm-a");
        assert_eq!(sets[0].net[0].name, "vnet0");
        assert_eq!(sets[0].net[0].rx_drop, 1);
        assert_eq!(sets[0].net[0].tx_bytes, 200);
        let disk = &sets[0].block[0];
        assert_eq!(
            (disk.name.as_str(), disk.rd_reqs, disk.wr_bytes),
            ("vda", 10, 2048)
        );
        assert_eq!(disk.capacity, Some(10737418240));
        assert_eq!(disk.errors, None);
    }

    #[test]
    fn domstats_counts_result_sets() {
        let out = "Domain: 'a'\n  net.count=0\n\nDomain: 'b'\n  net.count=0\n";
        assert_eq!(parse_domstats(out).unwrap().len(), 2);
        assert!(parse_domstats("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_skips_vanished_domains_and_inactive_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let conn = fake_virsh(dir.path(), HEALTHY)
            .connect_read_only("test:///default")
            .await
            .unwrap();

        let domains = conn.list_all_domains().await.unwrap();
        assert_eq!(
            domains,
            vec![
                Entity::new("uuid-a", "vm-a", EntityState::Running),
                Entity::new("vm-off", "vm-off", EntityState::NotRunning),
            ]
        );
    }

    #[tokio::test]
    async fn domain_info_reads_exact_cpu_time() {
        let dir = tempfile::tempdir().unwrap();
        let conn = fake_virsh(dir.path(), HEALTHY)
            .connect_read_only("test:///default")
            .await
            .unwrap();

        let info = conn.domain_info(&vm("uuid-a")).await.unwrap();
        assert_eq!(info.cpu_time, 51_534_567_890);
        assert_eq!(info.nr_virt_cpu, 2);
        assert_eq!(info.memory, 1048576);
    }

    #[tokio::test]
    async fn missing_domain_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let conn = fake_virsh(dir.path(), HEALTHY)
            .connect_read_only("test:///default")
            .await
            .unwrap();

        let err = conn.domain_info(&vm("uuid-gone")).await.unwrap_err();
        assert!(err.is_not_found(), "{}", err);
    }

    #[tokio::test]
    async fn failing_query_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let conn = fake_virsh(dir.path(), HEALTHY)
            .connect_read_only("test:///default")
            .await
            .unwrap();

        let err = conn.memory_stats(&vm("uuid-a")).await.unwrap_err();
        assert!(
            matches!(&err, CollectError::Read(msg) if msg.contains("agent unavailable")),
            "{}",
            err
        );
    }

    #[tokio::test]
    async fn failing_listing_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let cases = r#"
  uri) echo "test:///default" ;;
  list) echo "error: failed to connect to the hypervisor" >&2; exit 1 ;;
"#;
        let conn = fake_virsh(dir.path(), cases)
            .connect_read_only("test:///default")
            .await
            .unwrap();

        let err = conn.list_all_domains().await.unwrap_err();
        assert!(matches!(err, CollectError::Connection(_)));
    }

    #[tokio::test]
    async fn unreachable_daemon_fails_connect() {
        let dir = tempfile::tempdir().unwrap();
        let cases = r#"
  *) echo "error: failed to connect to the hypervisor" >&2; exit 1 ;;
"#;
        let result = fake_virsh(dir.path(), cases)
            .connect_read_only("qemu:///system")
            .await;
        assert!(matches!(result, Err(CollectError::Connection(_))));
    }
}
