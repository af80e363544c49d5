//! vmperf - periodic resource metrics for libvirt domains and LXC containers.
//!
//! Samples every running entity once per interval and writes one record per
//! entity and per device as JSON Lines or InfluxDB line protocol.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vmperf::backend::{Backend, LibvirtBackend};
use vmperf::config::{BackendKind, Config, OutputFormat, Settings};
use vmperf::container::LxcBackend;
use vmperf::cycle::Collector;
use vmperf::hypervisor::Virsh;
use vmperf::sink::{open_writer, JsonLinesSink, LineProtocolSink, Sink};

/// Resource metrics collector for virtual machines and containers
#[derive(Parser, Debug)]
#[command(name = "vmperf")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; command line values take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Entity backend
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// Hypervisor connection URI (default: qemu:///system)
    #[arg(short, long)]
    uri: Option<String>,

    /// Sampling interval in seconds (default: 10)
    #[arg(short, long)]
    interval: Option<f64>,

    /// Entities sampled at the same time (default: 4)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Cgroup v1 mount point (default: /sys/fs/cgroup)
    #[arg(long)]
    cgroup_root: Option<PathBuf>,

    /// Directory under each controller that holds container groups (default: lxc)
    #[arg(long)]
    cgroup_parent: Option<String>,

    /// Output format (default: json)
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,

    /// Append records to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// virsh executable
    #[arg(long)]
    virsh: Option<PathBuf>,

    /// lxc executable
    #[arg(long)]
    lxc: Option<PathBuf>,

    /// Only sample these entities (comma separated)
    #[arg(long, value_delimiter = ',')]
    entity_include: Option<Vec<String>>,

    /// Skip these entities (comma separated)
    #[arg(long, value_delimiter = ',')]
    entity_exclude: Option<Vec<String>>,

    /// Only emit these fields (comma separated)
    #[arg(long, value_delimiter = ',')]
    metric_include: Option<Vec<String>>,

    /// Drop these fields (comma separated)
    #[arg(long, value_delimiter = ',')]
    metric_exclude: Option<Vec<String>>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            backend: self.backend,
            uri: self.uri.clone(),
            interval: self.interval,
            concurrency: self.concurrency,
            cgroup_root: self.cgroup_root.clone(),
            cgroup_parent: self.cgroup_parent.clone(),
            format: self.format,
            output: self.output.clone(),
            virsh: self.virsh.clone(),
            lxc: self.lxc.clone(),
            entity_include: self.entity_include.clone(),
            entity_exclude: self.entity_exclude.clone(),
            metric_include: self.metric_include.clone(),
            metric_exclude: self.metric_exclude.clone(),
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let file = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let config = Config::try_from(file.merge(args.settings()))?;
    Ok(config)
}

fn build_backend(config: &Config) -> Arc<dyn Backend> {
    match config.backend {
        BackendKind::Libvirt => Arc::new(LibvirtBackend::new(
            config.uri.clone(),
            Arc::new(Virsh::new(config.virsh.clone())),
        )),
        BackendKind::Lxc => Arc::new(LxcBackend::new(config.lxc.clone(), config.cgroup.clone())),
    }
}

fn build_sink(config: &Config) -> Result<Box<dyn Sink>> {
    let target = match &config.output {
        Some(path) => format!("output file {}", path.display()),
        None => "stdout".to_string(),
    };
    let writer = open_writer(config.output.as_deref())
        .with_context(|| format!("Failed to open {}", target))?;
    let sink: Box<dyn Sink> = match config.format {
        OutputFormat::Json => Box::new(JsonLinesSink::new(writer)),
        OutputFormat::Line => Box::new(LineProtocolSink::new(writer)),
    };
    Ok(sink)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    let config = load_config(&args).context("Invalid configuration")?;
    info!(
        backend = ?config.backend,
        interval_secs = config.interval.as_secs_f64(),
        concurrency = config.concurrency,
        "Starting collector"
    );

    let collector = Collector::new(
        build_backend(&config),
        config.entity_filter.clone(),
        config.metric_filter.clone(),
        config.cycle_options(),
    );
    let mut sink = build_sink(&config)?;

    if args.once {
        collector
            .run_cycle(sink.as_mut())
            .await
            .context("Cycle aborted")?;
        return Ok(());
    }

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Outcomes are logged by the collector; the next tick retries.
                let _ = collector.run_cycle(sink.as_mut()).await;
            }
            _ = &mut shutdown => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    if let Err(e) = sink.flush() {
        warn!("Failed to flush output: {}", e);
    }
    Ok(())
}
