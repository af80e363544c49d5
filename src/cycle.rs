//! One collection cycle: enumerate, read, assemble, filter, emit.
//!
//! A cycle moves `Start → Enumerating → PerEntityLoop → Done | Aborted`.
//! Failing to open the session or list entities aborts the cycle with no
//! emission. Past that point every entity is independent: a failing entity
//! is recorded and skipped, and the rest are still emitted.

use crate::assemble::assemble;
use crate::backend::{Backend, Session};
use crate::enumerate::list_active_entities;
use crate::error::{CollectError, EntityFailure, Result};
use crate::filter::FilterSpec;
use crate::metrics::{Entity, MetricRecord, StatCategory, StatRecord};
use crate::sink::Sink;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Start,
    Enumerating,
    PerEntityLoop,
    Done,
    Aborted,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Start => "start",
            CycleState::Enumerating => "enumerating",
            CycleState::PerEntityLoop => "per-entity",
            CycleState::Done => "done",
            CycleState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Result of processing one entity
#[derive(Debug)]
pub enum EntityOutcome {
    Collected {
        entity: String,
        records: Vec<MetricRecord>,
    },
    Failed(EntityFailure),
}

/// Summary of one finished cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub state: CycleState,
    /// Entities selected after filtering
    pub entities: usize,
    pub records_emitted: usize,
    pub failures: Vec<EntityFailure>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            state: CycleState::Start,
            entities: 0,
            records_emitted: 0,
            failures: Vec::new(),
        }
    }

    /// Aggregated per-entity failures, if any entity failed.
    pub fn error(&self) -> Option<CollectError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(CollectError::EntityFailures(self.failures.clone()))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleOptions {
    /// Deadline for every external call, normally one sampling interval
    pub deadline: Duration,
    /// Entities processed at the same time
    pub concurrency: usize,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            concurrency: 4,
        }
    }
}

/// Drives collection cycles against one backend
pub struct Collector {
    backend: Arc<dyn Backend>,
    entity_filter: FilterSpec,
    metric_filter: FilterSpec,
    options: CycleOptions,
}

impl Collector {
    pub fn new(
        backend: Arc<dyn Backend>,
        entity_filter: FilterSpec,
        metric_filter: FilterSpec,
        options: CycleOptions,
    ) -> Self {
        Self {
            backend,
            entity_filter,
            metric_filter,
            options,
        }
    }

    /// Run one full cycle, emitting into `sink`.
    ///
    /// Returns `Err` only when the cycle aborted. Per-entity failures are
    /// listed in the report and already-emitted records stay emitted.
    pub async fn run_cycle(&self, sink: &mut dyn Sink) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::new();
        report.state = CycleState::Enumerating;

        let session = match timeout(self.options.deadline, self.backend.open()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(abort(&mut report, e)),
            Err(_) => {
                let e = CollectError::Connection(format!(
                    "opening the control plane timed out after {:?}",
                    self.options.deadline
                ));
                return Err(abort(&mut report, e));
            }
        };

        // The session is closed on every path out of here.
        let result = self.run_session(session.as_ref(), sink, &mut report).await;
        session.close().await;

        report.elapsed = started.elapsed();
        match result {
            Ok(()) => {
                report.state = CycleState::Done;
                if let Some(err) = report.error() {
                    warn!(error = %err, "Cycle finished with failures");
                }
                info!(
                    entities = report.entities,
                    records = report.records_emitted,
                    failed = report.failures.len(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Cycle done"
                );
                Ok(report)
            }
            Err(e) => Err(abort(&mut report, e)),
        }
    }

    async fn run_session(
        &self,
        session: &dyn Session,
        sink: &mut dyn Sink,
        report: &mut CycleReport,
    ) -> Result<()> {
        let entities =
            list_active_entities(session, &self.entity_filter, self.options.deadline).await?;
        report.entities = entities.len();
        report.state = CycleState::PerEntityLoop;
        info!(entities = entities.len(), "Collecting");

        let mut outcomes = stream::iter(entities.iter())
            .map(|entity| self.collect_entity(session, entity))
            .buffer_unordered(self.options.concurrency.max(1));

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                EntityOutcome::Collected { entity, records } => match emit_all(sink, &records) {
                    Ok(written) => report.records_emitted += written,
                    Err((written, e)) => {
                        report.records_emitted += written;
                        let reason = format!(
                            "emission failed after {} of {} records: {}",
                            written,
                            records.len(),
                            e
                        );
                        warn!(entity = %entity, reason = %reason, "Partial emission");
                        report.failures.push(EntityFailure { entity, reason });
                    }
                },
                EntityOutcome::Failed(failure) => {
                    warn!(entity = %failure.entity, reason = %failure.reason, "Entity skipped");
                    report.failures.push(failure);
                }
            }
        }

        if let Err(e) = sink.flush() {
            warn!(error = %e, "Sink flush failed");
        }
        Ok(())
    }

    async fn collect_entity(&self, session: &dyn Session, entity: &Entity) -> EntityOutcome {
        match self.read_and_assemble(session, entity).await {
            Ok(records) => EntityOutcome::Collected {
                entity: entity.id.clone(),
                records,
            },
            Err(e) => EntityOutcome::Failed(EntityFailure {
                entity: entity.id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn read_and_assemble(
        &self,
        session: &dyn Session,
        entity: &Entity,
    ) -> Result<Vec<MetricRecord>> {
        let mut per_category: BTreeMap<StatCategory, Vec<StatRecord>> = BTreeMap::new();

        for reader in session.readers() {
            let category = reader.category();
            let records = match timeout(self.options.deadline, reader.read(entity)).await {
                Ok(Ok(records)) => records,
                Ok(Err(e)) if e.is_not_found() => {
                    debug!(
                        entity = %entity.id,
                        category = %category,
                        error = %e,
                        "Nothing to read"
                    );
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(CollectError::Read(format!(
                        "{} read timed out after {:?}",
                        category, self.options.deadline
                    )))
                }
            };
            for record in records {
                per_category
                    .entry(record.category)
                    .or_default()
                    .push(record);
            }
        }

        assemble(self.backend.schema(), entity, &per_category, &self.metric_filter)
    }
}

fn abort(report: &mut CycleReport, err: CollectError) -> CollectError {
    error!(during = %report.state, error = %err, "Cycle aborted");
    report.state = CycleState::Aborted;
    err
}

/// Emit `records` in order. On failure, also reports how many were already
/// written.
fn emit_all(
    sink: &mut dyn Sink,
    records: &[MetricRecord],
) -> std::result::Result<usize, (usize, CollectError)> {
    for (written, record) in records.iter().enumerate() {
        sink.emit_record(record).map_err(|e| (written, e))?;
    }
    Ok(records.len())
}
