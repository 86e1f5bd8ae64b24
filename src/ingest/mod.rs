//! Resumable, checkpointed ingestion.
//!
//! Each source is driven through `Fetching -> Processing -> Checkpointing`
//! until a fetch comes back empty. All progress lives in the store, so a
//! killed run restarts from the last persisted offset. Re-delivered records
//! merge as `unchanged`.

pub mod report;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::PipelineConfig;
use crate::fetch::Fetcher;
use crate::merge::{MergeEngine, MergeError, RetryPolicy};
use crate::model::SourceDescriptor;
use crate::normalize::{Normalizer, NormalizerRegistry, RegistryError};
use crate::store::{Store, StoreError, now_iso8601};

pub use report::{
    BatchReport, IssueKind, RecordIssue, RunReport, SourceReport, SourceState, Tally,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Fetching,
    Processing,
    Checkpointing,
    Done,
}

impl DriverState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Checkpointing => "checkpointing",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("checkpoint for `{0}` would overflow")]
    OffsetOverflow(String),
    #[error("ingest worker for `{0}` panicked")]
    WorkerPanicked(String),
    #[error("source `{0}` is listed more than once")]
    DuplicateSource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub batch_size: u64,
    pub retry: RetryPolicy,
    pub parallel: bool,
}

impl From<&PipelineConfig> for DriverSettings {
    fn from(pipeline: &PipelineConfig) -> Self {
        Self {
            batch_size: pipeline.fetch_interval,
            retry: RetryPolicy {
                max_attempts: pipeline.merge_retries,
                backoff: pipeline.retry_backoff,
            },
            parallel: pipeline.parallel,
        }
    }
}

pub struct Driver {
    db_path: PathBuf,
    busy_timeout: Duration,
    fetcher: Box<dyn Fetcher>,
    registry: NormalizerRegistry,
    sources: Vec<SourceDescriptor>,
    settings: DriverSettings,
    stop: Arc<AtomicBool>,
}

impl Driver {
    /// Fails if any source lacks a normalizer or appears twice, before
    /// anything is fetched.
    pub fn new(
        db_path: &Path,
        busy_timeout: Duration,
        fetcher: Box<dyn Fetcher>,
        registry: NormalizerRegistry,
        sources: Vec<SourceDescriptor>,
        settings: DriverSettings,
    ) -> Result<Self, IngestError> {
        if settings.batch_size == 0 {
            return Err(IngestError::ZeroBatchSize);
        }
        let mut seen = HashSet::new();
        if let Some(dup) = sources.iter().find(|source| !seen.insert(source.name.as_str())) {
            return Err(IngestError::DuplicateSource(dup.name.clone()));
        }
        registry.ensure_registered(&sources)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            busy_timeout,
            fetcher,
            registry,
            sources,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replaces the stop flag, e.g. with one shared with a signal handler.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    /// Drives every source to a terminal state. Only storage failures abort.
    pub fn run(&self) -> Result<RunReport, IngestError> {
        let started_at = now_iso8601();
        let sources = if self.settings.parallel && self.sources.len() > 1 {
            self.run_parallel()?
        } else {
            self.run_sequential()?
        };
        let report = RunReport {
            started_at,
            finished_at: now_iso8601(),
            sources,
        };
        let totals = report.totals();
        info!(
            sources = report.sources.len(),
            fetched = totals.fetched,
            merged = totals.merged(),
            rejected = totals.rejected,
            failed = totals.failed,
            "ingest run finished"
        );
        Ok(report)
    }

    fn open_store(&self) -> Result<Store, IngestError> {
        Ok(Store::open(&self.db_path, self.busy_timeout)?)
    }

    fn run_sequential(&self) -> Result<Vec<SourceReport>, IngestError> {
        let store = self.open_store()?;
        self.sources
            .iter()
            .map(|source| self.run_source(&store, source))
            .collect()
    }

    fn run_parallel(&self) -> Result<Vec<SourceReport>, IngestError> {
        let joined = thread::scope(|scope| {
            let handles = self
                .sources
                .iter()
                .map(|source| {
                    scope.spawn(move || {
                        let store = self.open_store()?;
                        self.run_source(&store, source)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        });

        let mut reports = Vec::with_capacity(joined.len());
        for (source, result) in self.sources.iter().zip(joined) {
            match result {
                Ok(report) => reports.push(report?),
                Err(_) => return Err(IngestError::WorkerPanicked(source.name.clone())),
            }
        }
        Ok(reports)
    }

    /// Runs one source from its persisted checkpoint until it is exhausted,
    /// a fetch fails, or a stop is requested.
    pub fn run_source(
        &self,
        store: &Store,
        source: &SourceDescriptor,
    ) -> Result<SourceReport, IngestError> {
        let normalizer = self
            .registry
            .get(&source.name)
            .ok_or_else(|| RegistryError::Unregistered(vec![source.name.clone()]))?;
        let engine = MergeEngine::new(store);
        let limit = self.settings.batch_size;

        let mut offset = store.get_offset(&source.name, 0)?;
        let mut report = SourceReport::start(&source.name, offset);
        let mut state = DriverState::Idle;
        info!(source = %source.name, offset, "ingesting source");

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!(source = %source.name, offset, "stop requested");
                report.state = SourceState::Stopped;
                break;
            }

            transition(source, &mut state, DriverState::Fetching);
            let batch = match self.fetcher.fetch(source, offset, limit) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(source = %source.name, offset, error = %err, "fetch failed, holding checkpoint");
                    report.state = SourceState::FetchFailed;
                    report.fetch_error = Some(err.to_string());
                    break;
                }
            };
            if batch.is_empty() {
                info!(source = %source.name, offset, "source exhausted");
                report.state = SourceState::Done;
                transition(source, &mut state, DriverState::Done);
                break;
            }

            transition(source, &mut state, DriverState::Processing);
            let batch_report =
                self.process_batch(store, &engine, normalizer, source, offset, limit, &batch)?;

            transition(source, &mut state, DriverState::Checkpointing);
            let next = offset
                .checked_add(limit)
                .ok_or_else(|| IngestError::OffsetOverflow(source.name.clone()))?;
            // Another writer may already be further along.
            let next = store.set_offset(&source.name, next)?;
            debug!(
                source = %source.name,
                from = offset,
                to = next,
                fetched = batch_report.tally.fetched,
                rejected = batch_report.tally.rejected,
                failed = batch_report.tally.failed,
                "checkpoint advanced"
            );
            report.push_batch(batch_report, next);
            offset = next;
            transition(source, &mut state, DriverState::Idle);
        }

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_batch(
        &self,
        store: &Store,
        engine: &MergeEngine<'_>,
        normalizer: &dyn Normalizer,
        source: &SourceDescriptor,
        offset: u64,
        limit: u64,
        batch: &[Value],
    ) -> Result<BatchReport, IngestError> {
        let mut report = BatchReport::new(offset, limit, batch.len());

        for (position, raw) in (offset..).zip(batch) {
            let Some(local_id) = source.local_id(raw) else {
                warn!(source = %source.name, offset = position, field = %source.index_id, "record has no usable local id");
                report.record_issue(RecordIssue {
                    local_id: None,
                    offset: position,
                    kind: IssueKind::MissingLocalId,
                    reason: format!("missing or unsupported `{}`", source.index_id),
                });
                continue;
            };

            store.archive_raw(&source.name, &local_id, raw)?;

            let attrs = match normalizer.normalize(raw) {
                Ok(attrs) => attrs,
                Err(rejection) => {
                    warn!(
                        source = %source.name,
                        local_id = %local_id,
                        offset = position,
                        archive_key = %source.archive_key(&local_id),
                        reason = %rejection,
                        "record rejected by normalizer"
                    );
                    report.record_issue(RecordIssue {
                        local_id: Some(local_id),
                        offset: position,
                        kind: IssueKind::Rejected,
                        reason: rejection.to_string(),
                    });
                    continue;
                }
            };

            match engine.merge_with_retry(&self.settings.retry, &source.name, &local_id, &attrs) {
                Ok(outcome) => {
                    trace!(source = %source.name, local_id = %local_id, ?outcome, "merged");
                    report.record_outcome(&outcome);
                }
                Err(err) => {
                    let (kind, reason) = merge_issue(err)?;
                    warn!(
                        source = %source.name,
                        local_id = %local_id,
                        offset = position,
                        error = %reason,
                        "record not merged"
                    );
                    report.record_issue(RecordIssue {
                        local_id: Some(local_id),
                        offset: position,
                        kind,
                        reason,
                    });
                }
            }
        }

        Ok(report)
    }
}

/// Classifies a merge error as a per-record issue. Storage failures are not
/// about the record and pass through.
fn merge_issue(err: MergeError) -> Result<(IssueKind, String), StoreError> {
    let kind = match err {
        MergeError::Storage(err) => return Err(err),
        MergeError::MergeFailed { .. } => IssueKind::MergeFailed,
        MergeError::InvalidAttributes(_) => IssueKind::InvalidAttributes,
        MergeError::MissingProvenance => IssueKind::MissingLocalId,
    };
    Ok((kind, err.to_string()))
}

fn transition(source: &SourceDescriptor, state: &mut DriverState, next: DriverState) {
    trace!(source = %source.name, from = %state, to = %next, "driver state");
    *state = next;
}
