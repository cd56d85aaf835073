//! Background Jobs
//!
//! Runs compression, retention and continuous-aggregate refresh policies on a
//! schedule. Every job is a bounded batch: one pass over the eligible chunks
//! or one refresh. Compression of several chunks runs in parallel on the
//! blocking pool.

use crate::aggregate::{AggregateError, ContinuousAggregate, RefreshOutcome};
use crate::storage::{format_millis, CompressOutcome, Hypertable, StorageError};
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Most chunks one compression run will handle
const MAX_COMPRESS_PER_RUN: usize = 16;

/// Backoff step after a failed run
const RETRY_STEP_MILLIS: i64 = 15 * 60_000;

/// Longest backoff after repeated failures
const MAX_RETRY_MILLIS: i64 = 60 * 60_000;

/// Errors surfaced through a job's status
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    /// Some refresh sub-ranges could not be materialized
    #[error("Refresh incomplete: {0}")]
    Refresh(String),

    /// The blocking task panicked or was cancelled
    #[error("Job task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for JobError {
    fn from(err: tokio::task::JoinError) -> Self {
        JobError::Join(err.to_string())
    }
}

/// What a job does
#[derive(Clone)]
pub enum JobKind {
    /// Close and compress chunks that ended at least `after` ago
    Compression { table: Arc<Hypertable>, after: i64 },
    /// Drop chunks that ended at least `drop_after` ago
    Retention { table: Arc<Hypertable>, drop_after: i64 },
    /// Refresh a continuous aggregate
    Refresh { aggregate: Arc<ContinuousAggregate> },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Compression { .. } => "compression",
            JobKind::Retention { .. } => "retention",
            JobKind::Refresh { .. } => "refresh",
        }
    }

    /// Table or aggregate the job works on
    pub fn target(&self) -> &str {
        match self {
            JobKind::Compression { table, .. } | JobKind::Retention { table, .. } => table.name(),
            JobKind::Refresh { aggregate } => aggregate.name(),
        }
    }

    /// Identifier of the policy this job implements
    pub fn id(&self) -> String {
        format!("{}:{}", self.name(), self.target())
    }
}

/// Status of the last run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Success { summary: String },
    Failed { error: String },
}

/// A scheduled job and its bookkeeping
#[derive(Clone)]
pub struct Job {
    pub kind: JobKind,
    /// Milliseconds between runs
    pub interval: i64,
    pub enabled: bool,
    pub last_run: Option<i64>,
    pub last_status: Option<JobStatus>,
    /// `None` runs at the next opportunity
    pub next_run: Option<i64>,
    pub error_count: u32,
}

impl Job {
    pub fn new(kind: JobKind, interval: i64) -> Self {
        Self {
            kind,
            interval: interval.max(1),
            enabled: true,
            last_run: None,
            last_status: None,
            next_run: None,
            error_count: 0,
        }
    }

    fn is_due(&self, now: i64) -> bool {
        self.enabled && self.next_run.map_or(true, |next| now >= next)
    }
}

/// Introspection of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub kind: &'static str,
    pub target: String,
    pub interval: i64,
    pub enabled: bool,
    pub last_run: Option<String>,
    pub last_status: Option<JobStatus>,
    pub next_run: Option<String>,
    pub error_count: u32,
}

/// Result of one job execution
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: String,
    pub status: JobStatus,
}

/// Runs jobs when they are due
pub struct JobScheduler {
    jobs: RwLock<BTreeMap<String, Job>>,
    running: RwLock<bool>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            running: RwLock::new(false),
        }
    }

    /// Add or replace the job for a policy, returning its id
    pub async fn add(&self, job: Job) -> String {
        let id = job.kind.id();
        tracing::info!(job = %id, interval_ms = job.interval, "Scheduled job");
        self.jobs.write().await.insert(id.clone(), job);
        id
    }

    /// Remove a job; false when it did not exist
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.jobs.write().await.remove(id).is_some();
        if removed {
            tracing::info!(job = %id, "Removed job");
        }
        removed
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.jobs.read().await.contains_key(id)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.jobs.write().await.get_mut(id) {
            Some(job) => {
                job.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<JobInfo> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|(id, job)| JobInfo {
                id: id.clone(),
                kind: job.kind.name(),
                target: job.kind.target().to_string(),
                interval: job.interval,
                enabled: job.enabled,
                last_run: job.last_run.map(format_millis),
                last_status: job.last_status.clone(),
                next_run: job.next_run.map(format_millis),
                error_count: job.error_count,
            })
            .collect()
    }

    /// Run every due job once
    pub async fn run_due(&self, now: i64) -> Vec<JobRun> {
        let due: Vec<(String, JobKind)> = {
            let jobs = self.jobs.read().await;
            jobs.iter()
                .filter(|(_, job)| job.is_due(now))
                .map(|(id, job)| (id.clone(), job.kind.clone()))
                .collect()
        };

        let mut runs = Vec::with_capacity(due.len());
        for (id, kind) in due {
            tracing::info!(job = %id, "Running job");
            let status = match execute(&kind, now).await {
                Ok(summary) => {
                    tracing::info!(job = %id, %summary, "Job finished");
                    JobStatus::Success { summary }
                }
                Err(e) => {
                    tracing::error!(job = %id, error = %e, "Job failed");
                    JobStatus::Failed {
                        error: e.to_string(),
                    }
                }
            };
            self.record(&id, now, &status).await;
            runs.push(JobRun { id, status });
        }
        runs
    }

    /// Run one job now, whether or not it is due
    pub async fn run_now(&self, id: &str, now: i64) -> Option<JobRun> {
        let kind = self.jobs.read().await.get(id).map(|job| job.kind.clone())?;
        let status = match execute(&kind, now).await {
            Ok(summary) => JobStatus::Success { summary },
            Err(e) => JobStatus::Failed {
                error: e.to_string(),
            },
        };
        self.record(id, now, &status).await;
        Some(JobRun {
            id: id.to_string(),
            status,
        })
    }

    async fn record(&self, id: &str, now: i64, status: &JobStatus) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return;
        };
        job.last_run = Some(now);
        job.last_status = Some(status.clone());
        match status {
            JobStatus::Success { .. } => {
                job.error_count = 0;
                job.next_run = Some(now.saturating_add(job.interval));
            }
            JobStatus::Failed { .. } => {
                job.error_count += 1;
                let backoff = (job.error_count as i64 * RETRY_STEP_MILLIS).min(MAX_RETRY_MILLIS);
                job.next_run = Some(now.saturating_add(backoff));
            }
        }
    }

    /// Start the scheduler background task
    pub fn start(self: Arc<Self>, tick: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();

        tokio::spawn(async move {
            *scheduler.running.write().await = true;

            let mut interval = tokio::time::interval(tick);

            loop {
                interval.tick().await;

                if !*scheduler.running.read().await {
                    break;
                }

                scheduler.run_due(Utc::now().timestamp_millis()).await;
            }
        })
    }

    /// Stop the scheduler
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute one job, returning a summary line
async fn execute(kind: &JobKind, now: i64) -> Result<String, JobError> {
    match kind {
        JobKind::Compression { table, after } => compress_eligible(table.clone(), now, *after).await,
        JobKind::Retention { table, drop_after } => {
            let table = table.clone();
            let cutoff = now.saturating_sub(*drop_after);
            let dropped = tokio::task::spawn_blocking(move || table.drop_chunks_before(cutoff)).await??;
            Ok(format!(
                "dropped {} chunk(s) before {}",
                dropped.len(),
                format_millis(cutoff)
            ))
        }
        JobKind::Refresh { aggregate } => {
            let aggregate = aggregate.clone();
            let outcome = tokio::task::spawn_blocking(move || aggregate.refresh(now)).await??;
            match outcome {
                RefreshOutcome::AlreadyRunning => Ok("refresh already running".to_string()),
                RefreshOutcome::Ran(report) if !report.failures.is_empty() => {
                    Err(JobError::Refresh(format!(
                        "{} of {} sub-range(s) failed, first: {}",
                        report.failures.len(),
                        report.failures.len() + report.ranges.len(),
                        report.failures[0].error
                    )))
                }
                RefreshOutcome::Ran(report) => Ok(format!(
                    "refreshed {} range(s), {} row(s), watermark {}",
                    report.ranges.len(),
                    report.rows_written,
                    report
                        .new_watermark
                        .map(format_millis)
                        .unwrap_or_else(|| "unset".to_string())
                )),
            }
        }
    }
}

/// Close ended chunks, then compress the eligible ones in parallel
async fn compress_eligible(table: Arc<Hypertable>, now: i64, after: i64) -> Result<String, JobError> {
    let candidates = {
        let table = table.clone();
        tokio::task::spawn_blocking(move || {
            table.close_chunks(now)?;
            table.compression_candidates(now, after)
        })
        .await??
    };

    let batch: Vec<u32> = candidates.into_iter().take(MAX_COMPRESS_PER_RUN).collect();
    let tasks = batch.iter().map(|&id| {
        let table = table.clone();
        tokio::task::spawn_blocking(move || (id, table.compress_chunk(id)))
    });

    let mut compressed = 0;
    let mut failed = Vec::new();
    for joined in join_all(tasks).await {
        let (id, result) = joined?;
        match result {
            Ok(CompressOutcome::Compressed(_)) => compressed += 1,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(table = %table.name(), chunk_id = id, error = %e, "Compression failed");
                failed.push(id);
            }
        }
    }

    if let Some(&first) = failed.first() {
        return Err(JobError::Storage(StorageError::Compression(format!(
            "{} of {} chunk(s) failed to compress, first chunk {}",
            failed.len(),
            batch.len(),
            first
        ))));
    }
    Ok(format!("compressed {} of {} chunk(s)", compressed, batch.len()))
}
