//! Batch orders: request validation, partitioning, strategy, and views.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use irs_shared::{BatchId, GlobalAssetId, IrsError, JobId, JobParameter, JobState, OrderId, Result};

use crate::job::validate_callback_url;

pub const MIN_BATCH_SIZE: usize = 10;
pub const MAX_BATCH_SIZE: usize = 100;
pub const MIN_ORDER_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_ORDER_TIMEOUT: Duration = Duration::from_secs(24 * 3600);
pub const MIN_JOB_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_JOB_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// When batches are handed to the job orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchRelease {
    /// Batch n+1 starts once every job of batch n is terminal.
    #[default]
    Sequential,
    /// Every batch starts at once.
    Parallel,
}

/// Which callbacks an order fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackMode {
    /// One callback for the whole order.
    #[default]
    OnOrderCompletion,
    /// One callback per finished batch.
    PerBatch,
}

/// What happens to the order's jobs when the order timeout elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderTimeoutPolicy {
    /// Every job that is not terminal is cancelled.
    #[default]
    CancelOutstanding,
    /// Jobs never started are cancelled; running jobs finish under their own timeout.
    DetachRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStrategy {
    pub release: BatchRelease,
    pub callback: CallbackMode,
    pub on_timeout: OrderTimeoutPolicy,
}

impl BatchStrategy {
    pub fn preserve_batch_job_order() -> Self {
        Self {
            release: BatchRelease::Sequential,
            ..Self::default()
        }
    }

    pub fn maximize_throughput() -> Self {
        Self {
            release: BatchRelease::Parallel,
            ..Self::default()
        }
    }

    pub fn with_callback(mut self, callback: CallbackMode) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_timeout_policy(mut self, on_timeout: OrderTimeoutPolicy) -> Self {
        self.on_timeout = on_timeout;
        self
    }
}

// ---------------------------------------------------------------------------
// Processing state
// ---------------------------------------------------------------------------

/// Lifecycle state of an order or one of its batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Initialized,
    Processing,
    /// Every job completed.
    Completed,
    /// Some jobs completed, others failed or were cancelled.
    Partial,
    Error,
    Cancelled,
}

impl ProcessingState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Initialized | Self::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Aggregate terminal job states.
    pub fn from_jobs(states: impl IntoIterator<Item = JobState>) -> Self {
        let (mut total, mut completed, mut cancelled) = (0usize, 0usize, 0usize);
        for state in states {
            total += 1;
            match state {
                JobState::Completed => completed += 1,
                JobState::Cancelled => cancelled += 1,
                _ => {}
            }
        }
        if total == 0 || completed == total {
            Self::Completed
        } else if cancelled == total {
            Self::Cancelled
        } else if completed > 0 {
            Self::Partial
        } else {
            Self::Error
        }
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// What a caller submits to crawl many roots at once.
#[derive(Debug, Clone)]
pub struct BatchOrderRequest {
    pub root_ids: Vec<String>,
    pub parameter: JobParameter,
    pub batch_size: usize,
    pub order_timeout: Duration,
    pub job_timeout: Duration,
    pub strategy: BatchStrategy,
    /// Callback URL template for the order or its batches.
    pub callback_url: Option<String>,
}

impl BatchOrderRequest {
    pub fn new(root_ids: impl IntoIterator<Item = impl Into<String>>, parameter: JobParameter) -> Self {
        Self {
            root_ids: root_ids.into_iter().map(Into::into).collect(),
            parameter,
            batch_size: MIN_BATCH_SIZE,
            order_timeout: Duration::from_secs(3600),
            job_timeout: Duration::from_secs(1800),
            strategy: BatchStrategy::default(),
            callback_url: None,
        }
    }

    /// Check every bound and return the distinct root ids in submission order.
    pub fn validate(&self) -> Result<Vec<GlobalAssetId>> {
        if self.root_ids.is_empty() {
            return Err(IrsError::configuration("batch order needs at least one root id"));
        }
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(IrsError::configuration(format!(
                "batch size {} out of range [{MIN_BATCH_SIZE}, {MAX_BATCH_SIZE}]",
                self.batch_size
            )));
        }
        check_range("order timeout", self.order_timeout, MIN_ORDER_TIMEOUT, MAX_ORDER_TIMEOUT)?;
        check_range("job timeout", self.job_timeout, MIN_JOB_TIMEOUT, MAX_JOB_TIMEOUT)?;
        self.parameter.validate()?;
        if let Some(url) = &self.callback_url {
            validate_callback_url(url)?;
        }

        let mut seen = HashSet::with_capacity(self.root_ids.len());
        let mut roots = Vec::with_capacity(self.root_ids.len());
        for raw in &self.root_ids {
            let id = GlobalAssetId::parse(raw.as_str())?;
            if seen.insert(id.clone()) {
                roots.push(id);
            }
        }
        Ok(roots)
    }
}

fn check_range(what: &str, value: Duration, min: Duration, max: Duration) -> Result<()> {
    if value < min || value > max {
        return Err(IrsError::configuration(format!(
            "{what} of {}s out of range [{}s, {}s]",
            value.as_secs(),
            min.as_secs(),
            max.as_secs()
        )));
    }
    Ok(())
}

/// Split `roots` into consecutive chunks of at most `batch_size`.
pub fn partition(roots: &[GlobalAssetId], batch_size: usize) -> Vec<Vec<GlobalAssetId>> {
    roots.chunks(batch_size.max(1)).map(<[_]>::to_vec).collect()
}

// ---------------------------------------------------------------------------
// Records and views
// ---------------------------------------------------------------------------

/// One job of a batch with its last known state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub job_id: JobId,
    pub root_id: GlobalAssetId,
    pub state: JobState,
}

#[derive(Debug, Clone)]
pub(crate) struct Batch {
    pub id: BatchId,
    pub number: usize,
    pub state: ProcessingState,
    pub jobs: Vec<BatchJob>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub(crate) struct BatchOrder {
    pub id: OrderId,
    pub state: ProcessingState,
    pub strategy: BatchStrategy,
    pub batch_size: usize,
    pub order_timeout: Duration,
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub batches: Vec<Batch>,
}

/// Snapshot of one batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchView {
    pub id: BatchId,
    pub number: usize,
    pub state: ProcessingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub jobs: Vec<BatchJob>,
}

impl BatchView {
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|job| job.state == state).count()
    }
}

impl From<&Batch> for BatchView {
    fn from(batch: &Batch) -> Self {
        Self {
            id: batch.id.clone(),
            number: batch.number,
            state: batch.state,
            started_at: batch.started_at,
            completed_at: batch.completed_at,
            jobs: batch.jobs.clone(),
        }
    }
}

/// Snapshot of a batch order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOrderView {
    pub id: OrderId,
    pub state: ProcessingState,
    pub strategy: BatchStrategy,
    pub batch_size: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub total_jobs: usize,
    pub batches: Vec<BatchView>,
}

impl BatchOrderView {
    /// Jobs of every batch that are in `state`.
    pub fn count(&self, state: JobState) -> usize {
        self.batches.iter().map(|batch| batch.count(state)).sum()
    }
}

impl From<&BatchOrder> for BatchOrderView {
    fn from(order: &BatchOrder) -> Self {
        let batches: Vec<BatchView> = order.batches.iter().map(BatchView::from).collect();
        Self {
            id: order.id.clone(),
            state: order.state,
            strategy: order.strategy,
            batch_size: order.batch_size,
            created_at: order.created_at,
            completed_at: order.completed_at,
            failure_reason: order.failure_reason.clone(),
            total_jobs: batches.iter().map(|b| b.jobs.len()).sum(),
            batches,
        }
    }
}
