//! A single crawl job: request, record, and read-only view.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use irs_shared::{
    ContainerSummary, GlobalAssetId, IrsError, ItemContainer, JobId, JobParameter, JobState, Result,
};

/// What a caller submits to run one crawl.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Root global asset id, validated on submission.
    pub root_id: String,
    pub parameter: JobParameter,
    /// Callback URL template, fired once on the terminal transition.
    pub callback_url: Option<String>,
    /// Wall-clock limit; the engine default when unset.
    pub timeout: Option<Duration>,
}

impl JobRequest {
    pub fn new(root_id: impl Into<String>, parameter: JobParameter) -> Self {
        Self {
            root_id: root_id.into(),
            parameter,
            callback_url: None,
            timeout: None,
        }
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Reject a malformed callback URL template.
///
/// Placeholders such as `{jobId}` are legal in the template, so it is checked
/// with sample values filled in.
pub(crate) fn validate_callback_url(template: &str) -> Result<()> {
    let sample = template
        .replace("{jobId}", "0")
        .replace("{jobState}", "COMPLETED")
        .replace("{orderId}", "0")
        .replace("{orderState}", "COMPLETED")
        .replace("{batchId}", "0")
        .replace("{batchState}", "COMPLETED");
    let url = Url::parse(&sample)
        .map_err(|e| IrsError::configuration(format!("invalid callback url '{template}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(IrsError::configuration(format!(
            "callback url '{template}' must use http or https"
        )));
    }
    Ok(())
}

/// Registry record of one job. Owned by the job orchestrator.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: JobId,
    pub root_id: GlobalAssetId,
    pub parameter: JobParameter,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub timeout: Duration,
    pub callback_url: Option<String>,
}

impl Job {
    /// Validate `request` and build a CREATED job.
    pub fn from_request(request: JobRequest, default_timeout: Duration) -> Result<Self> {
        let root_id = GlobalAssetId::parse(request.root_id)?;
        request.parameter.validate()?;
        if let Some(url) = &request.callback_url {
            validate_callback_url(url)?;
        }
        let timeout = request.timeout.unwrap_or(default_timeout);
        if timeout.is_zero() {
            return Err(IrsError::configuration("job timeout must be positive"));
        }

        Ok(Self {
            id: JobId::new(),
            root_id,
            parameter: request.parameter,
            state: JobState::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
            timeout,
            callback_url: request.callback_url,
        })
    }

    /// Apply a state-machine transition, stamping timestamps.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(IrsError::configuration(format!(
                "job {} cannot go from {} to {next}",
                self.id, self.state
            )));
        }
        self.state = next;
        match next {
            JobState::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }
}

/// Snapshot of a job as returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub root_id: GlobalAssetId,
    pub state: JobState,
    pub parameter: JobParameter,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Top-level reason of an ERROR or CANCELLED job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub summary: ContainerSummary,
    pub container: ItemContainer,
}

impl JobView {
    pub(crate) fn new(job: &Job, container: ItemContainer) -> Self {
        Self {
            id: job.id.clone(),
            root_id: job.root_id.clone(),
            state: job.state,
            parameter: job.parameter.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            failure_reason: job.failure_reason.clone(),
            summary: container.summary(),
            container,
        }
    }
}
