//! Job registry, worker pool, timeouts, and job callbacks.
//!
//! Every submitted job reaches exactly one terminal state. The terminal
//! transition seals the job container, publishes the new state on the job's
//! watch channel, and fires its callback; all three happen once, under the
//! registry lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use irs_crawler::{CrawlReport, RecursiveCrawler};
use irs_registry::{CallbackEvent, CallbackNotifier, CallbackSubject, Collaborators, JobStore};
use irs_shared::{
    EngineConfig, GlobalAssetId, IrsError, ItemContainer, JobId, JobParameter, JobState, Result,
    SharedContainer,
};

use crate::job::{Job, JobRequest, JobView};

struct JobEntry {
    job: Job,
    container: SharedContainer,
    /// Final contents, set on the terminal transition.
    result: Option<ItemContainer>,
    state_tx: watch::Sender<JobState>,
    cancel: CancellationToken,
}

struct Inner {
    config: EngineConfig,
    crawler: RecursiveCrawler,
    notifier: Arc<dyn CallbackNotifier>,
    store: Arc<dyn JobStore>,
    workers: Arc<Semaphore>,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

/// How a running job ended, before it is mapped to a terminal state.
enum RunOutcome {
    Finished(CrawlReport),
    TimedOut,
    Cancelled,
}

/// Owns every job of the process. Cloning shares the same registry.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(config: EngineConfig, collaborators: Collaborators, store: Arc<dyn JobStore>) -> Self {
        let crawler = RecursiveCrawler::new(collaborators.clone(), store.clone(), config.per_job_fanout)
            .with_retry(config.retry);
        Self {
            inner: Arc::new(Inner {
                workers: Arc::new(Semaphore::new(config.worker_pool_size)),
                config,
                crawler,
                notifier: collaborators.notifier,
                store,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        self.inner.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        self.inner.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate and register a job in CREATED state without running it.
    pub fn create(&self, request: JobRequest) -> Result<JobId> {
        let job = Job::from_request(request, self.inner.config.default_job_timeout)?;
        let id = job.id.clone();
        info!(job_id = %id, root = %job.root_id, depth = job.parameter.depth, "job created");

        let (state_tx, _) = watch::channel(JobState::Created);
        self.write().insert(
            id.clone(),
            JobEntry {
                job,
                container: SharedContainer::new(),
                result: None,
                state_tx,
                cancel: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    /// Queue a CREATED job for the worker pool. It turns RUNNING once a worker
    /// is free.
    pub fn start(&self, id: &JobId) -> Result<()> {
        let (cancel, container) = {
            let jobs = self.read();
            let entry = jobs.get(id).ok_or_else(|| IrsError::JobNotFound(id.clone()))?;
            if entry.job.state != JobState::Created {
                return Err(IrsError::configuration(format!(
                    "job {id} is {} and cannot be started",
                    entry.job.state
                )));
            }
            (entry.cancel.clone(), entry.container.clone())
        };

        let this = self.clone();
        let job_id = id.clone();
        let span = info_span!("job", job_id = %id);
        tokio::spawn(async move { this.run(job_id, cancel, container).await }.instrument(span));
        Ok(())
    }

    /// Create and start in one step.
    pub fn submit(&self, request: JobRequest) -> Result<JobId> {
        let id = self.create(request)?;
        self.start(&id)?;
        Ok(id)
    }

    async fn run(&self, id: JobId, cancel: CancellationToken, container: SharedContainer) {
        let _permit = tokio::select! {
            permit = self.inner.workers.clone().acquire_owned() => permit,
            _ = cancel.cancelled() => {
                debug!("cancelled while queued");
                return;
            }
        };

        let Some((root, parameter, timeout)) = self.mark_running(&id) else {
            return;
        };
        info!(%root, timeout_secs = timeout.as_secs(), "job running");

        let crawl_cancel = cancel.child_token();
        let crawl = self
            .inner
            .crawler
            .crawl(&root, Arc::new(parameter), container, crawl_cancel.clone());
        tokio::pin!(crawl);

        let outcome = tokio::select! {
            report = &mut crawl => RunOutcome::Finished(report),
            _ = tokio::time::sleep(timeout) => RunOutcome::TimedOut,
            _ = cancel.cancelled() => RunOutcome::Cancelled,
        };

        if !matches!(outcome, RunOutcome::Finished(_)) {
            crawl_cancel.cancel();
            if tokio::time::timeout(self.inner.config.grace_period, &mut crawl)
                .await
                .is_err()
            {
                warn!(
                    grace_ms = self.inner.config.grace_period.as_millis(),
                    "crawl did not stop within the grace period"
                );
            }
        }

        let (state, reason) = match outcome {
            RunOutcome::Finished(report) if report.cancelled => {
                (JobState::Cancelled, Some("cancelled".to_string()))
            }
            RunOutcome::Finished(report) => match report.root_failure {
                Some(failure) => (
                    JobState::Error,
                    Some(format!("root shell lookup failed: {failure}")),
                ),
                None => (JobState::Completed, None),
            },
            RunOutcome::TimedOut => (
                JobState::Error,
                Some(format!("job timeout of {}s exceeded", timeout.as_secs())),
            ),
            RunOutcome::Cancelled => (JobState::Cancelled, Some("cancelled".to_string())),
        };
        self.finish(&id, state, reason).await;
    }

    /// CREATED -> RUNNING. `None` if the job left CREATED while queued.
    fn mark_running(&self, id: &JobId) -> Option<(GlobalAssetId, JobParameter, Duration)> {
        let mut jobs = self.write();
        let entry = jobs.get_mut(id)?;
        entry.job.transition(JobState::Running).ok()?;
        entry.state_tx.send_replace(JobState::Running);
        Some((
            entry.job.root_id.clone(),
            entry.job.parameter.clone(),
            entry.job.timeout,
        ))
    }

    /// Terminal transition: seal, publish, then notify and record edges.
    async fn finish(&self, id: &JobId, state: JobState, reason: Option<String>) {
        let (callback, result) = {
            let mut jobs = self.write();
            let Some(entry) = jobs.get_mut(id) else {
                return;
            };
            if let Err(e) = entry.job.transition(state) {
                debug!(error = %e, "terminal transition skipped");
                return;
            }
            entry.job.failure_reason = reason;
            let result = entry.container.seal();
            entry.result = Some(result.clone());
            entry.state_tx.send_replace(state);

            let summary = result.summary();
            info!(
                %state,
                shells = summary.shells,
                relationships = summary.relationships,
                tombstones = summary.tombstones,
                reason = entry.job.failure_reason.as_deref(),
                "job finished"
            );

            let callback = entry.job.callback_url.clone().map(|url| CallbackEvent {
                url,
                subject: CallbackSubject::Job(id.clone()),
                state: state.to_string(),
            });
            (callback, result)
        };

        if let Some(event) = callback {
            notify(self.inner.notifier.clone(), event);
        }
        if state == JobState::Completed && !result.relationships().is_empty() {
            if let Err(e) = self.inner.store.record_edges(result.relationships()).await {
                warn!(error = %e, "failed to record edges");
            }
        }
    }

    /// Cancel a job. Terminal jobs are left untouched; their state is returned.
    pub async fn cancel(&self, id: &JobId) -> Result<JobState> {
        let (state, cancel) = {
            let jobs = self.read();
            let entry = jobs.get(id).ok_or_else(|| IrsError::JobNotFound(id.clone()))?;
            (entry.job.state, entry.cancel.clone())
        };

        match state {
            s if s.is_terminal() => Ok(s),
            JobState::Created => {
                cancel.cancel();
                self.finish(id, JobState::Cancelled, Some("cancelled before start".into()))
                    .await;
                Ok(self.state(id)?)
            }
            _ => {
                info!(job_id = %id, "cancelling running job");
                cancel.cancel();
                Ok(JobState::Running)
            }
        }
    }

    /// Current state of a job.
    pub fn state(&self, id: &JobId) -> Result<JobState> {
        self.read()
            .get(id)
            .map(|entry| entry.job.state)
            .ok_or_else(|| IrsError::JobNotFound(id.clone()))
    }

    /// Snapshot of a job, including the container accumulated so far.
    pub fn get(&self, id: &JobId) -> Result<JobView> {
        let jobs = self.read();
        let entry = jobs.get(id).ok_or_else(|| IrsError::JobNotFound(id.clone()))?;
        Ok(view(entry))
    }

    /// Snapshots of every registered job, oldest first.
    pub fn list(&self) -> Vec<JobView> {
        let jobs = self.read();
        let mut views: Vec<JobView> = jobs.values().map(view).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Receiver of the job's state changes.
    pub fn watch_state(&self, id: &JobId) -> Result<watch::Receiver<JobState>> {
        self.read()
            .get(id)
            .map(|entry| entry.state_tx.subscribe())
            .ok_or_else(|| IrsError::JobNotFound(id.clone()))
    }

    /// Wait until the job is terminal and return its final view.
    pub async fn wait(&self, id: &JobId) -> Result<JobView> {
        let mut rx = self.watch_state(id)?;
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| IrsError::JobNotFound(id.clone()))?;
        self.get(id)
    }

    /// Drop terminal jobs that finished more than `max_age` ago.
    pub fn prune_terminal(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, entry| match entry.job.completed_at {
            Some(completed_at) => now.signed_duration_since(completed_at) < max_age,
            None => true,
        });
        let pruned = before - jobs.len();
        if pruned > 0 {
            info!(pruned, "pruned terminal jobs");
        }
        pruned
    }

    /// Drop terminal jobs older than the configured retention.
    pub fn prune_expired(&self) -> usize {
        self.prune_terminal(self.inner.config.terminal_job_retention)
    }

    pub(crate) fn notifier(&self) -> Arc<dyn CallbackNotifier> {
        self.inner.notifier.clone()
    }
}

fn view(entry: &JobEntry) -> JobView {
    let container = entry
        .result
        .clone()
        .unwrap_or_else(|| entry.container.snapshot());
    JobView::new(&entry.job, container)
}

/// Deliver a callback in the background; failures are logged, never retried.
pub(crate) fn notify(notifier: Arc<dyn CallbackNotifier>, event: CallbackEvent) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&event).await {
            warn!(url = %event.url, error = %e, "callback delivery failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use irs_registry::aspects::{SERIAL_PART, SINGLE_LEVEL_BOM_AS_BUILT};
    use irs_registry::{InMemoryRegistry, NoopJobStore, RecordingNotifier};
    use irs_shared::{Direction, ProcessStep, RelationshipEdge, RetryPolicy};
    use serde_json::json;

    fn id(n: u32) -> String {
        format!("urn:uuid:00000000-0000-0000-0000-{n:012}")
    }

    fn config() -> EngineConfig {
        EngineConfig {
            worker_pool_size: 2,
            per_job_fanout: 4,
            grace_period: Duration::from_secs(5),
            default_job_timeout: Duration::from_secs(3600),
            terminal_job_retention: Duration::from_secs(3600),
            retry: RetryPolicy::NONE,
        }
    }

    fn orchestrator(registry: InMemoryRegistry, notifier: RecordingNotifier) -> JobOrchestrator {
        JobOrchestrator::new(
            config(),
            Collaborators::stub(registry, notifier),
            Arc::new(NoopJobStore),
        )
    }

    fn tree() -> InMemoryRegistry {
        InMemoryRegistry::new()
            .with_part(&id(1), &[&id(2), &id(3)])
            .with_part(&id(2), &[])
            .with_part(&id(3), &[])
    }

    #[tokio::test]
    async fn job_completes_and_fires_one_callback() {
        let notifier = RecordingNotifier::new();
        let jobs = orchestrator(tree(), notifier.clone());
        let request = JobRequest::new(id(1), JobParameter::default())
            .with_callback("https://hostname.com/cb?id={jobId}&state={jobState}");

        let job_id = jobs.submit(request).unwrap();
        let view = jobs.wait(&job_id).await.unwrap();

        assert_eq!(view.state, JobState::Completed);
        assert_eq!(view.summary.shells, 3);
        assert_eq!(view.summary.relationships, 2);
        assert!(view.completed_at.is_some());

        tokio::task::yield_now().await;
        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].resolved_url(),
            format!("https://hostname.com/cb?id={job_id}&state=COMPLETED")
        );

        // terminal is final
        assert_eq!(jobs.cancel(&job_id).await.unwrap(), JobState::Completed);
        tokio::task::yield_now().await;
        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_creation() {
        let jobs = orchestrator(tree(), RecordingNotifier::new());
        let err = jobs
            .submit(JobRequest::new("urn:uuid:bogus", JobParameter::default()))
            .unwrap_err();
        assert!(matches!(err, IrsError::Configuration { .. }));
        assert!(jobs.list().is_empty());
    }

    #[tokio::test]
    async fn root_shell_failure_is_fatal() {
        let jobs = orchestrator(InMemoryRegistry::new().fail_shell(&id(1)), RecordingNotifier::new());
        let job_id = jobs.submit(JobRequest::new(id(1), JobParameter::default())).unwrap();
        let view = jobs.wait(&job_id).await.unwrap();

        assert_eq!(view.state, JobState::Error);
        assert!(view.failure_reason.unwrap().contains("root shell lookup failed"));
        let root = GlobalAssetId::from_payload(id(1));
        assert_eq!(view.container.tombstones_for(&root, ProcessStep::ShellRequest).count(), 1);
    }

    #[tokio::test]
    async fn created_job_can_be_cancelled() {
        let notifier = RecordingNotifier::new();
        let jobs = orchestrator(tree(), notifier.clone());
        let job_id = jobs
            .create(JobRequest::new(id(1), JobParameter::default()).with_callback("https://h/cb/{jobState}"))
            .unwrap();

        assert_eq!(jobs.cancel(&job_id).await.unwrap(), JobState::Cancelled);
        assert!(jobs.start(&job_id).is_err());
        let view = jobs.get(&job_id).unwrap();
        assert!(view.container.is_empty());

        tokio::task::yield_now().await;
        assert_eq!(notifier.events()[0].resolved_url(), "https://h/cb/CANCELLED");
    }

    #[tokio::test(start_paused = true)]
    async fn running_job_can_be_cancelled() {
        let registry = tree().with_latency(Duration::from_secs(10));
        let jobs = orchestrator(registry, RecordingNotifier::new());
        let job_id = jobs.submit(JobRequest::new(id(1), JobParameter::default())).unwrap();

        let mut rx = jobs.watch_state(&job_id).unwrap();
        rx.wait_for(|s| *s == JobState::Running).await.unwrap();
        assert_eq!(jobs.cancel(&job_id).await.unwrap(), JobState::Running);

        let view = jobs.wait(&job_id).await.unwrap();
        assert_eq!(view.state, JobState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_finished_descriptors() {
        // five aspects on the root, each fetch takes 1s after a 1s shell lookup
        let mut registry = InMemoryRegistry::new().with_latency(Duration::from_secs(1));
        for n in 0..5 {
            registry = registry.with_aspect(
                &id(1),
                &format!("urn:samm:io.catenax.part_{n}:1.0.0#Part{n}"),
                json!({ "catenaXId": id(1) }),
            );
        }
        let jobs = orchestrator(registry, RecordingNotifier::new());
        let parameter = JobParameter {
            collect_aspects: true,
            ..JobParameter::default()
        };
        let request = JobRequest::new(id(1), parameter).with_timeout(Duration::from_millis(4500));

        let started = tokio::time::Instant::now();
        let job_id = jobs.submit(request).unwrap();
        let view = jobs.wait(&job_id).await.unwrap();

        assert_eq!(view.state, JobState::Error);
        assert!(view.failure_reason.unwrap().contains("timeout"));
        assert_eq!(view.summary.submodels, 3);
        assert!(view.container.tombstones().is_empty());
        assert!(started.elapsed() <= Duration::from_millis(4500) + config().grace_period);

        // late writes are discarded
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(jobs.get(&job_id).unwrap().summary.submodels, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_pool_queues_excess_jobs() {
        let registry = tree().with_latency(Duration::from_secs(1));
        let jobs = orchestrator(registry, RecordingNotifier::new());
        let ids: Vec<JobId> = (0..3)
            .map(|_| jobs.submit(JobRequest::new(id(1), JobParameter::default())).unwrap())
            .collect();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let states: Vec<JobState> = ids.iter().map(|j| jobs.state(j).unwrap()).collect();
        assert_eq!(states.iter().filter(|s| **s == JobState::Running).count(), 2);
        assert_eq!(states.iter().filter(|s| **s == JobState::Created).count(), 1);

        for job_id in &ids {
            assert_eq!(jobs.wait(job_id).await.unwrap().state, JobState::Completed);
        }
    }

    #[tokio::test]
    async fn prune_removes_only_terminal_jobs() {
        let jobs = orchestrator(tree(), RecordingNotifier::new());
        let done = jobs.submit(JobRequest::new(id(1), JobParameter::default())).unwrap();
        jobs.wait(&done).await.unwrap();
        let pending = jobs.create(JobRequest::new(id(1), JobParameter::default())).unwrap();

        assert_eq!(jobs.prune_expired(), 0);
        assert_eq!(jobs.prune_terminal(Duration::ZERO), 1);
        assert!(matches!(jobs.get(&done), Err(IrsError::JobNotFound(_))));
        assert!(jobs.get(&pending).is_ok());
    }

    struct RecordingStore(std::sync::Mutex<Vec<RelationshipEdge>>);

    #[async_trait::async_trait]
    impl JobStore for RecordingStore {
        async fn known_subtree(
            &self,
            _root: &GlobalAssetId,
            _max_depth: u32,
            _direction: Direction,
        ) -> Result<Vec<RelationshipEdge>> {
            Ok(Vec::new())
        }

        async fn record_edges(&self, edges: &[RelationshipEdge]) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(edges);
            Ok(())
        }
    }

    #[tokio::test]
    async fn completed_jobs_feed_the_store() {
        let store = Arc::new(RecordingStore(std::sync::Mutex::new(Vec::new())));
        let registry = tree().with_aspect(&id(2), SERIAL_PART, json!({}));
        let jobs = JobOrchestrator::new(
            config(),
            Collaborators::stub(registry, RecordingNotifier::new()),
            store.clone(),
        );
        let job_id = jobs.submit(JobRequest::new(id(1), JobParameter::default())).unwrap();
        jobs.wait(&job_id).await.unwrap();

        // recording happens right after the state is published
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let recorded = store.0.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|e| e.aspect_type == irs_shared::aspect_name(SINGLE_LEVEL_BOM_AS_BUILT)));
    }
}
