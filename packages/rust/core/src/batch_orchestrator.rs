//! Batch order registry and driver.
//!
//! An order's jobs are all created up front in CREATED state. The driver
//! releases them batch by batch (or all at once), closes each batch when its
//! last job is terminal, and closes the order when every batch is closed, the
//! order timeout elapses, or the order is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use irs_registry::{CallbackEvent, CallbackSubject};
use irs_shared::{BatchId, IrsError, JobId, JobState, OrderId, Result};

use crate::batch::{
    Batch, BatchJob, BatchOrder, BatchOrderRequest, BatchOrderView, BatchRelease, BatchStrategy,
    BatchView, CallbackMode, OrderTimeoutPolicy, ProcessingState, partition,
};
use crate::job::JobRequest;
use crate::orchestrator::{JobOrchestrator, notify};

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for batch order execution.
pub trait ProgressReporter: Send + Sync {
    /// A batch was handed to the job orchestrator.
    fn batch_released(&self, number: usize, total_batches: usize);
    /// A job of a released batch reached a terminal state.
    fn job_finished(&self, done: usize, total: usize);
    /// The order was closed.
    fn done(&self, order: &BatchOrderView);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn batch_released(&self, _number: usize, _total_batches: usize) {}
    fn job_finished(&self, _done: usize, _total: usize) {}
    fn done(&self, _order: &BatchOrderView) {}
}

// ---------------------------------------------------------------------------
// BatchOrderOrchestrator
// ---------------------------------------------------------------------------

struct OrderEntry {
    order: BatchOrder,
    state_tx: watch::Sender<ProcessingState>,
    cancel: CancellationToken,
}

struct Inner {
    jobs: JobOrchestrator,
    orders: RwLock<HashMap<OrderId, OrderEntry>>,
}

/// Why the driver stopped releasing batches early.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    TimedOut(OrderTimeoutPolicy),
    Cancelled,
}

/// Owns every batch order of the process. Cloning shares the same registry.
#[derive(Clone)]
pub struct BatchOrderOrchestrator {
    inner: Arc<Inner>,
}

/// Shared job counter of one order run.
struct Tally {
    done: AtomicUsize,
    total: usize,
    progress: Arc<dyn ProgressReporter>,
}

impl BatchOrderOrchestrator {
    pub fn new(jobs: JobOrchestrator) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs,
                orders: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<OrderId, OrderEntry>> {
        self.inner.orders.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<OrderId, OrderEntry>> {
        self.inner.orders.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate, partition, create every job, and start driving the order.
    pub fn submit(
        &self,
        request: BatchOrderRequest,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<OrderId> {
        let roots = request.validate()?;
        let order_id = OrderId::new();

        let mut batches = Vec::new();
        for (index, chunk) in partition(&roots, request.batch_size).into_iter().enumerate() {
            let mut jobs = Vec::with_capacity(chunk.len());
            for root in chunk {
                let job_request = JobRequest::new(root.as_str(), request.parameter.clone())
                    .with_timeout(request.job_timeout);
                let job_id = self.inner.jobs.create(job_request)?;
                jobs.push(BatchJob {
                    job_id,
                    root_id: root,
                    state: JobState::Created,
                });
            }
            batches.push(Batch {
                id: BatchId::new(),
                number: index + 1,
                state: ProcessingState::Initialized,
                jobs,
                started_at: None,
                completed_at: None,
            });
        }

        info!(
            %order_id,
            roots = roots.len(),
            batches = batches.len(),
            release = ?request.strategy.release,
            "batch order created"
        );

        let cancel = CancellationToken::new();
        let (state_tx, _) = watch::channel(ProcessingState::Initialized);
        self.write().insert(
            order_id.clone(),
            OrderEntry {
                order: BatchOrder {
                    id: order_id.clone(),
                    state: ProcessingState::Initialized,
                    strategy: request.strategy,
                    batch_size: request.batch_size,
                    order_timeout: request.order_timeout,
                    callback_url: request.callback_url,
                    created_at: Utc::now(),
                    completed_at: None,
                    failure_reason: None,
                    batches,
                },
                state_tx,
                cancel: cancel.clone(),
            },
        );

        let this = self.clone();
        let id = order_id.clone();
        tokio::spawn(async move { this.drive(id, cancel, progress).await });
        Ok(order_id)
    }

    #[instrument(skip_all, fields(order_id = %order_id))]
    async fn drive(&self, order_id: OrderId, cancel: CancellationToken, progress: Arc<dyn ProgressReporter>) {
        let Some((strategy, timeout, total)) = self.begin(&order_id) else {
            return;
        };
        let tally = Arc::new(Tally {
            done: AtomicUsize::new(0),
            total,
            progress: progress.clone(),
        });

        let interrupt = tokio::select! {
            _ = self.release(&order_id, strategy.release, tally) => None,
            _ = tokio::time::sleep(timeout) => Some(Interrupt::TimedOut(strategy.on_timeout)),
            _ = cancel.cancelled() => Some(Interrupt::Cancelled),
        };

        if let Some(interrupt) = interrupt {
            warn!(?interrupt, "batch order interrupted");
            self.interrupt(&order_id, interrupt).await;
        }

        // Batches not closed by the release loop are closed once their jobs settle.
        for (index, job_ids) in self.batch_jobs(&order_id).into_iter().enumerate() {
            for job_id in &job_ids {
                let _ = self.inner.jobs.wait(job_id).await;
            }
            self.close_batch(&order_id, index);
        }

        let reason = match interrupt {
            Some(Interrupt::TimedOut(_)) => Some(format!(
                "order timeout of {}s exceeded",
                timeout.as_secs()
            )),
            Some(Interrupt::Cancelled) => Some("cancelled".to_string()),
            None => None,
        };
        if let Some(view) = self.close_order(&order_id, interrupt, reason) {
            progress.done(&view);
        }
    }

    /// INITIALIZED -> PROCESSING. Returns strategy, timeout, and job count.
    fn begin(&self, order_id: &OrderId) -> Option<(BatchStrategy, Duration, usize)> {
        let mut orders = self.write();
        let entry = orders.get_mut(order_id)?;
        if entry.order.state != ProcessingState::Initialized {
            return None;
        }
        entry.order.state = ProcessingState::Processing;
        entry.state_tx.send_replace(ProcessingState::Processing);
        let total = entry.order.batches.iter().map(|b| b.jobs.len()).sum();
        Some((entry.order.strategy, entry.order.order_timeout, total))
    }

    fn batch_jobs(&self, order_id: &OrderId) -> Vec<Vec<JobId>> {
        self.read()
            .get(order_id)
            .map(|entry| {
                entry
                    .order
                    .batches
                    .iter()
                    .map(|batch| batch.jobs.iter().map(|job| job.job_id.clone()).collect())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Release batches per `mode` and close each one as it finishes.
    async fn release(&self, order_id: &OrderId, mode: BatchRelease, tally: Arc<Tally>) {
        let batches = self.batch_jobs(order_id);
        let total_batches = batches.len();

        match mode {
            BatchRelease::Sequential => {
                for (index, job_ids) in batches.into_iter().enumerate() {
                    self.release_batch(order_id, index, &job_ids);
                    tally.progress.batch_released(index + 1, total_batches);
                    self.await_jobs(&job_ids, &tally).await;
                    self.close_batch(order_id, index);
                }
            }
            BatchRelease::Parallel => {
                let mut waiters = JoinSet::new();
                for (index, job_ids) in batches.into_iter().enumerate() {
                    self.release_batch(order_id, index, &job_ids);
                    tally.progress.batch_released(index + 1, total_batches);

                    let this = self.clone();
                    let order_id = order_id.clone();
                    let tally = tally.clone();
                    waiters.spawn(async move {
                        this.await_jobs(&job_ids, &tally).await;
                        this.close_batch(&order_id, index);
                    });
                }
                while waiters.join_next().await.is_some() {}
            }
        }
    }

    fn release_batch(&self, order_id: &OrderId, index: usize, job_ids: &[JobId]) {
        if let Some(batch) = self
            .write()
            .get_mut(order_id)
            .and_then(|entry| entry.order.batches.get_mut(index))
        {
            batch.state = ProcessingState::Processing;
            batch.started_at = Some(Utc::now());
        }
        debug!(batch = index + 1, jobs = job_ids.len(), "releasing batch");
        for job_id in job_ids {
            if let Err(e) = self.inner.jobs.start(job_id) {
                debug!(%job_id, error = %e, "job not started");
            }
        }
    }

    async fn await_jobs(&self, job_ids: &[JobId], tally: &Tally) {
        for job_id in job_ids {
            let _ = self.inner.jobs.wait(job_id).await;
            let done = tally.done.fetch_add(1, Ordering::SeqCst) + 1;
            tally.progress.job_finished(done, tally.total);
        }
    }

    async fn interrupt(&self, order_id: &OrderId, interrupt: Interrupt) {
        let cancel_running = !matches!(
            interrupt,
            Interrupt::TimedOut(OrderTimeoutPolicy::DetachRunning)
        );
        for job_id in self.batch_jobs(order_id).into_iter().flatten() {
            let state = match self.inner.jobs.state(&job_id) {
                Ok(state) => state,
                Err(_) => continue,
            };
            let cancel = match state {
                JobState::Created => true,
                JobState::Running => cancel_running,
                _ => false,
            };
            if !cancel {
                continue;
            }
            if let Err(e) = self.inner.jobs.cancel(&job_id).await {
                debug!(%job_id, error = %e, "cancel failed");
            }
        }
    }

    /// Close one batch from its jobs' states. Closing twice is a no-op.
    fn close_batch(&self, order_id: &OrderId, index: usize) {
        let job_ids: Vec<JobId> = self.batch_jobs(order_id).into_iter().nth(index).unwrap_or_default();
        let states: Vec<Option<JobState>> = job_ids
            .iter()
            .map(|job_id| self.inner.jobs.state(job_id).ok())
            .collect();

        let event = {
            let mut orders = self.write();
            let Some(entry) = orders.get_mut(order_id) else {
                return;
            };
            let callback_url = entry.order.callback_url.clone();
            let per_batch = entry.order.strategy.callback == CallbackMode::PerBatch;
            let Some(batch) = entry.order.batches.get_mut(index) else {
                return;
            };
            if batch.state.is_terminal() {
                return;
            }
            for (job, state) in batch.jobs.iter_mut().zip(states) {
                if let Some(state) = state {
                    job.state = state;
                }
            }
            batch.state = ProcessingState::from_jobs(batch.jobs.iter().map(|job| job.state));
            batch.completed_at = Some(Utc::now());
            info!(batch = batch.number, state = %batch.state, "batch closed");

            callback_url.filter(|_| per_batch).map(|url| CallbackEvent {
                url,
                subject: CallbackSubject::Batch {
                    order_id: order_id.clone(),
                    batch_id: batch.id.clone(),
                },
                state: batch.state.to_string(),
            })
        };

        if let Some(event) = event {
            notify(self.inner.jobs.notifier(), event);
        }
    }

    fn close_order(
        &self,
        order_id: &OrderId,
        interrupt: Option<Interrupt>,
        reason: Option<String>,
    ) -> Option<BatchOrderView> {
        let (view, event) = {
            let mut orders = self.write();
            let entry = orders.get_mut(order_id)?;
            let order = &mut entry.order;
            order.state = match interrupt {
                Some(Interrupt::TimedOut(_)) => ProcessingState::Error,
                Some(Interrupt::Cancelled) => ProcessingState::Cancelled,
                None => ProcessingState::from_jobs(
                    order.batches.iter().flat_map(|b| b.jobs.iter().map(|job| job.state)),
                ),
            };
            order.failure_reason = reason;
            order.completed_at = Some(Utc::now());
            entry.state_tx.send_replace(order.state);
            info!(state = %order.state, reason = order.failure_reason.as_deref(), "batch order closed");

            let event = order
                .callback_url
                .clone()
                .filter(|_| order.strategy.callback == CallbackMode::OnOrderCompletion)
                .map(|url| CallbackEvent {
                    url,
                    subject: CallbackSubject::Order(order_id.clone()),
                    state: order.state.to_string(),
                });
            (BatchOrderView::from(&*order), event)
        };

        if let Some(event) = event {
            notify(self.inner.jobs.notifier(), event);
        }
        Some(view)
    }

    /// Snapshot of an order with current job states.
    pub fn get_order(&self, order_id: &OrderId) -> Result<BatchOrderView> {
        let mut view = {
            let orders = self.read();
            let entry = orders
                .get(order_id)
                .ok_or_else(|| IrsError::OrderNotFound(order_id.clone()))?;
            BatchOrderView::from(&entry.order)
        };
        for job in view.batches.iter_mut().flat_map(|b| b.jobs.iter_mut()) {
            if let Ok(state) = self.inner.jobs.state(&job.job_id) {
                job.state = state;
            }
        }
        Ok(view)
    }

    /// Snapshot of one batch of an order.
    pub fn get_batch(&self, order_id: &OrderId, batch_id: &BatchId) -> Result<BatchView> {
        self.get_order(order_id)?
            .batches
            .into_iter()
            .find(|batch| &batch.id == batch_id)
            .ok_or_else(|| IrsError::NotFound(format!("batch {batch_id} of order {order_id}")))
    }

    /// Cancel every outstanding job and close the order as CANCELLED.
    ///
    /// Returns the state at the time of the call; a closed order is left as is.
    pub fn cancel_order(&self, order_id: &OrderId) -> Result<ProcessingState> {
        let orders = self.read();
        let entry = orders
            .get(order_id)
            .ok_or_else(|| IrsError::OrderNotFound(order_id.clone()))?;
        if !entry.order.state.is_terminal() {
            info!(%order_id, "cancelling batch order");
            entry.cancel.cancel();
        }
        Ok(entry.order.state)
    }

    /// Wait until the order is closed and return its final view.
    pub async fn wait_order(&self, order_id: &OrderId) -> Result<BatchOrderView> {
        let mut rx = self
            .read()
            .get(order_id)
            .map(|entry| entry.state_tx.subscribe())
            .ok_or_else(|| IrsError::OrderNotFound(order_id.clone()))?;
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| IrsError::OrderNotFound(order_id.clone()))?;
        self.get_order(order_id)
    }

    /// Drop closed orders that finished more than `max_age` ago.
    pub fn prune_terminal(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut orders = self.write();
        let before = orders.len();
        orders.retain(|_, entry| match entry.order.completed_at {
            Some(completed_at) => now.signed_duration_since(completed_at) < max_age,
            None => true,
        });
        before - orders.len()
    }
}
