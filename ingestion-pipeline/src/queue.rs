use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use common::{
    error::{AppError, ErrorClass},
    storage::{
        db::SurrealDbClient,
        types::{
            dead_letter::DeadLetterRecord,
            submission::ResourceSubmission,
            work_item::{WorkItem, WorkItemState},
        },
    },
    utils::config::AppConfig,
};
use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::IngestionPipeline;

#[derive(Debug, Clone, Copy)]
pub struct QueueTuning {
    pub capacity: usize,
    pub worker_count: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub drain_timeout: Duration,
    /// Bounded wait for admission before reporting queue_full; zero rejects
    /// immediately.
    pub submit_wait: Duration,
}

impl QueueTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            capacity: config.queue_capacity.max(1),
            worker_count: config.worker_count.max(2),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_secs(config.retry_base_delay_s),
            retry_max_delay: Duration::from_secs(config.retry_max_delay_s),
            drain_timeout: Duration::from_secs(config.drain_timeout_s),
            submit_wait: Duration::from_millis(config.submit_wait_ms),
        }
    }
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            capacity: 1000,
            worker_count: 2,
            max_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),
            submit_wait: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct QueueMetrics {
    completed: AtomicU64,
    duplicates: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Snapshot for the queue stats endpoint. Journal counts are authoritative;
/// the counters are process-lifetime totals.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub pending: usize,
    pub in_flight: usize,
    pub retry_scheduled: usize,
    pub dead_letter_count: usize,
    pub completed: u64,
    pub duplicates: u64,
}

/// Bounded FIFO work queue over a journaled item table. Admission is limited
/// by channel capacity; every state transition is journaled before it takes
/// effect, so a crash never loses an accepted submission. Workers process
/// items at-least-once; the idempotent chunk upsert makes replays safe.
pub struct IngestionQueue {
    db: Arc<SurrealDbClient>,
    pipeline: Arc<IngestionPipeline>,
    tuning: QueueTuning,
    tx: mpsc::Sender<String>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
    metrics: QueueMetrics,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionQueue {
    pub fn new(
        db: Arc<SurrealDbClient>,
        pipeline: Arc<IngestionPipeline>,
        tuning: QueueTuning,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(tuning.capacity);
        Arc::new(Self {
            db,
            pipeline,
            tuning,
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown: CancellationToken::new(),
            metrics: QueueMetrics::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Admit a validated submission: journal it, then hand its id to the
    /// worker channel. Fails fast with `QueueFull` under backpressure.
    pub async fn submit(&self, submission: ResourceSubmission) -> Result<String, AppError> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::QueueFull);
        }

        let permit = if self.tuning.submit_wait.is_zero() {
            self.tx.try_reserve().map_err(|err| match err {
                mpsc::error::TrySendError::Full(()) => AppError::QueueFull,
                mpsc::error::TrySendError::Closed(()) => {
                    AppError::InternalError("queue channel closed".to_string())
                }
            })?
        } else {
            tokio::time::timeout(self.tuning.submit_wait, self.tx.reserve())
                .await
                .map_err(|_| AppError::QueueFull)?
                .map_err(|_| AppError::InternalError("queue channel closed".to_string()))?
        };

        // Journal before the item becomes runnable; an accepted submission
        // survives a crash from this point on.
        let item = WorkItem::new(submission).enqueue(&self.db).await?;
        let item_id = item.id.clone();
        permit.send(item.id);

        debug!(%item_id, "submission journaled and enqueued");
        Ok(item_id)
    }

    /// Spawn the worker pool. Call once after construction.
    pub async fn start(self: &Arc<Self>) {
        let receiver = {
            let mut slot = self.rx.lock().await;
            slot.take()
        };
        let Some(receiver) = receiver else {
            warn!("worker pool already started");
            return;
        };
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = self.workers.lock().await;
        for n in 0..self.tuning.worker_count {
            let queue = Arc::clone(self);
            let receiver = Arc::clone(&receiver);
            let worker_id = format!("ingestion-worker-{n}-{}", Uuid::new_v4());

            workers.push(tokio::spawn(async move {
                info!(%worker_id, "worker started");
                loop {
                    let next = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            () = queue.shutdown.cancelled() => None,
                            item = rx.recv() => item,
                        }
                    };

                    let Some(item_id) = next else {
                        break;
                    };
                    queue.process_item(&worker_id, item_id).await;
                }
                info!(%worker_id, "worker stopped");
            }));
        }
    }

    /// Reload journaled work after a restart: pending and interrupted items
    /// re-enter the channel, scheduled retries get their timers back.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, AppError> {
        let items = WorkItem::unfinished(&self.db).await?;
        let recovered = items.len();
        if recovered == 0 {
            return Ok(0);
        }

        info!(items = recovered, "recovering journaled work items");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            for item in items {
                match item.state {
                    WorkItemState::Pending => queue.requeue_now(item.id).await,
                    WorkItemState::InFlight { .. } => {
                        // The previous lease holder is gone; reset and replay.
                        if let Err(err) = WorkItem::mark_pending(&item.id, &queue.db).await {
                            error!(item_id = %item.id, error = %err, "failed to reset in-flight item");
                            continue;
                        }
                        queue.requeue_now(item.id).await;
                    }
                    WorkItemState::RetryScheduled { next_attempt_at } => {
                        let delay = (next_attempt_at - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        queue.spawn_requeue_timer(item.id, delay);
                    }
                }
            }
        });

        Ok(recovered)
    }

    /// Stop admission, let in-flight workers finish their current item within
    /// the drain timeout, then return. Undrained items stay journaled for the
    /// next run.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }

        let drain = async {
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(error = %err, "worker task join failed");
                }
            }
        };

        if tokio::time::timeout(self.tuning.drain_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.tuning.drain_timeout,
                "drain timeout elapsed; abandoning remaining workers"
            );
        }
    }

    pub async fn stats(&self) -> Result<QueueStatsSnapshot, AppError> {
        let counts = WorkItem::counts(&self.db).await?;
        let dead_letter_count = DeadLetterRecord::count(&self.db).await?;

        Ok(QueueStatsSnapshot {
            pending: counts.pending,
            in_flight: counts.in_flight,
            retry_scheduled: counts.retry_scheduled,
            dead_letter_count,
            completed: self.metrics.completed.load(Ordering::Relaxed),
            duplicates: self.metrics.duplicates.load(Ordering::Relaxed),
        })
    }

    async fn process_item(self: &Arc<Self>, worker_id: &str, item_id: String) {
        let item = match WorkItem::load(&item_id, &self.db).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!(%item_id, "journaled item vanished before processing");
                return;
            }
            Err(err) => {
                // Leave the journal row alone; restart recovery will replay it.
                error!(%item_id, error = %err, "failed to load work item");
                return;
            }
        };

        if let Err(err) = WorkItem::mark_in_flight(&item_id, worker_id, &self.db).await {
            error!(%item_id, error = %err, "failed to lease work item");
            return;
        }

        match self.pipeline.process(&item.submission).await {
            Ok(report) => {
                if report.overwrote_existing {
                    self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = WorkItem::complete(&item_id, &self.db).await {
                    error!(%item_id, error = %err, "failed to finalize completed item");
                }
            }
            Err(err) => self.handle_failure(item, &err).await,
        }
    }

    async fn handle_failure(self: &Arc<Self>, item: WorkItem, err: &AppError) {
        let class = err.classify();
        let message = err.to_string();

        match class {
            ErrorClass::Duplicate => {
                // Chunks are already present; idempotent semantics say done.
                debug!(item_id = %item.id, "duplicate upsert treated as success");
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = WorkItem::complete(&item.id, &self.db).await {
                    error!(item_id = %item.id, error = %err, "failed to finalize duplicate item");
                }
            }
            ErrorClass::Retryable => {
                let failures = item.retry_count.saturating_add(1);
                if failures >= self.tuning.max_retries {
                    self.dead_letter(item, failures, ErrorClass::MaxRetries, &message)
                        .await;
                } else {
                    let delay = self.backoff_delay(failures.saturating_sub(1));
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    warn!(
                        item_id = %item.id,
                        attempt = failures,
                        delay = ?delay,
                        error = %message,
                        "retryable failure; backing off"
                    );
                    if let Err(err) = WorkItem::schedule_retry(
                        &item.id,
                        failures,
                        next_attempt_at,
                        &message,
                        &self.db,
                    )
                    .await
                    {
                        error!(item_id = %item.id, error = %err, "failed to journal retry");
                        return;
                    }
                    self.spawn_requeue_timer(item.id, delay);
                }
            }
            ErrorClass::Validation => {
                self.dead_letter(item, 0, ErrorClass::Validation, &message)
                    .await;
            }
            _ => {
                let retry_count = item.retry_count;
                self.dead_letter(item, retry_count, ErrorClass::Fatal, &message)
                    .await;
            }
        }
    }

    async fn dead_letter(
        &self,
        mut item: WorkItem,
        retry_count: u32,
        class: ErrorClass,
        message: &str,
    ) {
        item.retry_count = retry_count;
        warn!(
            item_id = %item.id,
            resource_id = %item.submission.resource_id,
            %class,
            error = %message,
            "dead-lettering work item"
        );
        if let Err(err) = DeadLetterRecord::record_and_remove(&item, class, message, &self.db).await
        {
            error!(item_id = %item.id, error = %err, "failed to write dead-letter record");
            return;
        }
        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn spawn_requeue_timer(self: &Arc<Self>, item_id: String, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = queue.shutdown.cancelled() => {
                    debug!(%item_id, "retry timer cancelled by shutdown");
                }
                () = tokio::time::sleep(delay) => {
                    queue.requeue_now(item_id).await;
                }
            }
        });
    }

    async fn requeue_now(&self, item_id: String) {
        if let Err(err) = WorkItem::mark_pending(&item_id, &self.db).await {
            error!(%item_id, error = %err, "failed to mark item pending");
            return;
        }
        if self.tx.send(item_id.clone()).await.is_err() {
            warn!(%item_id, "queue channel closed; item stays journaled");
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.tuning
            .retry_base_delay
            .checked_mul(factor)
            .map_or(self.tuning.retry_max_delay, |delay| {
                delay.min(self.tuning.retry_max_delay)
            })
    }
}
