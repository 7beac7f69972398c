//! Destination-assignment workers.
//!
//! One pass over a job:
//!   - advance it to `in_progress`
//!   - every `needs_upload` item whose hash has since been committed becomes
//!     `deduplicated`; the rest get a destination and become `url_ready`
//!   - complete the job if every item is terminal
//!
//! Item updates are compare-and-set, so several workers may process the same
//! job concurrently and each item still moves exactly once. Assignment
//! failures are retried with exponential backoff; when the budget runs out
//! the fault is recorded on the job and `job:failed` is published.

use std::sync::Arc;
use std::time::Duration;

use dm_core::config::JobsConfig;
use dm_core::events::Notification;
use dm_core::types::{ItemStatus, Job, JobItem, JobStatus};
use dm_core::{DmError, DmResult};
use dm_store::Stores;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assign::DestinationAssigner;
use crate::notify::Notifier;
use crate::queue::{Delivery, JobQueue};

// ── RetryPolicy ──────────────────────────────────────────────────────────────

/// Bounds on the pause after consecutive queue read errors.
const QUEUE_BACKOFF_MIN: Duration = Duration::from_millis(50);
const QUEUE_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&JobsConfig::default())
    }
}

impl From<&JobsConfig> for RetryPolicy {
    fn from(c: &JobsConfig) -> Self {
        RetryPolicy {
            max_attempts: c.max_attempts.max(1),
            backoff: Duration::from_millis(c.backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }

    /// Pause after `failures` consecutive queue read errors.
    pub fn queue_delay(&self, failures: u32) -> Duration {
        self.delay(failures).clamp(QUEUE_BACKOFF_MIN, QUEUE_BACKOFF_MAX)
    }
}

// ── JobWorker ────────────────────────────────────────────────────────────────

pub struct JobWorker {
    stores: Stores,
    assigner: Arc<dyn DestinationAssigner>,
    notifier: Notifier,
    retry: RetryPolicy,
}

impl JobWorker {
    pub fn new(
        stores: Stores,
        assigner: Arc<dyn DestinationAssigner>,
        notifier: Notifier,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            stores,
            assigner,
            notifier,
            retry,
        }
    }

    /// One processing pass. Terminal items are never touched.
    pub async fn process(&self, job_id: &str) -> DmResult<Job> {
        let job = self
            .stores
            .jobs
            .get(job_id)?
            .ok_or_else(|| DmError::NotFound(format!("job {job_id}")))?;
        if job.status == JobStatus::Completed {
            return Ok(job);
        }

        if job.status < JobStatus::InProgress {
            self.stores.jobs.advance_status(job_id, JobStatus::InProgress)?;
            self.publish_status(job_id, JobStatus::InProgress).await;
        }

        let pending: Vec<&JobItem> = job
            .items
            .iter()
            .filter(|it| it.status == ItemStatus::NeedsUpload)
            .collect();
        let hashes: Vec<String> = pending.iter().map(|it| it.hash.clone()).collect();
        let verdicts = self.stores.hashes.check_existence(&hashes)?;

        for (item, verdict) in pending.into_iter().zip(verdicts) {
            let (next, url) = if verdict.exists {
                (ItemStatus::Deduplicated, None)
            } else {
                let url = self.assigner.assign(job_id, item).map_err(|e| {
                    DmError::JobTransientFailure {
                        job_id: job_id.to_string(),
                        reason: format!("assigning {}: {e}", item.id),
                    }
                })?;
                (ItemStatus::UrlReady, Some(url))
            };
            self.move_item(job_id, item, next, url).await?;
        }

        self.complete_if_done(job_id).await
    }

    /// [`process`](Self::process) under the retry policy.
    pub async fn run_with_retry(&self, job_id: &str) -> DmResult<Job> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.process(job_id).await {
                Ok(job) => return Ok(job),
                Err(e @ DmError::NotFound(_)) => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.retry.max_attempts {
                let reason = err.to_string();
                error!(job_id, attempts = attempt, error = %reason, "job faulted, retries exhausted");
                self.stores.jobs.record_fault(job_id, attempt, &reason)?;
                self.notifier
                    .publish(Notification::JobFailed {
                        job_id: job_id.to_string(),
                        error: reason.clone(),
                    })
                    .await;
                return Err(DmError::JobFault {
                    job_id: job_id.to_string(),
                    attempts: attempt,
                    reason,
                });
            }

            let delay = self.retry.delay(attempt);
            warn!(job_id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "job attempt failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn move_item(
        &self,
        job_id: &str,
        item: &JobItem,
        next: ItemStatus,
        upload_url: Option<String>,
    ) -> DmResult<()> {
        let won = self.stores.jobs.transition_item(
            job_id,
            &item.id,
            ItemStatus::NeedsUpload,
            next,
            upload_url.clone(),
        )?;
        if !won {
            debug!(job_id, item_id = %item.id, "item already moved by another worker");
            return Ok(());
        }
        self.notifier
            .publish(Notification::JobItemUpdate {
                job_id: job_id.to_string(),
                item_id: item.id.clone(),
                hash: item.hash.clone(),
                status: next,
                upload_url,
            })
            .await;
        Ok(())
    }

    async fn complete_if_done(&self, job_id: &str) -> DmResult<Job> {
        complete_if_done(&self.stores, &self.notifier, job_id).await
    }

    async fn publish_status(&self, job_id: &str, status: JobStatus) {
        self.notifier
            .publish(Notification::JobUpdate {
                job_id: job_id.to_string(),
                status,
            })
            .await;
    }
}

/// Complete `job_id` if every item is terminal, publishing `job:update` on
/// the transition. Shared with the commit path.
pub(crate) async fn complete_if_done(
    stores: &Stores,
    notifier: &Notifier,
    job_id: &str,
) -> DmResult<Job> {
    let job = stores
        .jobs
        .get(job_id)?
        .ok_or_else(|| DmError::NotFound(format!("job {job_id}")))?;
    if job.status == JobStatus::Completed || !job.all_terminal() {
        return Ok(job);
    }
    let job = stores.jobs.advance_status(job_id, JobStatus::Completed)?;
    info!(job_id, items = job.items.len(), "job completed");
    notifier
        .publish(Notification::JobUpdate {
            job_id: job_id.to_string(),
            status: JobStatus::Completed,
        })
        .await;
    Ok(job)
}

// ── WorkerPool ───────────────────────────────────────────────────────────────

/// Consumes the job queue with bounded concurrency.
#[derive(Clone)]
pub struct WorkerPool {
    worker: Arc<JobWorker>,
    queue: Arc<JobQueue>,
    concurrency: usize,
}

impl WorkerPool {
    /// `concurrency == 0` means one task per available CPU.
    pub fn new(worker: Arc<JobWorker>, queue: Arc<JobQueue>, concurrency: usize) -> Self {
        let concurrency = if concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            concurrency
        };
        Self {
            worker,
            queue,
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Process jobs until `cancel` fires, then wait for in-flight jobs.
    pub async fn run(&self, cancel: CancellationToken) -> DmResult<()> {
        info!(concurrency = self.concurrency, "worker pool ready");
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut queue_failures = 0u32;

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("worker: shutdown signal received, draining...");
                    break;
                }
                next = self.queue.next(&cancel) => {
                    match next {
                        Ok(Some(d)) => {
                            queue_failures = 0;
                            d
                        }
                        Ok(None) => break,
                        Err(e) => {
                            queue_failures = queue_failures.saturating_add(1);
                            let delay = self.worker.retry.queue_delay(queue_failures);
                            warn!(
                                failures = queue_failures,
                                delay_ms = delay.as_millis() as u64,
                                "error reading job queue: {e}"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(delay) => {}
                            }
                            continue;
                        }
                    }
                }
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DmError::Queue(format!("worker semaphore closed: {e}")))?;
            let worker = self.worker.clone();
            tokio::spawn(async move {
                let _permit = permit; // released when the job is handled
                handle(&worker, delivery).await;
            });
        }

        // Drain: wait for all in-flight jobs
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        info!("worker: all in-flight jobs complete");
        Ok(())
    }

    /// Process every job currently queued and return how many were handled.
    pub async fn drain(&self) -> DmResult<usize> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut handled = 0;

        while let Some(delivery) = self.queue.try_next().await? {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DmError::Queue(format!("worker semaphore closed: {e}")))?;
            let worker = self.worker.clone();
            tasks.spawn(async move {
                let _permit = permit;
                handle(&worker, delivery).await;
            });
            handled += 1;
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("worker task panicked: {e}");
            }
        }
        Ok(handled)
    }
}

/// Run one delivery to completion: ack when the job is done or its fault is
/// recorded, nak when the job could not even be examined.
async fn handle(worker: &JobWorker, delivery: Delivery) {
    let job_id = delivery.task.job_id.clone();
    let result = worker.run_with_retry(&job_id).await;

    let ack = match result {
        Ok(job) => {
            debug!(job_id, status = %job.status, "job processed");
            delivery.ack().await
        }
        Err(DmError::JobFault { .. }) => delivery.ack().await,
        Err(e @ DmError::NotFound(_)) => {
            warn!(job_id, "dropping queued job: {e}");
            delivery.ack().await
        }
        Err(e) => {
            error!(job_id, error = %e, "job processing failed, naking for redelivery");
            delivery.nak().await
        }
    };
    if let Err(e) = ack {
        warn!(job_id, "ack/nak failed: {e}");
    }
}
