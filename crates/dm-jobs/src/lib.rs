//! dm-jobs: job orchestration for drivemerge
//!
//! ```text
//! submit ──► FileCatalog + JobRepository ──► JobQueue ──► WorkerPool
//!    │                                                        │
//!    └─ job_ready                 job:update / job:item:update ┘
//! commit ──► HashStore, url_ready → uploaded, job completion ──► hashes_committed
//! ```

pub mod assign;
pub mod nats;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod worker;

use std::sync::Arc;

use dm_core::config::{JobsConfig, QueueKind};
use dm_core::DmResult;
use dm_store::Stores;

pub use assign::{DestinationAssigner, UrlTemplateAssigner};
pub use notify::Notifier;
pub use orchestrator::Orchestrator;
pub use queue::{Delivery, JobQueue, JobTask};
pub use worker::{JobWorker, RetryPolicy, WorkerPool};

#[cfg(feature = "nats")]
pub use nats::NatsClient;

/// Orchestrator and worker pool wired to the same stores, queue and notifier.
pub struct Runtime {
    pub orchestrator: Orchestrator,
    pub workers: WorkerPool,
}

impl Runtime {
    pub fn new(
        stores: Stores,
        queue: JobQueue,
        notifier: Notifier,
        assigner: Arc<dyn DestinationAssigner>,
        config: &JobsConfig,
    ) -> Self {
        let queue = Arc::new(queue);
        let worker = Arc::new(JobWorker::new(
            stores.clone(),
            assigner,
            notifier.clone(),
            RetryPolicy::from(config),
        ));
        Runtime {
            orchestrator: Orchestrator::new(stores, queue.clone(), notifier),
            workers: WorkerPool::new(worker, queue, config.workers),
        }
    }

    /// Build from config: the configured queue transport, URL-template
    /// assignment, and a log notifier (plus NATS events when the queue is NATS).
    pub async fn from_config(stores: Stores, config: &JobsConfig) -> DmResult<Self> {
        let assigner = Arc::new(UrlTemplateAssigner::new(config.upload_base.clone())?);
        let (queue, notifier) = match config.queue {
            QueueKind::Local => (JobQueue::local(), Notifier::Log),
            #[cfg(feature = "nats")]
            QueueKind::Nats => {
                let q = queue::NatsQueue::connect(&config.nats_url).await?;
                let notifier =
                    Notifier::Fanout(vec![Notifier::Log, Notifier::Nats(q.client().clone())]);
                (JobQueue::Nats(q), notifier)
            }
            #[cfg(not(feature = "nats"))]
            QueueKind::Nats => {
                tracing::warn!(
                    nats_url = %config.nats_url,
                    "NATS not compiled in (missing 'nats' feature), falling back to local queue"
                );
                (JobQueue::local(), Notifier::Log)
            }
        };
        Ok(Self::new(stores, queue, notifier, assigner, config))
    }
}
