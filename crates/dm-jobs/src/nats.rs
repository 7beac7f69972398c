//! NATS JetStream transport for jobs and notifications.
//!
//! Streams:
//!   DM_JOBS    job ids awaiting destination assignment (work queue; scaled workers consume)
//!   DM_EVENTS  notifications, hierarchical subjects `DM.events.{type}`
//!
//! Requires feature `nats` (async-nats optional dep).

#[cfg(feature = "nats")]
pub use inner::*;

#[cfg(feature = "nats")]
mod inner {
    use async_nats::jetstream::{self, consumer::pull, stream};
    use dm_core::events::{Notification, SUBJECT_PREFIX};
    use dm_core::{DmError, DmResult};
    use std::time::Duration;
    use tracing::{debug, info};

    use crate::queue::JobTask;

    // ── Stream / consumer names ───────────────────────────────────────────────

    pub const STREAM_JOBS: &str = "DM_JOBS";
    pub const SUBJECT_JOBS: &str = "DM.jobs";
    pub const STREAM_EVENTS: &str = "DM_EVENTS";
    pub const CONSUMER_WORKERS: &str = "dm-workers";

    fn queue_err(context: &str, e: impl std::fmt::Display) -> DmError {
        DmError::Queue(format!("{context}: {e}"))
    }

    // ── NatsClient ────────────────────────────────────────────────────────────

    /// Thin wrapper around an async-nats JetStream context.
    #[derive(Clone)]
    pub struct NatsClient {
        js: jetstream::Context,
    }

    impl NatsClient {
        /// Connect to NATS and return a client with JetStream enabled.
        pub async fn connect(url: &str) -> DmResult<Self> {
            let client = async_nats::connect(url)
                .await
                .map_err(|e| queue_err(&format!("connecting to NATS at {url}"), e))?;
            info!("NATS: connected to {url}");
            Ok(NatsClient {
                js: jetstream::new(client),
            })
        }

        /// Ensure both streams exist (idempotent).
        pub async fn ensure_streams(&self) -> DmResult<()> {
            self.js
                .get_or_create_stream(stream::Config {
                    name: STREAM_JOBS.to_string(),
                    subjects: vec![SUBJECT_JOBS.to_string()],
                    max_messages: 1_000_000,
                    max_age: Duration::from_secs(7 * 24 * 3600),
                    retention: stream::RetentionPolicy::WorkQueue,
                    ..Default::default()
                })
                .await
                .map_err(|e| queue_err("ensuring DM_JOBS stream", e))?;

            // fan-out to any number of observers, 1-day TTL
            self.js
                .get_or_create_stream(stream::Config {
                    name: STREAM_EVENTS.to_string(),
                    subjects: vec![format!("{SUBJECT_PREFIX}.>")],
                    max_messages: 500_000,
                    max_age: Duration::from_secs(24 * 3600),
                    retention: stream::RetentionPolicy::Limits,
                    storage: stream::StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(|e| queue_err("ensuring DM_EVENTS stream", e))?;

            info!("NATS: streams verified (DM_JOBS, DM_EVENTS)");
            Ok(())
        }

        /// Publish a job to DM_JOBS and wait for the server ack.
        pub async fn publish_job(&self, task: &JobTask) -> DmResult<()> {
            self.js
                .publish(SUBJECT_JOBS, bytes::Bytes::from(task.to_bytes()?))
                .await
                .map_err(|e| queue_err("publishing to DM_JOBS", e))?
                .await
                .map_err(|e| queue_err("awaiting NATS publish ack", e))?;
            debug!(job_id = %task.job_id, "job queued");
            Ok(())
        }

        pub async fn publish_event(&self, event: &Notification) -> DmResult<()> {
            self.js
                .publish(event.subject(), bytes::Bytes::from(event.to_bytes()?))
                .await
                .map_err(|e| queue_err("publishing event", e))?
                .await
                .map_err(|e| queue_err("awaiting event ack", e))?;
            debug!(event_type = event.event_type(), "event published");
            Ok(())
        }

        /// Open the durable pull consumer shared by every worker.
        ///
        /// Redelivery after `ack_wait` covers workers that die mid-job; the
        /// worker's own retry budget covers assignment failures.
        pub async fn job_stream(&self) -> DmResult<pull::Stream> {
            let consumer: jetstream::consumer::Consumer<pull::Config> = self
                .js
                .create_consumer_on_stream(
                    pull::Config {
                        durable_name: Some(CONSUMER_WORKERS.to_string()),
                        ack_wait: Duration::from_secs(60),
                        max_deliver: 3,
                        ..Default::default()
                    },
                    STREAM_JOBS,
                )
                .await
                .map_err(|e| queue_err("creating dm-workers consumer", e))?;

            consumer
                .messages()
                .await
                .map_err(|e| queue_err("opening pull consumer message stream", e))
        }
    }

    // ── JobMessage ────────────────────────────────────────────────────────────

    /// A deserialized job task + the underlying NATS message (for ack/nak).
    pub struct JobMessage {
        pub task: JobTask,
        pub(crate) msg: jetstream::Message,
    }

    impl JobMessage {
        pub(crate) fn decode(msg: jetstream::Message) -> DmResult<Self> {
            let task = JobTask::from_bytes(&msg.payload)?;
            Ok(JobMessage { task, msg })
        }

        /// Acknowledge processing; removes the message from the queue.
        pub async fn ack(self) -> DmResult<()> {
            self.msg.ack().await.map_err(|e| queue_err("acking NATS message", e))
        }

        /// Negative-acknowledge; the message will be redelivered.
        pub async fn nak(self) -> DmResult<()> {
            self.msg
                .ack_with(jetstream::AckKind::Nak(None))
                .await
                .map_err(|e| queue_err("naking NATS message", e))
        }
    }
}
