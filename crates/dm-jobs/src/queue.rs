//! Job queue: the hand-off between `submit` and the workers.
//!
//! `Local` is an in-process channel shared by every worker task. `Nats`
//! (feature `nats`) is a JetStream work queue, so workers can run in other
//! processes.

use dm_core::{DmError, DmResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Unit of work on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTask {
    pub job_id: String,
    pub file_id: String,
}

impl JobTask {
    pub fn to_bytes(&self) -> DmResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DmError::Queue(format!("serializing JobTask: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> DmResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| DmError::Queue(format!("deserializing JobTask: {e}")))
    }
}

/// A dequeued task. Must be acked once handled, or nak'd to ask for redelivery.
pub struct Delivery {
    pub task: JobTask,
    handle: Ack,
}

enum Ack {
    Local,
    #[cfg(feature = "nats")]
    Nats(crate::nats::JobMessage),
}

impl Delivery {
    pub async fn ack(self) -> DmResult<()> {
        match self.handle {
            Ack::Local => Ok(()),
            #[cfg(feature = "nats")]
            Ack::Nats(msg) => msg.ack().await,
        }
    }

    /// The in-process queue has no redelivery: a nak'd local task is dropped
    /// and its job stays inspectable in the repository.
    pub async fn nak(self) -> DmResult<()> {
        match self.handle {
            Ack::Local => {
                warn!(job_id = %self.task.job_id, "dropping nak'd job (no redelivery in-process)");
                Ok(())
            }
            #[cfg(feature = "nats")]
            Ack::Nats(msg) => msg.nak().await,
        }
    }
}

// ── Local ────────────────────────────────────────────────────────────────────

pub struct LocalQueue {
    tx: mpsc::UnboundedSender<JobTask>,
    rx: Mutex<mpsc::UnboundedReceiver<JobTask>>,
}

impl Default for LocalQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl LocalQueue {
    fn push(&self, task: JobTask) -> DmResult<()> {
        self.tx
            .send(task)
            .map_err(|_| DmError::Queue("local job queue is closed".into()))
    }

    async fn pop(&self, cancel: &CancellationToken) -> Option<JobTask> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            task = rx.recv() => task,
        }
    }

    async fn try_pop(&self) -> Option<JobTask> {
        self.rx.lock().await.try_recv().ok()
    }
}

// ── NATS ─────────────────────────────────────────────────────────────────────

#[cfg(feature = "nats")]
pub struct NatsQueue {
    client: crate::nats::NatsClient,
    messages: Mutex<Option<async_nats::jetstream::consumer::pull::Stream>>,
}

#[cfg(feature = "nats")]
impl NatsQueue {
    /// How long `try_next` waits before treating the stream as empty.
    const POLL: std::time::Duration = std::time::Duration::from_millis(250);

    pub async fn connect(url: &str) -> DmResult<Self> {
        let client = crate::nats::NatsClient::connect(url).await?;
        client.ensure_streams().await?;
        Ok(Self {
            client,
            messages: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &crate::nats::NatsClient {
        &self.client
    }

    async fn pop(&self) -> DmResult<Option<crate::nats::JobMessage>> {
        use futures::StreamExt;

        let mut guard = self.messages.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.job_stream().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Ok(None);
        };
        match stream.next().await {
            Some(Ok(msg)) => crate::nats::JobMessage::decode(msg).map(Some),
            Some(Err(e)) => Err(DmError::Queue(format!("receiving NATS message: {e}"))),
            None => Ok(None),
        }
    }
}

// ── JobQueue ─────────────────────────────────────────────────────────────────

/// Dispatch enum over the configured queue transport.
pub enum JobQueue {
    Local(LocalQueue),
    #[cfg(feature = "nats")]
    Nats(NatsQueue),
}

impl JobQueue {
    pub fn local() -> Self {
        JobQueue::Local(LocalQueue::default())
    }

    pub async fn enqueue(&self, task: JobTask) -> DmResult<()> {
        debug!(job_id = %task.job_id, "enqueue");
        match self {
            JobQueue::Local(q) => q.push(task),
            #[cfg(feature = "nats")]
            JobQueue::Nats(q) => q.client.publish_job(&task).await,
        }
    }

    /// Wait for the next task. `Ok(None)` once cancelled or the queue closes.
    pub async fn next(&self, cancel: &CancellationToken) -> DmResult<Option<Delivery>> {
        match self {
            JobQueue::Local(q) => Ok(q.pop(cancel).await.map(|task| Delivery {
                task,
                handle: Ack::Local,
            })),
            #[cfg(feature = "nats")]
            JobQueue::Nats(q) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Ok(None),
                    msg = q.pop() => Ok(msg?.map(nats_delivery)),
                }
            }
        }
    }

    /// Take a task only if one is already waiting.
    pub async fn try_next(&self) -> DmResult<Option<Delivery>> {
        match self {
            JobQueue::Local(q) => Ok(q.try_pop().await.map(|task| Delivery {
                task,
                handle: Ack::Local,
            })),
            #[cfg(feature = "nats")]
            JobQueue::Nats(q) => match tokio::time::timeout(NatsQueue::POLL, q.pop()).await {
                Ok(msg) => Ok(msg?.map(nats_delivery)),
                Err(_) => Ok(None),
            },
        }
    }
}

#[cfg(feature = "nats")]
fn nats_delivery(msg: crate::nats::JobMessage) -> Delivery {
    Delivery {
        task: msg.task.clone(),
        handle: Ack::Nats(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(n: u32) -> JobTask {
        JobTask {
            job_id: format!("job-{n}"),
            file_id: format!("file-{n}"),
        }
    }

    #[tokio::test]
    async fn local_queue_is_fifo() {
        let q = JobQueue::local();
        q.enqueue(task(1)).await.unwrap();
        q.enqueue(task(2)).await.unwrap();

        let cancel = CancellationToken::new();
        let first = q.next(&cancel).await.unwrap().unwrap();
        assert_eq!(first.task, task(1));
        first.ack().await.unwrap();

        let second = q.try_next().await.unwrap().unwrap();
        assert_eq!(second.task, task(2));
        assert!(q.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_returns_none_when_cancelled() {
        let q = JobQueue::local();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.next(&cancel).await.unwrap().is_none());
    }

    #[test]
    fn local_nak_drops_without_redelivery() {
        tokio_test::block_on(async {
            let q = JobQueue::local();
            q.enqueue(task(3)).await.unwrap();
            let d = q.try_next().await.unwrap().unwrap();
            tokio_test::assert_ok!(d.nak().await);
            assert!(q.try_next().await.unwrap().is_none());
        });
    }

    #[test]
    fn task_wire_shape() {
        let json = String::from_utf8(task(7).to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"jobId":"job-7","fileId":"file-7"}"#);
        assert_eq!(JobTask::from_bytes(json.as_bytes()).unwrap(), task(7));
        assert!(matches!(JobTask::from_bytes(b"{}"), Err(DmError::Queue(_))));
    }
}
