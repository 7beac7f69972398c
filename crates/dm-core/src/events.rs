//! Notifications emitted to observers.
//!
//! Nothing inside the workspace consumes these; they exist for the pub/sub
//! transport in front of the orchestrator. The JSON shape is
//! `{"type": "<event>", ...camelCase fields}`.

use serde::{Deserialize, Serialize};

use crate::api::ChunkVerdict;
use crate::error::{DmError, DmResult};
use crate::types::{ItemStatus, JobStatus};

/// Subject prefix used when events travel over NATS.
pub const SUBJECT_PREFIX: &str = "DM.events";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    /// A file was catalogued and its job created.
    #[serde(rename = "job_ready", rename_all = "camelCase")]
    JobReady {
        file_id: String,
        job_id: String,
        jobs: Vec<ChunkVerdict>,
    },
    #[serde(rename = "hashes_committed", rename_all = "camelCase")]
    HashesCommitted { count: usize },
    #[serde(rename = "job:update", rename_all = "camelCase")]
    JobUpdate { job_id: String, status: JobStatus },
    #[serde(rename = "job:item:update", rename_all = "camelCase")]
    JobItemUpdate {
        job_id: String,
        item_id: String,
        hash: String,
        status: ItemStatus,
        upload_url: Option<String>,
    },
    /// Retries exhausted. The job stays in its last non-completed status.
    #[serde(rename = "job:failed", rename_all = "camelCase")]
    JobFailed { job_id: String, error: String },
}

impl Notification {
    pub fn event_type(&self) -> &'static str {
        match self {
            Notification::JobReady { .. } => "job_ready",
            Notification::HashesCommitted { .. } => "hashes_committed",
            Notification::JobUpdate { .. } => "job:update",
            Notification::JobItemUpdate { .. } => "job:item:update",
            Notification::JobFailed { .. } => "job:failed",
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Notification::JobReady { job_id, .. }
            | Notification::JobUpdate { job_id, .. }
            | Notification::JobItemUpdate { job_id, .. }
            | Notification::JobFailed { job_id, .. } => Some(job_id),
            Notification::HashesCommitted { .. } => None,
        }
    }

    /// NATS subject: `DM.events.<event type with ':' mapped to '.'>`
    pub fn subject(&self) -> String {
        format!("{SUBJECT_PREFIX}.{}", self.event_type().replace(':', "."))
    }

    pub fn to_bytes(&self) -> DmResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DmError::Queue(format!("serializing notification: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> DmResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| DmError::Queue(format!("deserializing notification: {e}")))
    }
}
