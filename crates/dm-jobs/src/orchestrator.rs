//! Submission, commit and metadata-patch flows over the stores.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dm_core::api::{
    ChunkVerdict, CommitRequest, CommitResponse, JobSummary, SubmitRequest, SubmitResponse,
};
use dm_core::events::Notification;
use dm_core::types::{FilePatch, FileRecord, HashEntry, ItemStatus, Job, JobStatus, NewJobItem};
use dm_core::{now_secs, DmError, DmResult};
use dm_store::Stores;
use tracing::{debug, error, info, warn};

use crate::notify::Notifier;
use crate::queue::{JobQueue, JobTask};
use crate::worker::complete_if_done;

#[derive(Clone)]
pub struct Orchestrator {
    stores: Stores,
    queue: Arc<JobQueue>,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(stores: Stores, queue: Arc<JobQueue>, notifier: Notifier) -> Self {
        Self {
            stores,
            queue,
            notifier,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Catalog a file and create its job from the dedup verdicts.
    ///
    /// The request is fully validated before anything is written. The job
    /// is enqueued for destination assignment; its summary in the response
    /// is the state at creation (`pending`).
    pub async fn submit(
        &self,
        request: SubmitRequest,
        owner_id: Option<String>,
    ) -> DmResult<SubmitResponse> {
        let new_file = request.into_new_file(owner_id)?;
        let hashes: Vec<String> = new_file.chunks.iter().map(|c| c.hash.clone()).collect();
        let verdicts = self.stores.hashes.check_existence(&hashes)?;

        let file = self.stores.files.create(new_file)?;
        let items: Vec<NewJobItem> = verdicts
            .iter()
            .map(|v| NewJobItem {
                hash: v.hash.clone(),
                status: if v.exists {
                    ItemStatus::Deduplicated
                } else {
                    ItemStatus::NeedsUpload
                },
            })
            .collect();
        let job = match self.stores.jobs.create(&file.id, items) {
            Ok(job) => job,
            Err(e) => {
                // a file without a job would never be processed
                if let Err(undo) = self.stores.files.remove(&file.id) {
                    error!(file_id = %file.id, "could not remove file after job creation failed: {undo}");
                }
                return Err(e);
            }
        };

        let jobs: Vec<ChunkVerdict> = job
            .items
            .iter()
            .map(|it| ChunkVerdict {
                hash: it.hash.clone(),
                status: it.status,
                upload_url: it.upload_url.clone(),
            })
            .collect();

        info!(
            file_id = %file.id,
            job_id = %job.id,
            chunks = job.items.len(),
            deduplicated = job.count(ItemStatus::Deduplicated),
            "file submitted"
        );

        self.notifier
            .publish(Notification::JobReady {
                file_id: file.id.clone(),
                job_id: job.id.clone(),
                jobs: jobs.clone(),
            })
            .await;

        // The file and job are durable at this point; a queue failure leaves
        // the job pending and visible rather than failing the submission.
        if let Err(e) = self
            .queue
            .enqueue(JobTask {
                job_id: job.id.clone(),
                file_id: file.id.clone(),
            })
            .await
        {
            warn!(job_id = %job.id, "enqueue failed, job left pending: {e}");
        }

        Ok(SubmitResponse {
            file_id: file.id,
            file_name: file.file_name,
            file_size: file.file_size,
            jobs,
            job: Some(JobSummary {
                id: job.id,
                status: job.status,
            }),
        })
    }

    /// Record uploaded chunks: bump refcounts, move matching `url_ready`
    /// items to `uploaded`, and complete jobs that are now fully terminal.
    pub async fn commit(&self, request: CommitRequest) -> DmResult<CommitResponse> {
        let hashes = request.normalized_hashes()?;
        self.stores.hashes.commit(&hashes)?;

        let mut touched = BTreeSet::new();
        let unique: BTreeSet<&String> = hashes.iter().collect();
        for hash in unique {
            for (job_id, item) in self.stores.jobs.open_items_with_hash(hash)? {
                if item.status != ItemStatus::UrlReady {
                    continue;
                }
                let won = self.stores.jobs.transition_item(
                    &job_id,
                    &item.id,
                    ItemStatus::UrlReady,
                    ItemStatus::Uploaded,
                    None,
                )?;
                if won {
                    self.notifier
                        .publish(Notification::JobItemUpdate {
                            job_id: job_id.clone(),
                            item_id: item.id,
                            hash: item.hash,
                            status: ItemStatus::Uploaded,
                            upload_url: item.upload_url,
                        })
                        .await;
                    touched.insert(job_id);
                }
            }
        }

        for job_id in &touched {
            complete_if_done(&self.stores, &self.notifier, job_id).await?;
        }

        debug!(count = hashes.len(), jobs = touched.len(), "hashes committed");
        self.notifier
            .publish(Notification::HashesCommitted {
                count: hashes.len(),
            })
            .await;

        Ok(CommitResponse {
            ok: true,
            committed: hashes.len(),
        })
    }

    /// Report jobs whose `url_ready` items have waited longer than
    /// `deadline` for an upload commit. Each is faulted once with
    /// `job:failed`; the items stay `url_ready` so a late commit still lands.
    pub async fn fault_stalled(&self, deadline: Duration) -> DmResult<Vec<String>> {
        let now = now_secs();
        let mut faulted = Vec::new();
        for job in self.stores.jobs.list()? {
            if job.status == JobStatus::Completed || job.last_error.is_some() {
                continue;
            }
            let waiting = job.count(ItemStatus::UrlReady);
            if waiting == 0 || now.saturating_sub(job.created_at) < deadline.as_secs() {
                continue;
            }
            let reason = format!(
                "{waiting} item(s) awaiting upload commit for over {}s",
                deadline.as_secs()
            );
            warn!(job_id = %job.id, waiting, "upload commit overdue");
            self.stores.jobs.record_fault(&job.id, job.attempts, &reason)?;
            self.notifier
                .publish(Notification::JobFailed {
                    job_id: job.id.clone(),
                    error: reason,
                })
                .await;
            faulted.push(job.id);
        }
        Ok(faulted)
    }

    /// Patch a file's mutable metadata.
    ///
    /// Identity is established by the caller; this only checks that
    /// `requester` matches the recorded owner when there is one.
    pub async fn patch_file(
        &self,
        file_id: &str,
        patch: FilePatch,
        requester: Option<&str>,
    ) -> DmResult<FileRecord> {
        let file = self.get_file(file_id)?;
        if let Some(owner) = file.owner_id.as_deref() {
            if requester != Some(owner) {
                return Err(DmError::OwnershipViolation(format!(
                    "file {file_id} belongs to another owner"
                )));
            }
        }
        let updated = self
            .stores
            .files
            .patch(file_id, &patch)?
            .ok_or_else(|| DmError::NotFound(format!("file {file_id}")))?;
        info!(file_id, note = updated.note.as_deref(), "file metadata patched");
        Ok(updated)
    }

    // ── Read side ────────────────────────────────────────────────────────────

    pub fn get_file(&self, file_id: &str) -> DmResult<FileRecord> {
        self.stores
            .files
            .get(file_id)?
            .ok_or_else(|| DmError::NotFound(format!("file {file_id}")))
    }

    pub fn list_files(&self) -> DmResult<Vec<FileRecord>> {
        self.stores.files.list()
    }

    pub fn list_hashes(&self) -> DmResult<Vec<HashEntry>> {
        self.stores.hashes.list_all()
    }

    pub fn get_job(&self, job_id: &str) -> DmResult<Job> {
        self.stores
            .jobs
            .get(job_id)?
            .ok_or_else(|| DmError::NotFound(format!("job {job_id}")))
    }

    pub fn list_jobs(&self) -> DmResult<Vec<Job>> {
        self.stores.jobs.list()
    }

    /// The job created for `file_id`, if any.
    pub fn job_for_file(&self, file_id: &str) -> DmResult<Option<Job>> {
        Ok(self
            .stores
            .jobs
            .list()?
            .into_iter()
            .find(|j| j.file_id == file_id))
    }
}
