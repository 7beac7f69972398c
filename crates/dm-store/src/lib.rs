//! dm-store: persistent state behind the orchestrator
//!
//! Three repositories, each a trait with two interchangeable backends:
//!   - [`HashStore`]: content-addressed dedup index (hash → refcount)
//!   - [`FileCatalog`]: file records, immutable except for patchable metadata
//!   - [`JobRepository`]: upload jobs and their per-chunk items
//!
//! The in-memory backend is always available. The RocksDB backend is behind
//! the `rocksdb` feature. [`Stores`] bundles one of each, selected from config.

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use std::path::Path;
use std::sync::Arc;

use dm_core::config::StoreBackendKind;
use dm_core::types::{
    FilePatch, FileRecord, HashEntry, HashVerdict, ItemStatus, Job, JobId, JobItem, JobStatus,
    NewFile, NewJobItem,
};
use dm_core::{DmError, DmResult};

pub use memory::{MemoryCatalog, MemoryHashStore, MemoryJobRepository};
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;

/// Owner-agnostic dedup index keyed by plaintext SHA-256.
pub trait HashStore: Send + Sync {
    /// One verdict per input hash, in input order. Duplicates are answered
    /// consistently.
    fn check_existence(&self, hashes: &[String]) -> DmResult<Vec<HashVerdict>>;

    /// Increment the refcount of every hash, creating entries at 1.
    /// Additive: repeated and concurrent commits simply accumulate.
    fn commit(&self, hashes: &[String]) -> DmResult<()>;

    fn get(&self, hash: &str) -> DmResult<Option<HashEntry>>;

    /// All entries, sorted by hash.
    fn list_all(&self) -> DmResult<Vec<HashEntry>>;
}

pub trait FileCatalog: Send + Sync {
    /// Assign an id, timestamp, and store the chunk list verbatim.
    fn create(&self, new: NewFile) -> DmResult<FileRecord>;

    fn get(&self, id: &str) -> DmResult<Option<FileRecord>>;

    /// All files, oldest first.
    fn list(&self) -> DmResult<Vec<FileRecord>>;

    /// Apply the mutable subset of fields. `None` if the file does not exist.
    /// No identity check happens here.
    fn patch(&self, id: &str, patch: &FilePatch) -> DmResult<Option<FileRecord>>;

    /// Delete a record. Only used to undo a submission whose job could not
    /// be created. `false` if the file did not exist.
    fn remove(&self, id: &str) -> DmResult<bool>;
}

pub trait JobRepository: Send + Sync {
    /// Create a `pending` job with one item per entry, in order.
    fn create(&self, file_id: &str, items: Vec<NewJobItem>) -> DmResult<Job>;

    fn get(&self, id: &str) -> DmResult<Option<Job>>;

    /// All jobs, oldest first.
    fn list(&self) -> DmResult<Vec<Job>>;

    /// Move the job forward to `next`. Moving backwards is a no-op.
    fn advance_status(&self, id: &str, next: JobStatus) -> DmResult<Job>;

    /// Compare-and-set one item's status. Returns `false` (and changes
    /// nothing) when the item is no longer in `expected`.
    fn transition_item(
        &self,
        job_id: &str,
        item_id: &str,
        expected: ItemStatus,
        next: ItemStatus,
        upload_url: Option<String>,
    ) -> DmResult<bool>;

    /// Record a processing fault: attempt count and last error.
    fn record_fault(&self, id: &str, attempts: u32, error: &str) -> DmResult<Job>;

    /// Non-terminal items, across all jobs, that refer to `hash`.
    ///
    /// Served from a hash index that gains an entry when a non-terminal item
    /// is created and loses it when the item reaches a terminal status, so
    /// the cost tracks open items rather than job history.
    fn open_items_with_hash(&self, hash: &str) -> DmResult<Vec<(JobId, JobItem)>>;
}

/// One of each repository, shared across the orchestrator and workers.
#[derive(Clone)]
pub struct Stores {
    pub hashes: Arc<dyn HashStore>,
    pub files: Arc<dyn FileCatalog>,
    pub jobs: Arc<dyn JobRepository>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Stores {
            hashes: Arc::new(MemoryHashStore::default()),
            files: Arc::new(MemoryCatalog::default()),
            jobs: Arc::new(MemoryJobRepository::default()),
        }
    }

    /// Open the configured backend. `path` is only used by RocksDB.
    pub fn open(backend: StoreBackendKind, path: &Path) -> DmResult<Self> {
        match backend {
            StoreBackendKind::Memory => Ok(Self::in_memory()),
            #[cfg(feature = "rocksdb")]
            StoreBackendKind::Rocksdb => {
                let db = Arc::new(RocksStore::open(path)?);
                Ok(Stores {
                    hashes: db.clone(),
                    files: db.clone(),
                    jobs: db,
                })
            }
            #[cfg(not(feature = "rocksdb"))]
            StoreBackendKind::Rocksdb => {
                tracing::warn!(
                    path = %path.display(),
                    "RocksDB not compiled in (missing 'rocksdb' feature), falling back to in-memory store"
                );
                Ok(Self::in_memory())
            }
        }
    }
}

// ── Shared job logic ─────────────────────────────────────────────────────────

pub(crate) fn new_job(id: JobId, file_id: &str, items: Vec<NewJobItem>, now: u64) -> Job {
    let items = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| JobItem {
            id: Job::item_id(&id, index),
            index: index as u64,
            hash: item.hash,
            status: item.status,
            upload_url: None,
        })
        .collect();
    Job {
        id,
        file_id: file_id.to_string(),
        status: JobStatus::Pending,
        items,
        attempts: 0,
        last_error: None,
        created_at: now,
    }
}

pub(crate) fn advance(job: &mut Job, next: JobStatus) -> bool {
    if next > job.status {
        job.status = next;
        true
    } else {
        false
    }
}

pub(crate) fn apply_transition(
    job: &mut Job,
    item_id: &str,
    expected: ItemStatus,
    next: ItemStatus,
    upload_url: Option<String>,
) -> DmResult<bool> {
    if !expected.can_transition_to(next) {
        return Err(DmError::InvalidInput(format!(
            "illegal item transition {expected} -> {next}"
        )));
    }
    let job_id = job.id.clone();
    let item = job
        .items
        .iter_mut()
        .find(|it| it.id == item_id)
        .ok_or_else(|| DmError::NotFound(format!("item {item_id} of job {job_id}")))?;

    if item.status != expected {
        return Ok(false);
    }
    item.status = next;
    if upload_url.is_some() {
        item.upload_url = upload_url;
    }
    Ok(true)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
