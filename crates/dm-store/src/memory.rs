//! In-memory backend. State lives for the life of the process.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dm_core::types::{
    FilePatch, FileRecord, HashEntry, HashVerdict, ItemId, ItemStatus, Job, JobId, JobItem,
    JobStatus, NewFile, NewJobItem,
};
use dm_core::{now_secs, DmError, DmResult};
use tracing::debug;

use crate::{advance, apply_transition, new_id, new_job, FileCatalog, HashStore, JobRepository};

// A panicked writer leaves the map in a consistent state for every method
// here, so poisoning is ignored.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ── Hash store ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryHashStore {
    entries: RwLock<HashMap<String, u64>>,
}

impl HashStore for MemoryHashStore {
    fn check_existence(&self, hashes: &[String]) -> DmResult<Vec<HashVerdict>> {
        let entries = read(&self.entries);
        Ok(hashes
            .iter()
            .map(|h| HashVerdict {
                hash: h.clone(),
                exists: entries.contains_key(h),
            })
            .collect())
    }

    fn commit(&self, hashes: &[String]) -> DmResult<()> {
        let mut entries = write(&self.entries);
        for h in hashes {
            *entries.entry(h.clone()).or_insert(0) += 1;
        }
        debug!(count = hashes.len(), "committed hashes");
        Ok(())
    }

    fn get(&self, hash: &str) -> DmResult<Option<HashEntry>> {
        Ok(read(&self.entries).get(hash).map(|&ref_count| HashEntry {
            sha256: hash.to_string(),
            ref_count,
        }))
    }

    fn list_all(&self) -> DmResult<Vec<HashEntry>> {
        let mut all: Vec<HashEntry> = read(&self.entries)
            .iter()
            .map(|(sha256, &ref_count)| HashEntry {
                sha256: sha256.clone(),
                ref_count,
            })
            .collect();
        all.sort_by(|a, b| a.sha256.cmp(&b.sha256));
        Ok(all)
    }
}

// ── File catalog ─────────────────────────────────────────────────────────────

/// Records plus their insertion order, so `list` is oldest first even when
/// several files share a creation second.
#[derive(Default)]
struct Catalog {
    records: HashMap<String, FileRecord>,
    order: Vec<String>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<Catalog>,
}

impl FileCatalog for MemoryCatalog {
    fn create(&self, new: NewFile) -> DmResult<FileRecord> {
        let record = FileRecord::from_new(new_id(), new, now_secs());
        let mut inner = write(&self.inner);
        inner.order.push(record.id.clone());
        inner.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, id: &str) -> DmResult<Option<FileRecord>> {
        Ok(read(&self.inner).records.get(id).cloned())
    }

    fn list(&self) -> DmResult<Vec<FileRecord>> {
        let inner = read(&self.inner);
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect())
    }

    fn patch(&self, id: &str, patch: &FilePatch) -> DmResult<Option<FileRecord>> {
        let mut inner = write(&self.inner);
        Ok(inner.records.get_mut(id).map(|rec| {
            rec.apply(patch);
            rec.clone()
        }))
    }

    fn remove(&self, id: &str) -> DmResult<bool> {
        let mut inner = write(&self.inner);
        let removed = inner.records.remove(id).is_some();
        if removed {
            inner.order.retain(|o| o != id);
        }
        Ok(removed)
    }
}

// ── Job repository ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Jobs {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
    /// hash -> every non-terminal item carrying it
    open: HashMap<String, Vec<(JobId, ItemId)>>,
}

impl Jobs {
    fn get_mut(&mut self, id: &str) -> DmResult<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| DmError::NotFound(format!("job {id}")))
    }

    fn close(&mut self, hash: &str, item_id: &str) {
        if let Some(open) = self.open.get_mut(hash) {
            open.retain(|(_, id)| id != item_id);
            if open.is_empty() {
                self.open.remove(hash);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryJobRepository {
    inner: RwLock<Jobs>,
}

impl JobRepository for MemoryJobRepository {
    fn create(&self, file_id: &str, items: Vec<NewJobItem>) -> DmResult<Job> {
        let job = new_job(new_id(), file_id, items, now_secs());
        let mut inner = write(&self.inner);
        for item in job.items.iter().filter(|it| !it.status.is_terminal()) {
            inner
                .open
                .entry(item.hash.clone())
                .or_default()
                .push((job.id.clone(), item.id.clone()));
        }
        inner.order.push(job.id.clone());
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    fn get(&self, id: &str) -> DmResult<Option<Job>> {
        Ok(read(&self.inner).jobs.get(id).cloned())
    }

    fn list(&self) -> DmResult<Vec<Job>> {
        let inner = read(&self.inner);
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect())
    }

    fn advance_status(&self, id: &str, next: JobStatus) -> DmResult<Job> {
        let mut inner = write(&self.inner);
        let job = inner.get_mut(id)?;
        advance(job, next);
        Ok(job.clone())
    }

    fn transition_item(
        &self,
        job_id: &str,
        item_id: &str,
        expected: ItemStatus,
        next: ItemStatus,
        upload_url: Option<String>,
    ) -> DmResult<bool> {
        let mut inner = write(&self.inner);
        let job = inner.get_mut(job_id)?;
        let moved = apply_transition(job, item_id, expected, next, upload_url)?;
        let closed = match job.item(item_id) {
            Some(item) if moved && next.is_terminal() => Some(item.hash.clone()),
            _ => None,
        };
        if let Some(hash) = closed {
            inner.close(&hash, item_id);
        }
        Ok(moved)
    }

    fn record_fault(&self, id: &str, attempts: u32, error: &str) -> DmResult<Job> {
        let mut inner = write(&self.inner);
        let job = inner.get_mut(id)?;
        job.attempts = attempts;
        job.last_error = Some(error.to_string());
        Ok(job.clone())
    }

    fn open_items_with_hash(&self, hash: &str) -> DmResult<Vec<(JobId, JobItem)>> {
        let inner = read(&self.inner);
        let Some(open) = inner.open.get(hash) else {
            return Ok(Vec::new());
        };
        Ok(open
            .iter()
            .filter_map(|(job_id, item_id)| {
                let item = inner.jobs.get(job_id)?.item(item_id)?;
                Some((job_id.clone(), item.clone()))
            })
            .collect())
    }
}
