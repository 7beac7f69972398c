//! RocksDB backend: one database, key-prefixed namespaces, JSON values.
//!
//! ```text
//! h/{sha256}        -> HashEntry
//! f/{file_id}       -> FileRecord
//! fo/{seq:020}      -> file_id        (creation order)
//! j/{job_id}        -> Job
//! jo/{seq:020}      -> job_id         (creation order)
//! ih/{sha256}/{item_id} -> job_id     (non-terminal items only)
//! meta/file_seq     -> u64
//! meta/job_seq      -> u64
//! ```
//!
//! Every read-modify-write holds `write_lock`; multi-key updates go through
//! a single `WriteBatch`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dm_core::types::{
    FilePatch, FileRecord, HashEntry, HashVerdict, ItemStatus, Job, JobId, JobItem, JobStatus,
    NewFile, NewJobItem,
};
use dm_core::{now_secs, DmError, DmResult};
use rocksdb::{Direction, IteratorMode, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{advance, apply_transition, new_id, new_job, FileCatalog, HashStore, JobRepository};

const HASH: &str = "h/";
const FILE: &str = "f/";
const FILE_ORDER: &str = "fo/";
const JOB: &str = "j/";
const JOB_ORDER: &str = "jo/";
const OPEN_ITEM: &str = "ih/";
const FILE_SEQ: &str = "meta/file_seq";
const JOB_SEQ: &str = "meta/job_seq";

pub struct RocksStore {
    db: DB,
    write_lock: Mutex<()>,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> DmError {
    DmError::Store(format!("{context}: {e}"))
}

impl RocksStore {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> DmResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path)
            .map_err(|e| db_err(&format!("opening RocksDB at {}", path.display()), e))?;
        debug!(path = %path.display(), "opened RocksDB store");

        Ok(RocksStore {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> DmResult<Option<T>> {
        match self.db.get(key.as_bytes()).map_err(|e| db_err(key, e))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| db_err(&format!("decoding {key}"), e)),
            None => Ok(None),
        }
    }

    fn encode<T: Serialize>(key: &str, value: &T) -> DmResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| db_err(&format!("encoding {key}"), e))
    }

    fn store<T: Serialize>(&self, key: &str, value: &T) -> DmResult<()> {
        self.db
            .put(key.as_bytes(), Self::encode(key, value)?)
            .map_err(|e| db_err(key, e))
    }

    /// Every key/value pair under `prefix`, in key order.
    fn scan_entries(&self, prefix: &str) -> DmResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| db_err(&format!("scanning {prefix}"), e))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn scan(&self, prefix: &str) -> DmResult<Vec<Box<[u8]>>> {
        Ok(self.scan_entries(prefix)?.into_iter().map(|(_, v)| v).collect())
    }

    /// Insert `value` under `{prefix}{id}` and append `id` to the order index,
    /// together with whatever `batch` already holds.
    fn insert_ordered<T: Serialize>(
        &self,
        mut batch: WriteBatch,
        prefix: &str,
        order_prefix: &str,
        seq_key: &str,
        id: &str,
        value: &T,
    ) -> DmResult<()> {
        let _guard = self.lock();
        let seq = self.load::<u64>(seq_key)?.unwrap_or(0) + 1;

        let key = format!("{prefix}{id}");
        batch.put(key.as_bytes(), Self::encode(&key, value)?);
        batch.put(format!("{order_prefix}{seq:020}").as_bytes(), id.as_bytes());
        batch.put(seq_key.as_bytes(), Self::encode(seq_key, &seq)?);
        self.db.write(batch).map_err(|e| db_err(&key, e))
    }

    /// Records in creation order, skipping order entries whose record is gone.
    fn list_ordered<T: DeserializeOwned>(&self, prefix: &str, order_prefix: &str) -> DmResult<Vec<T>> {
        let mut out = Vec::new();
        for id in self.scan(order_prefix)? {
            let id = String::from_utf8_lossy(&id);
            match self.load(&format!("{prefix}{id}"))? {
                Some(v) => out.push(v),
                None => warn!(%id, "order index points at a missing record"),
            }
        }
        Ok(out)
    }

    /// Read-modify-write one job. `f` may add index updates to the batch
    /// that stores the job.
    fn update_job<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Job, &mut WriteBatch) -> DmResult<R>,
    ) -> DmResult<(Job, R)> {
        let _guard = self.lock();
        let key = format!("{JOB}{id}");
        let mut job: Job = self
            .load(&key)?
            .ok_or_else(|| DmError::NotFound(format!("job {id}")))?;
        let mut batch = WriteBatch::default();
        let out = f(&mut job, &mut batch)?;
        batch.put(key.as_bytes(), Self::encode(&key, &job)?);
        self.db.write(batch).map_err(|e| db_err(&key, e))?;
        Ok((job, out))
    }

    fn open_item_key(hash: &str, item_id: &str) -> String {
        format!("{OPEN_ITEM}{hash}/{item_id}")
    }
}

// ── Hash store ───────────────────────────────────────────────────────────────

impl HashStore for RocksStore {
    fn check_existence(&self, hashes: &[String]) -> DmResult<Vec<HashVerdict>> {
        let keys: Vec<String> = hashes.iter().map(|h| format!("{HASH}{h}")).collect();
        self.db
            .multi_get(keys.iter().map(|k| k.as_bytes()))
            .into_iter()
            .zip(hashes)
            .map(|(res, hash)| {
                let found = res.map_err(|e| db_err(&format!("checking {hash}"), e))?;
                Ok(HashVerdict {
                    hash: hash.clone(),
                    exists: found.is_some(),
                })
            })
            .collect()
    }

    fn commit(&self, hashes: &[String]) -> DmResult<()> {
        let _guard = self.lock();
        // Duplicates within one call must each count.
        let mut counts: std::collections::BTreeMap<&str, u64> = Default::default();
        for h in hashes {
            *counts.entry(h.as_str()).or_insert(0) += 1;
        }

        let mut batch = WriteBatch::default();
        for (hash, n) in counts {
            let key = format!("{HASH}{hash}");
            let mut entry = self.load::<HashEntry>(&key)?.unwrap_or(HashEntry {
                sha256: hash.to_string(),
                ref_count: 0,
            });
            entry.ref_count += n;
            batch.put(key.as_bytes(), Self::encode(&key, &entry)?);
        }
        self.db.write(batch).map_err(|e| db_err("committing hashes", e))?;
        debug!(count = hashes.len(), "committed hashes");
        Ok(())
    }

    fn get(&self, hash: &str) -> DmResult<Option<HashEntry>> {
        self.load(&format!("{HASH}{hash}"))
    }

    fn list_all(&self) -> DmResult<Vec<HashEntry>> {
        self.scan(HASH)?
            .iter()
            .map(|v| serde_json::from_slice(v).map_err(|e| db_err("decoding hash entry", e)))
            .collect()
    }
}

// ── File catalog ─────────────────────────────────────────────────────────────

impl FileCatalog for RocksStore {
    fn create(&self, new: NewFile) -> DmResult<FileRecord> {
        let record = FileRecord::from_new(new_id(), new, now_secs());
        self.insert_ordered(WriteBatch::default(), FILE, FILE_ORDER, FILE_SEQ, &record.id, &record)?;
        Ok(record)
    }

    fn get(&self, id: &str) -> DmResult<Option<FileRecord>> {
        self.load(&format!("{FILE}{id}"))
    }

    fn list(&self) -> DmResult<Vec<FileRecord>> {
        self.list_ordered(FILE, FILE_ORDER)
    }

    fn patch(&self, id: &str, patch: &FilePatch) -> DmResult<Option<FileRecord>> {
        let _guard = self.lock();
        let key = format!("{FILE}{id}");
        let Some(mut record) = self.load::<FileRecord>(&key)? else {
            return Ok(None);
        };
        if record.apply(patch) {
            self.store(&key, &record)?;
        }
        Ok(Some(record))
    }

    fn remove(&self, id: &str) -> DmResult<bool> {
        let _guard = self.lock();
        let key = format!("{FILE}{id}");
        if self.db.get(key.as_bytes()).map_err(|e| db_err(&key, e))?.is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.delete(key.as_bytes());
        for (order_key, value) in self.scan_entries(FILE_ORDER)? {
            if value.as_ref() == id.as_bytes() {
                batch.delete(order_key);
            }
        }
        self.db.write(batch).map_err(|e| db_err(&key, e))?;
        Ok(true)
    }
}

// ── Job repository ───────────────────────────────────────────────────────────

impl JobRepository for RocksStore {
    fn create(&self, file_id: &str, items: Vec<NewJobItem>) -> DmResult<Job> {
        let job = new_job(new_id(), file_id, items, now_secs());
        let mut batch = WriteBatch::default();
        for item in job.items.iter().filter(|it| !it.status.is_terminal()) {
            batch.put(
                Self::open_item_key(&item.hash, &item.id).as_bytes(),
                job.id.as_bytes(),
            );
        }
        self.insert_ordered(batch, JOB, JOB_ORDER, JOB_SEQ, &job.id, &job)?;
        Ok(job)
    }

    fn get(&self, id: &str) -> DmResult<Option<Job>> {
        self.load(&format!("{JOB}{id}"))
    }

    fn list(&self) -> DmResult<Vec<Job>> {
        self.list_ordered(JOB, JOB_ORDER)
    }

    fn advance_status(&self, id: &str, next: JobStatus) -> DmResult<Job> {
        self.update_job(id, |job, _| Ok(advance(job, next)))
            .map(|(job, _)| job)
    }

    fn transition_item(
        &self,
        job_id: &str,
        item_id: &str,
        expected: ItemStatus,
        next: ItemStatus,
        upload_url: Option<String>,
    ) -> DmResult<bool> {
        self.update_job(job_id, |job, batch| {
            let moved = apply_transition(job, item_id, expected, next, upload_url)?;
            if moved && next.is_terminal() {
                if let Some(item) = job.item(item_id) {
                    batch.delete(Self::open_item_key(&item.hash, item_id).as_bytes());
                }
            }
            Ok(moved)
        })
        .map(|(_, changed)| changed)
    }

    fn record_fault(&self, id: &str, attempts: u32, error: &str) -> DmResult<Job> {
        self.update_job(id, |job, _| {
            job.attempts = attempts;
            job.last_error = Some(error.to_string());
            Ok(())
        })
        .map(|(job, _)| job)
    }

    fn open_items_with_hash(&self, hash: &str) -> DmResult<Vec<(JobId, JobItem)>> {
        let prefix = format!("{OPEN_ITEM}{hash}/");
        let mut jobs: HashMap<String, Option<Job>> = HashMap::new();
        let mut out = Vec::new();
        for (key, job_id) in self.scan_entries(&prefix)? {
            let item_id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            let job_id = String::from_utf8_lossy(&job_id).into_owned();
            let job = match jobs.entry(job_id.clone()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(self.load(&format!("{JOB}{job_id}"))?),
            };
            match job.as_ref().and_then(|j| j.item(&item_id)) {
                Some(item) => out.push((job_id, item.clone())),
                None => warn!(%job_id, %item_id, "hash index points at a missing item"),
            }
        }
        Ok(out)
    }
}
