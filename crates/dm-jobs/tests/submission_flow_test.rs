//! End-to-end flows through chunking, submission, workers and commit, on the
//! in-memory stores and the local queue.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dm_chunks::{reassemble, recover_file_key, ChunkProducer, ChunkSizes};
use dm_core::api::{CommitRequest, SubmitRequest};
use dm_core::config::JobsConfig;
use dm_core::events::Notification;
use dm_core::types::{ItemStatus, JobItem, JobStatus};
use dm_core::{DmError, DmResult};
use dm_crypto::{encoding, KdfParams, KeyService, SALT_SIZE};
use dm_jobs::{
    DestinationAssigner, JobQueue, JobWorker, Notifier, RetryPolicy, Runtime, UrlTemplateAssigner,
};
use dm_store::Stores;
use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const UPLOAD_BASE: &str = "https://uploads.test/upload";

fn xorshift_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 32) as u8
        })
        .collect()
}

fn jobs_config() -> JobsConfig {
    JobsConfig {
        upload_base: UPLOAD_BASE.into(),
        max_attempts: 3,
        backoff_ms: 1,
        workers: 4,
        ..Default::default()
    }
}

fn runtime_with(assigner: Arc<dyn DestinationAssigner>) -> (Runtime, broadcast::Receiver<Notification>) {
    let (notifier, rx) = Notifier::broadcast();
    let runtime = Runtime::new(
        Stores::in_memory(),
        JobQueue::local(),
        notifier,
        assigner,
        &jobs_config(),
    );
    (runtime, rx)
}

fn runtime() -> (Runtime, broadcast::Receiver<Notification>) {
    runtime_with(Arc::new(UrlTemplateAssigner::new(UPLOAD_BASE).unwrap()))
}

async fn submission(data: &[u8]) -> SubmitRequest {
    let file = ChunkProducer::new(ChunkSizes::DEFAULT, 64 * 1024)
        .encrypt_reader(Cursor::new(data.to_vec()), Some(data.len() as u64))
        .await
        .unwrap();
    file.into_unprotected_submission(Some("doc.bin".into())).request
}

fn legacy(hashes: Vec<String>) -> SubmitRequest {
    SubmitRequest {
        file_name: Some("legacy.bin".into()),
        file_size: Some(hashes.len() as u64),
        chunk_hashes: Some(hashes),
        ..Default::default()
    }
}

fn h(n: u32) -> String {
    format!("{n:064x}")
}

fn drain_events(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn unprotected_200k_file_roundtrip_then_dedup() {
    let (rt, mut rx) = runtime();
    let data = xorshift_bytes(200 * 1024, 42);

    let request = submission(&data).await;
    let chunk_count = request.chunks.as_ref().unwrap().len();
    assert!(chunk_count >= 2);
    assert!(request.wrapped_file_key.is_none());

    let resp = rt.orchestrator.submit(request, None).await.unwrap();
    assert_eq!(resp.jobs.len(), chunk_count);
    assert!(resp.jobs.iter().all(|v| v.status == ItemStatus::NeedsUpload));
    let hashes: Vec<String> = resp.jobs.iter().map(|v| v.hash.clone()).collect();
    assert_eq!(hashes.iter().collect::<HashSet<_>>().len(), chunk_count);
    let job_id = resp.job.unwrap().id;

    assert_eq!(rt.workers.drain().await.unwrap(), 1);
    let job = rt.orchestrator.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::InProgress, "url_ready items await commit");
    for item in &job.items {
        assert_eq!(item.status, ItemStatus::UrlReady);
        assert_eq!(item.upload_url.as_deref(), Some(format!("{UPLOAD_BASE}/{}", item.hash).as_str()));
    }

    let committed = rt
        .orchestrator
        .commit(CommitRequest {
            chunk_hashes: hashes.clone(),
        })
        .await
        .unwrap();
    assert_eq!(committed.committed, chunk_count);

    let job = rt.orchestrator.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.items.iter().all(|it| it.status == ItemStatus::Uploaded));

    let events = drain_events(&mut rx);
    assert!(matches!(events.first(), Some(Notification::JobReady { .. })));
    assert!(events.contains(&Notification::HashesCommitted { count: chunk_count }));
    assert!(events.contains(&Notification::JobUpdate {
        job_id: job_id.clone(),
        status: JobStatus::Completed
    }));

    // same bytes, fresh keys: identical hashes, so everything deduplicates
    let again = rt
        .orchestrator
        .submit(submission(&data).await, None)
        .await
        .unwrap();
    assert_eq!(again.jobs.len(), chunk_count);
    assert!(again.jobs.iter().all(|v| v.status == ItemStatus::Deduplicated));

    rt.workers.drain().await.unwrap();
    let second = rt.orchestrator.get_job(&again.job.unwrap().id).unwrap();
    assert_eq!(second.status, JobStatus::Completed);

    for entry in rt.orchestrator.list_hashes().unwrap() {
        assert_eq!(entry.ref_count, 1);
    }
}

#[tokio::test]
async fn protected_file_is_recoverable_from_catalog_metadata() {
    let (rt, _rx) = runtime();
    let keys = KeyService::spawn(
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
            pbkdf2_iterations: 1000,
        },
        Duration::from_secs(30),
        Duration::from_secs(5),
    );
    let cancel = CancellationToken::new();
    let derived = keys
        .derive(SecretString::from("correct horse"), None, &cancel)
        .await
        .unwrap();

    let data = xorshift_bytes(96 * 1024, 7);
    let submission = ChunkProducer::new(ChunkSizes::DEFAULT, 16 * 1024)
        .encrypt_reader(Cursor::new(data.clone()), Some(data.len() as u64))
        .await
        .unwrap()
        .into_protected_submission(Some("secret.bin".into()), &keys, &derived, &cancel)
        .await
        .unwrap();
    assert!(submission.raw_file_key.is_none());
    let ciphertexts: std::collections::HashMap<u64, Vec<u8>> = submission
        .chunks
        .iter()
        .map(|c| (c.record.index, c.ciphertext.clone()))
        .collect();

    let resp = rt
        .orchestrator
        .submit(submission.request, Some("alice".into()))
        .await
        .unwrap();
    let record = rt.orchestrator.get_file(&resp.file_id).unwrap();
    assert_eq!(record.owner_id.as_deref(), Some("alice"));
    assert!(record.wrapped_file_key.is_some());

    // re-derive from the catalogued salt, as a later reader would
    let kdf = record.kdf.clone().unwrap();
    let salt: [u8; SALT_SIZE] = encoding::decode_array(&kdf.salt, "salt").unwrap();
    let again = keys
        .derive(SecretString::from("correct horse"), Some(salt), &cancel)
        .await
        .unwrap();
    assert_eq!(again.algorithm.as_str(), kdf.algorithm);

    let file_key = recover_file_key(&record, &again.master, &keys, &cancel)
        .await
        .unwrap();
    let plain = reassemble(&file_key, &record.chunks, |c| {
        ciphertexts
            .get(&c.index)
            .cloned()
            .ok_or_else(|| DmError::NotFound(format!("chunk {}", c.index)))
    })
    .unwrap();
    assert_eq!(plain, data);

    let wrong = keys
        .derive(SecretString::from("wrong horse"), Some(salt), &cancel)
        .await
        .unwrap();
    assert!(matches!(
        recover_file_key(&record, &wrong.master, &keys, &cancel).await,
        Err(DmError::UnwrapFailure(_))
    ));
}

#[tokio::test]
async fn job_has_one_item_per_chunk_and_counts_existing() {
    let (rt, _rx) = runtime();
    let existing: Vec<String> = (0..3).map(h).collect();
    rt.orchestrator
        .commit(CommitRequest {
            chunk_hashes: existing,
        })
        .await
        .unwrap();

    let hashes: Vec<String> = (0..8).map(h).collect();
    let resp = rt.orchestrator.submit(legacy(hashes), None).await.unwrap();
    let job = rt.orchestrator.get_job(&resp.job.unwrap().id).unwrap();
    assert_eq!(job.items.len(), 8);
    assert_eq!(job.count(ItemStatus::Deduplicated), 3);

    rt.workers.drain().await.unwrap();
    rt.orchestrator
        .commit(CommitRequest {
            chunk_hashes: (3..8).map(h).collect(),
        })
        .await
        .unwrap();

    let job = rt.orchestrator.get_job(&job.id).unwrap();
    assert!(job.all_terminal());
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn hash_committed_before_worker_runs_is_deduplicated_late() {
    let (rt, _rx) = runtime();
    let resp = rt
        .orchestrator
        .submit(legacy(vec![h(1), h(2)]), None)
        .await
        .unwrap();

    // another submission uploaded h(1) in the meantime
    rt.orchestrator
        .commit(CommitRequest {
            chunk_hashes: vec![h(1)],
        })
        .await
        .unwrap();
    rt.workers.drain().await.unwrap();

    let job = rt.orchestrator.get_job(&resp.job.unwrap().id).unwrap();
    assert_eq!(job.items[0].status, ItemStatus::Deduplicated);
    assert_eq!(job.items[1].status, ItemStatus::UrlReady);
}

/// Fails the first `failures` calls, then assigns normally.
struct FlakyAssigner {
    failures: u32,
    calls: AtomicU32,
}

impl DestinationAssigner for FlakyAssigner {
    fn assign(&self, _job_id: &str, item: &JobItem) -> DmResult<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(DmError::Other(anyhow::anyhow!("assigner unavailable")))
        } else {
            Ok(format!("{UPLOAD_BASE}/{}", item.hash))
        }
    }
}

#[tokio::test]
async fn transient_assignment_failures_are_retried() {
    let assigner = Arc::new(FlakyAssigner {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let (rt, _rx) = runtime_with(assigner.clone());
    let resp = rt.orchestrator.submit(legacy(vec![h(1)]), None).await.unwrap();

    rt.workers.drain().await.unwrap();
    let job = rt.orchestrator.get_job(&resp.job.unwrap().id).unwrap();
    assert_eq!(job.items[0].status, ItemStatus::UrlReady);
    assert_eq!(job.attempts, 0);
    assert_eq!(assigner.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_fault_the_job_without_completing_it() {
    let assigner = Arc::new(FlakyAssigner {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let (rt, mut rx) = runtime_with(assigner.clone());
    let resp = rt
        .orchestrator
        .submit(legacy(vec![h(1), h(2)]), None)
        .await
        .unwrap();
    let job_id = resp.job.unwrap().id;

    rt.workers.drain().await.unwrap();
    let job = rt.orchestrator.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::InProgress);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.as_deref().unwrap().contains("assigner unavailable"));
    assert_eq!(job.count(ItemStatus::NeedsUpload), 2);

    let failed: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, Notification::JobFailed { .. }))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_id(), Some(job_id.as_str()));
}

#[tokio::test]
async fn terminal_items_are_not_reprocessed() {
    let assigner = Arc::new(FlakyAssigner {
        failures: 0,
        calls: AtomicU32::new(0),
    });
    let (rt, _rx) = runtime_with(assigner.clone());
    rt.orchestrator
        .commit(CommitRequest {
            chunk_hashes: vec![h(1)],
        })
        .await
        .unwrap();
    rt.orchestrator
        .submit(legacy(vec![h(1), h(2)]), None)
        .await
        .unwrap();

    rt.workers.drain().await.unwrap();
    assert_eq!(assigner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_workers_move_each_item_once() {
    let stores = Stores::in_memory();
    let (notifier, mut rx) = Notifier::broadcast();
    let queue = Arc::new(JobQueue::local());
    let orchestrator = dm_jobs::Orchestrator::new(stores.clone(), queue, notifier.clone());
    let worker = Arc::new(JobWorker::new(
        stores,
        Arc::new(UrlTemplateAssigner::new(UPLOAD_BASE).unwrap()),
        notifier,
        RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_millis(1),
        },
    ));

    let resp = orchestrator
        .submit(legacy((0..32).map(h).collect()), None)
        .await
        .unwrap();
    let job_id = resp.job.unwrap().id;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let worker = worker.clone();
        let job_id = job_id.clone();
        tasks.spawn(async move { worker.process(&job_id).await });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }

    let job = orchestrator.get_job(&job_id).unwrap();
    assert_eq!(job.count(ItemStatus::UrlReady), 32);

    let item_updates = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, Notification::JobItemUpdate { .. }))
        .count();
    assert_eq!(item_updates, 32);
}

#[tokio::test]
async fn worker_pool_run_stops_on_cancel() {
    let (rt, _rx) = runtime();
    let resp = rt.orchestrator.submit(legacy(vec![h(9)]), None).await.unwrap();
    let job_id = resp.job.unwrap().id;

    let cancel = tokio_util::sync::CancellationToken::new();
    let pool = rt.workers.clone();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { pool.run(cancel).await }
    });

    let mut status = JobStatus::Pending;
    for _ in 0..200 {
        status = rt.orchestrator.get_job(&job_id).unwrap().status;
        if status == JobStatus::InProgress {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, JobStatus::InProgress);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
