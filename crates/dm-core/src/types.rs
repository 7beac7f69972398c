use serde::{Deserialize, Serialize};

pub type FileId = String;
pub type JobId = String;
pub type ItemId = String;

/// Metadata for one content-defined chunk, as recorded in the catalog.
///
/// `hash` is the SHA-256 of the plaintext (lowercase hex) and is the dedup
/// identity. Key material and nonces are base64. Legacy submissions carry
/// only the hash, so everything else is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub index: u64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_chunk_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_nonce: Option<String>,
}

impl ChunkRecord {
    /// A record that carries only the dedup identity.
    pub fn bare(index: u64, hash: impl Into<String>) -> Self {
        Self {
            index,
            hash: hash.into(),
            size: None,
            ciphertext_nonce: None,
            wrapped_chunk_key: None,
            wrap_nonce: None,
        }
    }
}

/// Which passphrase KDF protects a file key, and with what salt (base64).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfInfo {
    pub algorithm: String,
    pub salt: String,
}

/// Input to `FileCatalog::create`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub chunks: Vec<ChunkRecord>,
    pub wrapped_file_key: Option<String>,
    pub wrap_nonce: Option<String>,
    pub kdf: Option<KdfInfo>,
    pub owner_id: Option<String>,
}

/// A catalogued file. Immutable after creation except for the fields
/// covered by [`FilePatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub chunks: Vec<ChunkRecord>,
    pub wrapped_file_key: Option<String>,
    pub wrap_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfInfo>,
    pub owner_id: Option<String>,
    pub note: Option<String>,
    /// Unix seconds
    pub created_at: u64,
}

impl FileRecord {
    pub fn from_new(id: FileId, new: NewFile, created_at: u64) -> Self {
        Self {
            id,
            file_name: new.file_name,
            file_size: new.file_size,
            chunks: new.chunks,
            wrapped_file_key: new.wrapped_file_key,
            wrap_nonce: new.wrap_nonce,
            kdf: new.kdf,
            owner_id: new.owner_id,
            note: None,
            created_at,
        }
    }

    /// Apply the mutable subset of fields. Returns true if anything changed.
    pub fn apply(&mut self, patch: &FilePatch) -> bool {
        let mut changed = false;
        if let Some(v) = &patch.wrapped_file_key {
            self.wrapped_file_key = Some(v.clone());
            changed = true;
        }
        if let Some(v) = &patch.wrap_nonce {
            self.wrap_nonce = Some(v.clone());
            changed = true;
        }
        if let Some(v) = &patch.note {
            self.note = Some(v.clone());
            changed = true;
        }
        if let Some(v) = &patch.owner_id {
            self.owner_id = Some(v.clone());
            changed = true;
        }
        changed
    }
}

/// The only fields of a [`FileRecord`] that may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    pub wrapped_file_key: Option<String>,
    #[serde(alias = "wrappedFileKeyIv")]
    pub wrap_nonce: Option<String>,
    pub note: Option<String>,
    pub owner_id: Option<String>,
}

impl FilePatch {
    pub fn is_empty(&self) -> bool {
        self.wrapped_file_key.is_none()
            && self.wrap_nonce.is_none()
            && self.note.is_none()
            && self.owner_id.is_none()
    }
}

/// Population count for one plaintext hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashEntry {
    pub sha256: String,
    pub ref_count: u64,
}

/// Answer to an existence query for one hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashVerdict {
    pub hash: String,
    pub exists: bool,
}

/// Per-chunk upload state.
///
/// ```text
/// needs_upload -> deduplicated   (hash already present at creation)
/// needs_upload -> url_ready      (destination assigned)
/// url_ready    -> uploaded       (upload committed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    NeedsUpload,
    Deduplicated,
    UrlReady,
    Uploaded,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Deduplicated | ItemStatus::Uploaded)
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        matches!(
            (self, next),
            (ItemStatus::NeedsUpload, ItemStatus::Deduplicated)
                | (ItemStatus::NeedsUpload, ItemStatus::UrlReady)
                | (ItemStatus::UrlReady, ItemStatus::Uploaded)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::NeedsUpload => "needs_upload",
            ItemStatus::Deduplicated => "deduplicated",
            ItemStatus::UrlReady => "url_ready",
            ItemStatus::Uploaded => "uploaded",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate job state. Ordered: a job only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobItem {
    pub id: ItemId,
    pub index: u64,
    pub hash: String,
    pub status: ItemStatus,
    pub upload_url: Option<String>,
}

/// Input for one item when creating a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobItem {
    pub hash: String,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub file_id: FileId,
    pub status: JobStatus,
    pub items: Vec<JobItem>,
    /// Failed processing attempts recorded so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: u64,
}

impl Job {
    pub fn item_id(job_id: &str, index: usize) -> ItemId {
        format!("{job_id}:{index}")
    }

    pub fn all_terminal(&self) -> bool {
        self.items.iter().all(|it| it.status.is_terminal())
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|it| it.status == status).count()
    }

    pub fn item(&self, item_id: &str) -> Option<&JobItem> {
        self.items.iter().find(|it| it.id == item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_transitions_follow_state_machine() {
        use ItemStatus::*;
        assert!(NeedsUpload.can_transition_to(Deduplicated));
        assert!(NeedsUpload.can_transition_to(UrlReady));
        assert!(UrlReady.can_transition_to(Uploaded));

        assert!(!Deduplicated.can_transition_to(UrlReady));
        assert!(!Uploaded.can_transition_to(UrlReady));
        assert!(!UrlReady.can_transition_to(NeedsUpload));
        assert!(!NeedsUpload.can_transition_to(Uploaded));
    }

    #[test]
    fn terminal_statuses() {
        assert!(ItemStatus::Deduplicated.is_terminal());
        assert!(ItemStatus::Uploaded.is_terminal());
        assert!(!ItemStatus::NeedsUpload.is_terminal());
        assert!(!ItemStatus::UrlReady.is_terminal());
    }

    #[test]
    fn job_status_is_ordered() {
        assert!(JobStatus::Pending < JobStatus::InProgress);
        assert!(JobStatus::InProgress < JobStatus::Completed);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ItemStatus::NeedsUpload).unwrap();
        assert_eq!(json, "\"needs_upload\"");
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn patch_touches_only_mutable_fields() {
        let mut rec = FileRecord::from_new(
            "f1".into(),
            NewFile {
                file_name: Some("a.bin".into()),
                file_size: Some(10),
                chunks: vec![ChunkRecord::bare(0, "aa")],
                ..Default::default()
            },
            7,
        );
        let patch = FilePatch {
            note: Some("backup".into()),
            wrap_nonce: Some("bm9uY2U=".into()),
            ..Default::default()
        };
        assert!(rec.apply(&patch));
        assert_eq!(rec.note.as_deref(), Some("backup"));
        assert_eq!(rec.wrap_nonce.as_deref(), Some("bm9uY2U="));
        assert_eq!(rec.file_name.as_deref(), Some("a.bin"));
        assert_eq!(rec.chunks.len(), 1);
        assert_eq!(rec.created_at, 7);

        assert!(!rec.apply(&FilePatch::default()));
    }

    #[test]
    fn patch_ignores_unknown_fields_and_accepts_iv_alias() {
        let patch: FilePatch = serde_json::from_str(
            r#"{"wrappedFileKeyIv":"aXY=","fileName":"evil","chunks":[],"note":"n"}"#,
        )
        .unwrap();
        assert_eq!(patch.wrap_nonce.as_deref(), Some("aXY="));
        assert_eq!(patch.note.as_deref(), Some("n"));
        assert!(patch.wrapped_file_key.is_none());
    }

    #[test]
    fn job_helpers() {
        let job = Job {
            id: "j".into(),
            file_id: "f".into(),
            status: JobStatus::Pending,
            items: vec![
                JobItem {
                    id: Job::item_id("j", 0),
                    index: 0,
                    hash: "a".into(),
                    status: ItemStatus::Deduplicated,
                    upload_url: None,
                },
                JobItem {
                    id: Job::item_id("j", 1),
                    index: 1,
                    hash: "b".into(),
                    status: ItemStatus::NeedsUpload,
                    upload_url: None,
                },
            ],
            attempts: 0,
            last_error: None,
            created_at: 0,
        };
        assert_eq!(job.items[1].id, "j:1");
        assert!(!job.all_terminal());
        assert_eq!(job.count(ItemStatus::Deduplicated), 1);
        assert!(job.item("j:1").is_some());
        assert!(job.item("j:2").is_none());
    }
}
