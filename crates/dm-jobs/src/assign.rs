//! Upload destination assignment.

use dm_core::types::JobItem;
use dm_core::{DmError, DmResult};

/// Chooses where a chunk's ciphertext should be uploaded.
///
/// Errors are treated as transient and retried by the worker.
pub trait DestinationAssigner: Send + Sync {
    fn assign(&self, job_id: &str, item: &JobItem) -> DmResult<String>;
}

/// `{base}/{hash}`. Content-addressed, so the same chunk always maps to
/// the same destination no matter which file it came from.
#[derive(Debug, Clone)]
pub struct UrlTemplateAssigner {
    base: String,
}

impl UrlTemplateAssigner {
    pub fn new(base: impl Into<String>) -> DmResult<Self> {
        let base = base.into().trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(DmError::Config("upload_base must not be empty".into()));
        }
        Ok(Self { base })
    }
}

impl DestinationAssigner for UrlTemplateAssigner {
    fn assign(&self, _job_id: &str, item: &JobItem) -> DmResult<String> {
        Ok(format!("{}/{}", self.base, item.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_core::types::ItemStatus;

    fn item(hash: &str) -> JobItem {
        JobItem {
            id: "j:0".into(),
            index: 0,
            hash: hash.into(),
            status: ItemStatus::NeedsUpload,
            upload_url: None,
        }
    }

    #[test]
    fn url_is_base_plus_hash() {
        let a = UrlTemplateAssigner::new("https://up.example.com/upload/").unwrap();
        assert_eq!(
            a.assign("j", &item("abc")).unwrap(),
            "https://up.example.com/upload/abc"
        );
    }

    #[test]
    fn empty_base_is_rejected() {
        assert!(matches!(UrlTemplateAssigner::new("/"), Err(DmError::Config(_))));
    }
}
