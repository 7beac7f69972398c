//! dm-core: shared vocabulary for the drivemerge crates
//!
//! - `types`: files, chunks, hash entries, jobs and job items
//! - `api`: submission / commit / patch request and response shapes
//! - `events`: notifications emitted to observers
//! - `config`: `drivemerge.toml` schema
//! - `error`: the error kinds every crate reports

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use error::{DmError, DmResult};

/// Current unix timestamp in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
