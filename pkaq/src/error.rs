use std::time::Duration;

use thiserror::Error;

use crate::job::{JobId, JobToken};
use crate::lease::LeaseId;

/// Errors surfaced by the scheduling, dispatch and reporting layers.
#[derive(Debug, Error)]
pub enum PkaqError {
    /// The submission was rejected before it reached the admission queue.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// A polling loop exceeded its configured bound.
    #[error("timed out after {waited:?} waiting for {what}")]
    WaitTimeout { what: &'static str, waited: Duration },

    /// The queue entry backing a lease is gone (evicted or removed out-of-band).
    #[error("lease {0} is no longer held")]
    LeaseLost(LeaseId),

    #[error("shutdown requested")]
    Shutdown,

    #[error("cluster command failed: {0}")]
    Cluster(String),

    #[error("store error: {0}")]
    Store(String),

    /// A second Result write for the same job.
    #[error("result already recorded for job {0}")]
    ResultAlreadyRecorded(JobId),

    #[error("job not found: {0}")]
    JobNotFound(JobToken),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PkaqError {
    /// True for errors that mean the caller lost a race to write a Result.
    pub fn is_already_recorded(&self) -> bool {
        matches!(self, PkaqError::ResultAlreadyRecorded(_))
    }
}

pub type Result<T> = std::result::Result<T, PkaqError>;
