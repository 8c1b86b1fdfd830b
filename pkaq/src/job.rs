use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque per-submission identifier shared by the queue, the store and file names.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobToken(String);

impl JobToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a fresh token: timestamp digits followed by a hash-derived number.
    pub fn generate() -> Self {
        let now = Utc::now();
        let mut hasher = DefaultHasher::new();
        Uuid::new_v4().hash(&mut hasher);
        now.timestamp_nanos_opt().hash(&mut hasher);
        let stamp = now.format("%Y%m%d%H%M%S%6f").to_string();
        let raw = format!("{}{}", stamp, hasher.finish());
        Self(raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
    }

    /// The token with the disambiguating suffix appended.
    pub fn disambiguated(&self) -> Self {
        Self(format!("{}_", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token can be used as a file name component and in a
    /// cluster job name.
    pub fn is_file_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl Display for JobToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProteinId(pub i64);

impl Display for ProteinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network origin and coarse location of the requester.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

/// Everything the store needs to create a Job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmissionMeta {
    pub token: JobToken,
    pub submitted_at: DateTime<Utc>,
    pub email: Option<String>,
    pub provenance: Provenance,
}

impl SubmissionMeta {
    pub fn new(token: JobToken) -> Self {
        Self {
            token,
            submitted_at: Utc::now(),
            email: None,
            provenance: Provenance::default(),
        }
    }
}

/// Lifecycle state of a job. Never stored; always derived from queue
/// membership and the presence of a Result.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Queued,
    Dispatched,
    Succeeded,
    Failed,
}

impl JobState {
    /// Derive the state from what the queues and the store report.
    ///
    /// `result_error` is `None` when no Result exists, `Some(None)` for a
    /// successful Result and `Some(Some(_))` for a failed one.
    pub fn derive(
        in_admission_queue: bool,
        in_cluster_queue: bool,
        result_error: Option<Option<&str>>,
    ) -> Self {
        match result_error {
            Some(Some(_)) => JobState::Failed,
            Some(None) => JobState::Succeeded,
            None if in_cluster_queue => JobState::Dispatched,
            None if in_admission_queue => JobState::Queued,
            None => JobState::Created,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Queued => "QUEUED",
            JobState::Dispatched => "DISPATCHED",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
