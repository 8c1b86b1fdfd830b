//! Persistent record of a job's identity, inputs and terminal outcome.
//!
//! Job state is never stored. It is derived from queue membership and the
//! presence (and error field) of the job's single Result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PkaqError, Result};
use crate::job::{JobId, JobToken, Provenance, ProteinId, SubmissionMeta};
use crate::params::ResolvedParameters;

pub mod memory;

pub use memory::InMemoryLifecycleStore;

/// Topology counts stored with a protein.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProteinCounts {
    pub nchains: Option<i32>,
    pub nsites: Option<i32>,
}

/// pKa of one titratable residue. `None` means unresolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SitePka {
    pub chain: String,
    pub res_name: String,
    pub res_number: i64,
    pub pka: Option<f64>,
}

impl SitePka {
    /// Residue identity used to deduplicate residue rows per protein.
    pub fn residue_key(&self) -> (&str, &str, i64) {
        (&self.chain, &self.res_name, self.res_number)
    }
}

/// Protonated structure written at the requested pH.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputStructure {
    pub pdb: String,
    pub ph: f64,
}

/// Normalized output of a successful computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TitrationReport {
    pub tit_x: Vec<f64>,
    pub tit_y: Vec<f64>,
    pub pkas: Vec<SitePka>,
    pub isoelectric_point: f64,
    /// Echoed parameter sets.
    pub parameters: ResolvedParameters,
    pub output_structure: Option<OutputStructure>,
}

/// Terminal outcome of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded(TitrationReport),
    Failed { error: String },
}

impl JobOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        JobOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Succeeded(_) => None,
            JobOutcome::Failed { error } => Some(error),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded(_) => "succeeded",
            JobOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub token: JobToken,
    pub submitted_at: DateTime<Utc>,
    /// Set once, by whoever observes the terminal outcome first.
    pub finished_at: Option<DateTime<Utc>>,
    pub email: Option<String>,
    pub provenance: Provenance,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProteinRecord {
    pub id: ProteinId,
    /// Public structure code, when the submission named one.
    pub natural_key: Option<String>,
    /// Uploaded structure, when the submission carried one.
    pub structure: Option<String>,
    pub counts: ProteinCounts,
}

/// Association between a job, its protein and the parameters used.
///
/// Failed runs keep a minimal row with no parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub job_id: JobId,
    pub protein_id: ProteinId,
    pub parameters: Option<ResolvedParameters>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: JobId,
    pub tit_x: Vec<f64>,
    pub tit_y: Vec<f64>,
    pub isoelectric_point: Option<f64>,
    pub output_structure: Option<String>,
    pub output_structure_ph: Option<f64>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn from_outcome(job_id: JobId, outcome: &JobOutcome) -> Self {
        let recorded_at = Utc::now();
        match outcome {
            JobOutcome::Succeeded(report) => Self {
                job_id,
                tit_x: report.tit_x.clone(),
                tit_y: report.tit_y.clone(),
                isoelectric_point: Some(report.isoelectric_point),
                output_structure: report.output_structure.as_ref().map(|o| o.pdb.clone()),
                output_structure_ph: report.output_structure.as_ref().map(|o| o.ph),
                error: None,
                recorded_at,
            },
            JobOutcome::Failed { error } => Self {
                job_id,
                tit_x: Vec::new(),
                tit_y: Vec::new(),
                isoelectric_point: None,
                output_structure: None,
                output_structure_ph: None,
                error: Some(error.clone()),
                recorded_at,
            },
        }
    }
}

/// One line of the recent-submissions listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionSummary {
    pub job_id: JobId,
    pub token: JobToken,
    pub submitted_at: DateTime<Utc>,
    /// Protein natural key, `None` for uploaded structures.
    pub protein_name: Option<String>,
    /// No Result yet.
    pub queued: bool,
}

/// Lifecycle store consumed by the dispatcher, the runner and the reporter.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Create the Job record at submission time.
    async fn create_job(&self, meta: &SubmissionMeta) -> Result<JobId>;

    /// Reuse the protein with `natural_key` if one exists, otherwise create one.
    /// Without a natural key a new protein is always created.
    async fn resolve_or_create_protein(
        &self,
        natural_key: Option<&str>,
        structure: Option<&str>,
        counts: ProteinCounts,
    ) -> Result<ProteinId>;

    /// Write the job's single Result, plus its Input row (minimal for failures)
    /// and, for successes, residue and pKa rows.
    ///
    /// Fails with [`PkaqError::ResultAlreadyRecorded`] if a Result exists.
    async fn record_result(
        &self,
        job_id: JobId,
        protein_id: ProteinId,
        outcome: &JobOutcome,
    ) -> Result<()>;

    /// Stamp the completion time. Returns false if it was already set.
    async fn finalize(&self, job_id: JobId) -> Result<bool>;

    async fn find_job(&self, token: &JobToken) -> Result<Option<JobRecord>>;

    async fn result_for(&self, job_id: JobId) -> Result<Option<ResultRecord>>;

    async fn input_for(&self, job_id: JobId) -> Result<Option<InputRecord>>;

    async fn protein(&self, protein_id: ProteinId) -> Result<Option<ProteinRecord>>;

    /// pKa rows ordered by chain, residue number, residue name.
    async fn pkas_for(&self, job_id: JobId) -> Result<Vec<SitePka>>;

    /// Jobs without a Result (newest first) followed by up to `limit`
    /// finished submissions ordered by token, descending.
    async fn recent_submissions(&self, limit: usize) -> Result<Vec<SubmissionSummary>>;
}

/// Record `outcome` unless a Result already exists.
///
/// Returns true if this call wrote the Result. Losing the race is not an error.
pub async fn record_result_once<S: LifecycleStore + ?Sized>(
    store: &S,
    job_id: JobId,
    protein_id: ProteinId,
    outcome: &JobOutcome,
) -> Result<bool> {
    match store.record_result(job_id, protein_id, outcome).await {
        Ok(()) => Ok(true),
        Err(PkaqError::ResultAlreadyRecorded(_)) => {
            warn!(job_id = %job_id, "Result already recorded by another writer");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Sort pKa rows the way every listing presents them.
pub fn sort_pkas(pkas: &mut [SitePka]) {
    pkas.sort_by(|a, b| {
        a.chain
            .cmp(&b.chain)
            .then(a.res_number.cmp(&b.res_number))
            .then(a.res_name.cmp(&b.res_name))
    });
}
