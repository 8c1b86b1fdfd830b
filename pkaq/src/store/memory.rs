use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{
    sort_pkas, InputRecord, JobOutcome, JobRecord, LifecycleStore, ProteinCounts, ProteinRecord,
    ResultRecord, SitePka, SubmissionSummary,
};
use crate::error::{PkaqError, Result};
use crate::job::{JobId, JobToken, ProteinId, SubmissionMeta};

#[derive(Clone, Debug)]
struct ResidueRow {
    id: i64,
    protein_id: ProteinId,
    chain: String,
    res_name: String,
    res_number: i64,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    jobs: BTreeMap<JobId, JobRecord>,
    by_token: HashMap<JobToken, JobId>,
    proteins: BTreeMap<ProteinId, ProteinRecord>,
    residues: Vec<ResidueRow>,
    inputs: HashMap<JobId, InputRecord>,
    pkas: HashMap<JobId, Vec<(i64, Option<f64>)>>,
    results: HashMap<JobId, ResultRecord>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn residue_id(&mut self, protein_id: ProteinId, site: &SitePka) -> i64 {
        if let Some(row) = self.residues.iter().find(|r| {
            r.protein_id == protein_id
                && (r.chain.as_str(), r.res_name.as_str(), r.res_number) == site.residue_key()
        }) {
            return row.id;
        }
        let id = self.next_id();
        self.residues.push(ResidueRow {
            id,
            protein_id,
            chain: site.chain.clone(),
            res_name: site.res_name.clone(),
            res_number: site.res_number,
        });
        id
    }
}

/// Lifecycle store kept in process memory.
///
/// All writes for one call happen under a single lock, so `record_result`
/// is an atomic compare-and-set.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLifecycleStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of Result rows across all jobs.
    pub fn result_count(&self) -> usize {
        self.tables.lock().results.len()
    }

    /// Number of residue rows for a protein.
    pub fn residue_count(&self, protein_id: ProteinId) -> usize {
        self.tables
            .lock()
            .residues
            .iter()
            .filter(|r| r.protein_id == protein_id)
            .count()
    }
}

#[async_trait]
impl LifecycleStore for InMemoryLifecycleStore {
    async fn create_job(&self, meta: &SubmissionMeta) -> Result<JobId> {
        let mut tables = self.tables.lock();
        if tables.by_token.contains_key(&meta.token) {
            return Err(PkaqError::Store(format!("token {} already in use", meta.token)));
        }
        let id = JobId(tables.next_id());
        tables.jobs.insert(
            id,
            JobRecord {
                id,
                token: meta.token.clone(),
                submitted_at: meta.submitted_at,
                finished_at: None,
                email: meta.email.clone(),
                provenance: meta.provenance.clone(),
            },
        );
        tables.by_token.insert(meta.token.clone(), id);
        Ok(id)
    }

    async fn resolve_or_create_protein(
        &self,
        natural_key: Option<&str>,
        structure: Option<&str>,
        counts: ProteinCounts,
    ) -> Result<ProteinId> {
        let mut tables = self.tables.lock();
        if let Some(key) = natural_key {
            if let Some(existing) = tables
                .proteins
                .values()
                .find(|p| p.natural_key.as_deref() == Some(key))
            {
                return Ok(existing.id);
            }
        }
        let id = ProteinId(tables.next_id());
        tables.proteins.insert(
            id,
            ProteinRecord {
                id,
                natural_key: natural_key.map(str::to_string),
                structure: structure.map(str::to_string),
                counts,
            },
        );
        Ok(id)
    }

    async fn record_result(
        &self,
        job_id: JobId,
        protein_id: ProteinId,
        outcome: &JobOutcome,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        if !tables.jobs.contains_key(&job_id) {
            return Err(PkaqError::Store(format!("no job with id {}", job_id)));
        }
        if tables.results.contains_key(&job_id) {
            return Err(PkaqError::ResultAlreadyRecorded(job_id));
        }

        let parameters = match outcome {
            JobOutcome::Succeeded(report) => {
                let mut rows = Vec::with_capacity(report.pkas.len());
                for site in &report.pkas {
                    let res_id = tables.residue_id(protein_id, site);
                    rows.push((res_id, site.pka));
                }
                tables.pkas.insert(job_id, rows);
                Some(report.parameters.clone())
            }
            JobOutcome::Failed { .. } => None,
        };

        tables.inputs.insert(
            job_id,
            InputRecord {
                job_id,
                protein_id,
                parameters,
            },
        );
        tables
            .results
            .insert(job_id, ResultRecord::from_outcome(job_id, outcome));
        Ok(())
    }

    async fn finalize(&self, job_id: JobId) -> Result<bool> {
        let mut tables = self.tables.lock();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| PkaqError::Store(format!("no job with id {}", job_id)))?;
        if job.finished_at.is_some() {
            return Ok(false);
        }
        job.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn find_job(&self, token: &JobToken) -> Result<Option<JobRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .by_token
            .get(token)
            .and_then(|id| tables.jobs.get(id))
            .cloned())
    }

    async fn result_for(&self, job_id: JobId) -> Result<Option<ResultRecord>> {
        Ok(self.tables.lock().results.get(&job_id).cloned())
    }

    async fn input_for(&self, job_id: JobId) -> Result<Option<InputRecord>> {
        Ok(self.tables.lock().inputs.get(&job_id).cloned())
    }

    async fn protein(&self, protein_id: ProteinId) -> Result<Option<ProteinRecord>> {
        Ok(self.tables.lock().proteins.get(&protein_id).cloned())
    }

    async fn pkas_for(&self, job_id: JobId) -> Result<Vec<SitePka>> {
        let tables = self.tables.lock();
        let mut pkas: Vec<SitePka> = tables
            .pkas
            .get(&job_id)
            .map(|rows| {
                rows.iter()
                    .filter_map(|(res_id, pka)| {
                        tables.residues.iter().find(|r| r.id == *res_id).map(|r| SitePka {
                            chain: r.chain.clone(),
                            res_name: r.res_name.clone(),
                            res_number: r.res_number,
                            pka: *pka,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        sort_pkas(&mut pkas);
        Ok(pkas)
    }

    async fn recent_submissions(&self, limit: usize) -> Result<Vec<SubmissionSummary>> {
        let tables = self.tables.lock();

        let mut queued: Vec<SubmissionSummary> = tables
            .jobs
            .values()
            .filter(|job| !tables.results.contains_key(&job.id))
            .map(|job| SubmissionSummary {
                job_id: job.id,
                token: job.token.clone(),
                submitted_at: job.submitted_at,
                protein_name: None,
                queued: true,
            })
            .collect();
        queued.reverse();

        let mut finished: Vec<SubmissionSummary> = tables
            .inputs
            .values()
            .filter_map(|input| {
                let job = tables.jobs.get(&input.job_id)?;
                let protein = tables.proteins.get(&input.protein_id);
                Some(SubmissionSummary {
                    job_id: job.id,
                    token: job.token.clone(),
                    submitted_at: job.submitted_at,
                    protein_name: protein.and_then(|p| p.natural_key.clone()),
                    queued: false,
                })
            })
            .collect();
        finished.sort_by(|a, b| b.token.as_str().cmp(a.token.as_str()));
        finished.truncate(limit);

        queued.extend(finished);
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ResolvedParameters;
    use crate::store::TitrationReport;

    fn report(pkas: Vec<SitePka>) -> JobOutcome {
        JobOutcome::Succeeded(TitrationReport {
            tit_x: vec![0.0, 7.0, 14.0],
            tit_y: vec![10.0, 2.0, -8.0],
            pkas,
            isoelectric_point: 7.42,
            parameters: ResolvedParameters::default(),
            output_structure: None,
        })
    }

    fn site(chain: &str, name: &str, number: i64, pka: Option<f64>) -> SitePka {
        SitePka {
            chain: chain.into(),
            res_name: name.into(),
            res_number: number,
            pka,
        }
    }

    #[tokio::test]
    async fn test_failed_result_writes_minimal_input() {
        let store = InMemoryLifecycleStore::new();
        let job = store.create_job(&SubmissionMeta::new("t1".into())).await.unwrap();
        let protein = store
            .resolve_or_create_protein(None, Some("ATOM"), ProteinCounts::default())
            .await
            .unwrap();

        store
            .record_result(job, protein, &JobOutcome::failed("bad structure"))
            .await
            .unwrap();

        let input = store.input_for(job).await.unwrap().unwrap();
        assert_eq!(input.protein_id, protein);
        assert!(input.parameters.is_none());
        let result = store.result_for(job).await.unwrap().unwrap();
        assert_eq!(result.error.as_deref(), Some("bad structure"));
    }

    #[tokio::test]
    async fn test_second_result_rejected() {
        let store = InMemoryLifecycleStore::new();
        let job = store.create_job(&SubmissionMeta::new("t1".into())).await.unwrap();
        let protein = store
            .resolve_or_create_protein(None, None, ProteinCounts::default())
            .await
            .unwrap();

        store.record_result(job, protein, &report(vec![])).await.unwrap();
        let err = store
            .record_result(job, protein, &JobOutcome::failed("late"))
            .await
            .unwrap_err();
        assert!(err.is_already_recorded());
        assert!(store.result_for(job).await.unwrap().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_residues_deduplicated_and_pkas_sorted() {
        let store = InMemoryLifecycleStore::new();
        let protein = store
            .resolve_or_create_protein(Some("1abc"), None, ProteinCounts::default())
            .await
            .unwrap();
        let first = store.create_job(&SubmissionMeta::new("t1".into())).await.unwrap();
        let second = store.create_job(&SubmissionMeta::new("t2".into())).await.unwrap();

        let sites = vec![
            site("B", "LYS", 3, Some(10.4)),
            site("A", "GLU", 20, None),
            site("A", "ASP", 7, Some(3.91)),
        ];
        store.record_result(first, protein, &report(sites.clone())).await.unwrap();
        store.record_result(second, protein, &report(sites)).await.unwrap();

        assert_eq!(store.residue_count(protein), 3);
        let pkas = store.pkas_for(second).await.unwrap();
        let order: Vec<_> = pkas.iter().map(|p| (p.chain.as_str(), p.res_number)).collect();
        assert_eq!(order, vec![("A", 7), ("A", 20), ("B", 3)]);
        assert_eq!(pkas[1].pka, None);
    }

    #[tokio::test]
    async fn test_finalize_once() {
        let store = InMemoryLifecycleStore::new();
        let job = store.create_job(&SubmissionMeta::new("t1".into())).await.unwrap();
        assert!(store.finalize(job).await.unwrap());
        assert!(!store.finalize(job).await.unwrap());
        assert!(store
            .find_job(&"t1".into())
            .await
            .unwrap()
            .unwrap()
            .finished_at
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_token_rejected() {
        let store = InMemoryLifecycleStore::new();
        store.create_job(&SubmissionMeta::new("t1".into())).await.unwrap();
        assert!(store.create_job(&SubmissionMeta::new("t1".into())).await.is_err());
    }
}
