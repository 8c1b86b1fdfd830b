//! Answers "what is happening with job X right now".
//!
//! A terminal Result wins over everything else once the job has left the
//! queues; until then the live log is tailed and repeated solver progress
//! lines are collapsed.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use tracing::{debug, warn, Instrument};

use crate::cluster::{cluster_job_name, ClusterCli};
use crate::config::{DispatchMode, PkaqConfig, ProgressConfig};
use crate::error::Result;
use crate::job::{JobId, JobToken};
use crate::queue::AdmissionQueue;
use crate::store::{LifecycleStore, SitePka};
use crate::telemetry;

/// Whether a job is still queued or running somewhere.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_live(&self, token: &JobToken) -> Result<bool>;
}

/// Live while the token has an admission queue entry.
pub struct AdmissionProbe<Q: AdmissionQueue + ?Sized> {
    queue: Arc<Q>,
}

impl<Q: AdmissionQueue + ?Sized> AdmissionProbe<Q> {
    pub fn new(queue: Arc<Q>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl<Q: AdmissionQueue + ?Sized> LivenessProbe for AdmissionProbe<Q> {
    async fn is_live(&self, token: &JobToken) -> Result<bool> {
        self.queue.contains(token).await
    }
}

/// Live while the batch scheduler lists the job.
pub struct ClusterProbe<C: ClusterCli> {
    cli: Arc<C>,
    job_name_prefix: String,
}

impl<C: ClusterCli> ClusterProbe<C> {
    pub fn new(cli: Arc<C>, job_name_prefix: impl Into<String>) -> Self {
        Self {
            cli,
            job_name_prefix: job_name_prefix.into(),
        }
    }
}

#[async_trait]
impl<C: ClusterCli> LivenessProbe for ClusterProbe<C> {
    async fn is_live(&self, token: &JobToken) -> Result<bool> {
        self.cli
            .queue_contains(&cluster_job_name(&self.job_name_prefix, token))
            .await
    }
}

/// Live if any probe says so.
#[derive(Default)]
pub struct CompositeProbe {
    probes: Vec<Arc<dyn LivenessProbe>>,
}

impl CompositeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probes.push(probe);
        self
    }
}

#[async_trait]
impl LivenessProbe for CompositeProbe {
    async fn is_live(&self, token: &JobToken) -> Result<bool> {
        for probe in &self.probes {
            if probe.is_live(token).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Where the live log for a token lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogSource {
    /// `<work_root>/tmp_<token>/LOG_<token>`, written by the routine.
    WorkDir(PathBuf),
    /// `<dir>/<token>.out`, the cluster job's stdout.
    Submissions(PathBuf),
    /// Cluster runs: the routine's log under the shared work root, falling
    /// back to the cluster job's stdout until the routine has started.
    Cluster {
        work_root: PathBuf,
        submissions_dir: PathBuf,
    },
}

impl LogSource {
    /// The log source matching how `config` dispatches jobs.
    pub fn for_config(config: &PkaqConfig) -> Self {
        match config.dispatch {
            DispatchMode::Local => LogSource::WorkDir(config.runner.work_root.clone()),
            DispatchMode::Cluster | DispatchMode::PowerAwareCluster => LogSource::Cluster {
                work_root: config.runner.work_root.clone(),
                submissions_dir: config.cluster.submissions_dir.clone(),
            },
        }
    }

    /// The preferred log file for `token`.
    pub fn path_for(&self, token: &JobToken) -> PathBuf {
        match self {
            LogSource::WorkDir(root) | LogSource::Cluster { work_root: root, .. } => root
                .join(format!("tmp_{}", token))
                .join(format!("LOG_{}", token)),
            LogSource::Submissions(dir) => dir.join(format!("{}.out", token)),
        }
    }

    /// Files to try for `token`, most specific first.
    pub fn candidates(&self, token: &JobToken) -> Vec<PathBuf> {
        match self {
            LogSource::Cluster {
                submissions_dir, ..
            } => vec![
                self.path_for(token),
                LogSource::Submissions(submissions_dir.clone()).path_for(token),
            ],
            _ => vec![self.path_for(token)],
        }
    }
}

/// Failure details shown for a job whose Result carries an error.
#[derive(Clone, Debug, PartialEq)]
pub struct FailureSummary {
    pub error: String,
    pub nsites: Option<i32>,
    pub nchains: Option<i32>,
    pub protein_name: Option<String>,
    pub protein_pdb: Option<String>,
}

/// Everything shown for a successful job.
#[derive(Clone, Debug, PartialEq)]
pub struct SuccessSummary {
    pub tit_x: Vec<f64>,
    pub tit_y: Vec<f64>,
    pub pkas: Vec<SitePka>,
    pub isoelectric_point: f64,
    pub nsites: Option<i32>,
    pub nchains: Option<i32>,
    pub ph_min: Value,
    pub ph_max: Value,
    pub ionic_strength: Value,
    pub protein_dielectric: Value,
    pub solvent_dielectric: Value,
    /// All echoed parameters rendered for display.
    pub params: String,
    pub has_output_structure: bool,
    pub output_structure_ph: Option<f64>,
    pub protein_name: Option<String>,
    pub has_original_structure: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    /// Queued or running; `content` is the collapsed log, if any.
    Running { content: Option<String> },
    /// No record, no log.
    Unknown,
    Succeeded(Box<SuccessSummary>),
    Failed(FailureSummary),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded(_) | JobStatus::Failed(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub token: JobToken,
    pub status: JobStatus,
}

impl StatusReport {
    /// Wire document served to clients.
    ///
    /// Failures are reported with `status: "success"` and a failure payload,
    /// so clients poll one endpoint whatever the outcome.
    pub fn to_wire(&self) -> Value {
        match &self.status {
            JobStatus::Running { content } => json!({
                "content": content,
                "subID": self.token,
                "status": "running",
            }),
            JobStatus::Unknown => json!({
                "content": Value::Null,
                "subID": self.token,
                "status": "running",
            }),
            JobStatus::Failed(failure) => json!({
                "content": {"failed": true, "log": failure.error},
                "subID": self.token,
                "nsites": failure.nsites,
                "nchains": failure.nchains,
                "status": "success",
                "protein_name": failure.protein_name,
                "protein_pdb": failure.protein_pdb,
            }),
            JobStatus::Succeeded(summary) => {
                let pkas: Vec<Value> = summary
                    .pkas
                    .iter()
                    .map(|site| {
                        let pka = match site.pka {
                            Some(value) => json!(value),
                            None => json!("-"),
                        };
                        json!([site.chain, site.res_name, site.res_number, pka])
                    })
                    .collect();
                json!({
                    "content": {
                        "tit_x": summary.tit_x,
                        "tit_y": summary.tit_y,
                        "pKas": pkas,
                        "pI": summary.isoelectric_point,
                        "nsites": summary.nsites,
                        "nchains": summary.nchains,
                        "pHmin": summary.ph_min,
                        "pHmax": summary.ph_max,
                        "ionicStrength": summary.ionic_strength,
                        "proteinDielectric": summary.protein_dielectric,
                        "solventDielectric": summary.solvent_dielectric,
                        "params": summary.params,
                        "pdb_out": summary.has_output_structure,
                        "outputFilepH": summary.output_structure_ph,
                        "protein_name": summary.protein_name,
                        "original_pdb": summary.has_original_structure,
                    },
                    "subID": self.token,
                    "status": "success",
                })
            }
        }
    }
}

/// Collapse consecutive lines that start with the same progress prefix into
/// the latest one. Returns `None` for an empty log.
pub fn collapse_progress_lines(text: &str, prefixes: &[String]) -> Option<String> {
    let mut content: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let group = prefixes.iter().find(|p| line.starts_with(p.as_str()));
        let same_group = match (group, content.last()) {
            (Some(prefix), Some(last)) => last.starts_with(prefix.as_str()),
            _ => false,
        };
        match content.last_mut() {
            Some(last) if same_group => *last = line,
            _ => content.push(line),
        }
    }
    let joined = content.join("\n");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Read-only status lookups over the store, the queues and the live log.
pub struct ProgressReporter<S: LifecycleStore + ?Sized> {
    store: Arc<S>,
    probe: Arc<dyn LivenessProbe>,
    logs: LogSource,
    config: ProgressConfig,
}

impl<S: LifecycleStore + ?Sized> Clone for ProgressReporter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            probe: Arc::clone(&self.probe),
            logs: self.logs.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: LifecycleStore + ?Sized + 'static> ProgressReporter<S> {
    pub fn new(
        store: Arc<S>,
        probe: Arc<dyn LivenessProbe>,
        logs: LogSource,
        config: ProgressConfig,
    ) -> Self {
        Self {
            store,
            probe,
            logs,
            config,
        }
    }

    /// Pull form: one lookup.
    pub async fn status(&self, token: &JobToken) -> Result<StatusReport> {
        self.status_inner(token)
            .instrument(telemetry::status_span(token.as_str()))
            .await
    }

    async fn status_inner(&self, token: &JobToken) -> Result<StatusReport> {
        let job = self.store.find_job(token).await?;
        let live = match self.probe.is_live(token).await {
            Ok(live) => live,
            Err(e) => {
                warn!(token = %token, error = %e, "liveness probe failed");
                false
            }
        };

        if let Some(job) = &job {
            if !live {
                if let Some(status) = self.terminal_status(job.id).await? {
                    return Ok(StatusReport {
                        token: token.clone(),
                        status,
                    });
                }
            }
        }

        let mut content = None;
        for path in self.logs.candidates(token) {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    content = collapse_progress_lines(&text, &self.config.collapse_prefixes);
                    break;
                }
                Err(e) => debug!(token = %token, path = %path.display(), error = %e, "no live log"),
            }
        }

        let status = match (&job, content) {
            (None, None) => JobStatus::Unknown,
            (_, content) => JobStatus::Running { content },
        };
        Ok(StatusReport {
            token: token.clone(),
            status,
        })
    }

    async fn terminal_status(&self, job_id: JobId) -> Result<Option<JobStatus>> {
        let Some(result) = self.store.result_for(job_id).await? else {
            return Ok(None);
        };
        let input = self.store.input_for(job_id).await?;
        let protein = match input.as_ref().map(|i| i.protein_id) {
            Some(id) => self.store.protein(id).await?,
            None => None,
        };
        let (nsites, nchains, protein_name, protein_pdb) = match protein {
            Some(p) => (p.counts.nsites, p.counts.nchains, p.natural_key, p.structure),
            None => (None, None, None, None),
        };

        if let Some(error) = result.error {
            return Ok(Some(JobStatus::Failed(FailureSummary {
                error,
                nsites,
                nchains,
                protein_name,
                protein_pdb,
            })));
        }

        let pkas = self.store.pkas_for(job_id).await?;
        let Some(parameters) = input.and_then(|i| i.parameters) else {
            return Ok(None);
        };
        let Some(isoelectric_point) = result.isoelectric_point else {
            return Ok(None);
        };
        if result.tit_x.is_empty() || pkas.is_empty() {
            return Ok(None);
        }

        let mc = &parameters.monte_carlo;
        let pb = &parameters.poisson_boltzmann;
        let field = |set: &serde_json::Map<String, Value>, key: &str| {
            set.get(key).cloned().unwrap_or(Value::Null)
        };

        Ok(Some(JobStatus::Succeeded(Box::new(SuccessSummary {
            tit_x: result.tit_x,
            tit_y: result.tit_y,
            pkas,
            isoelectric_point,
            nsites,
            nchains,
            ph_min: field(mc, "pHmin"),
            ph_max: field(mc, "pHmax"),
            ionic_strength: field(pb, "ionicstr"),
            protein_dielectric: field(pb, "epsin"),
            solvent_dielectric: field(pb, "epssol"),
            params: serde_json::to_string_pretty(&parameters.merged())?,
            has_output_structure: result.output_structure.is_some(),
            output_structure_ph: result.output_structure_ph,
            protein_name,
            has_original_structure: protein_pdb.is_some(),
        }))))
    }

    /// Push form: re-run [`status`](Self::status) on the configured cadence.
    ///
    /// The stream ends after yielding the first terminal status, or when the
    /// consumer drops it.
    pub fn stream(&self, token: JobToken) -> impl Stream<Item = Result<StatusReport>> + Send + 'static {
        let mut interval = tokio::time::interval(self.config.stream_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stream::unfold(
            Some((self.clone(), token, interval)),
            |state| async move {
                let (reporter, token, mut interval) = state?;
                interval.tick().await;
                let report = reporter.status(&token).await;
                let finished = matches!(&report, Ok(r) if r.status.is_terminal());
                let next = (!finished).then_some((reporter, token, interval));
                Some((report, next))
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["PB Runs".to_string(), "MC Run".to_string()]
    }

    #[test]
    fn test_collapse_keeps_latest_line_per_run() {
        let log = "Start\nPB Runs: 1/10\nPB Runs: 2/10\nPB Runs: 10/10\nMC Run 1\nMC Run 2\nDone\n";
        assert_eq!(
            collapse_progress_lines(log, &prefixes()).as_deref(),
            Some("Start\nPB Runs: 10/10\nMC Run 2\nDone")
        );
    }

    #[test]
    fn test_collapse_leading_progress_line() {
        assert_eq!(
            collapse_progress_lines("MC Run 1\nMC Run 2", &prefixes()).as_deref(),
            Some("MC Run 2")
        );
    }

    #[test]
    fn test_collapse_empty_log() {
        assert_eq!(collapse_progress_lines("", &prefixes()), None);
    }

    #[test]
    fn test_log_source_paths() {
        let token = JobToken::from("abc");
        assert_eq!(
            LogSource::WorkDir(PathBuf::from("/tmp")).path_for(&token),
            PathBuf::from("/tmp/tmp_abc/LOG_abc")
        );
        assert_eq!(
            LogSource::Submissions(PathBuf::from("/srv/submissions")).path_for(&token),
            PathBuf::from("/srv/submissions/abc.out")
        );
        let cluster = LogSource::Cluster {
            work_root: PathBuf::from("/tmp"),
            submissions_dir: PathBuf::from("/srv/submissions"),
        };
        assert_eq!(
            cluster.candidates(&token),
            vec![
                PathBuf::from("/tmp/tmp_abc/LOG_abc"),
                PathBuf::from("/srv/submissions/abc.out")
            ]
        );
    }

    #[test]
    fn test_running_wire_format() {
        let report = StatusReport {
            token: JobToken::from("abc"),
            status: JobStatus::Unknown,
        };
        assert_eq!(
            report.to_wire(),
            json!({"content": null, "subID": "abc", "status": "running"})
        );
    }
}
