//! Wraps the titration routine so a computation failure never escapes as a
//! crash of the orchestrating process.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn, Instrument};

use crate::config::RunnerConfig;
use crate::error::Result;
use crate::job::{JobId, JobToken, ProteinId};
use crate::params::ParameterBag;
use crate::routine::{RawTitration, RoutineContext, TitrationRoutine};
use crate::runtime::ShutdownToken;
use crate::store::{
    record_result_once, JobOutcome, LifecycleStore, OutputStructure, SitePka, TitrationReport,
};
use crate::telemetry;

/// Everything needed to compute and persist one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub token: JobToken,
    pub job_id: JobId,
    pub protein_id: ProteinId,
    pub parameters: ParameterBag,
}

/// A computation that did not produce a report. The message is user-facing.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct RunFailure(pub String);

/// Round to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Runs the routine in an isolated working directory.
pub struct ComputationRunner<R: TitrationRoutine> {
    routine: Arc<R>,
    config: RunnerConfig,
}

impl<R: TitrationRoutine> Clone for ComputationRunner<R> {
    fn clone(&self) -> Self {
        Self {
            routine: Arc::clone(&self.routine),
            config: self.config.clone(),
        }
    }
}

impl<R: TitrationRoutine> ComputationRunner<R> {
    pub fn new(routine: R, config: RunnerConfig) -> Self {
        Self {
            routine: Arc::new(routine),
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one computation.
    ///
    /// The working directory `<work_root>/tmp_<token>` is created first and
    /// left in place afterwards, whatever the outcome.
    pub async fn run(
        &self,
        token: &JobToken,
        parameters: &ParameterBag,
    ) -> std::result::Result<TitrationReport, RunFailure> {
        self.run_until(token, parameters, &ShutdownToken::new()).await
    }

    /// Like [`run`](Self::run), handing `abort` to the routine so it can
    /// stop early.
    pub async fn run_until(
        &self,
        token: &JobToken,
        parameters: &ParameterBag,
        abort: &ShutdownToken,
    ) -> std::result::Result<TitrationReport, RunFailure> {
        let work_dir = self.config.work_dir(token);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| RunFailure(format!("cannot create {}: {e}", work_dir.display())))?;

        let ctx = RoutineContext {
            token: token.clone(),
            work_dir,
            log_path: self.config.log_path(token),
            abort: abort.clone(),
        };

        info!(token = %token, "titration started");
        let timing = telemetry::record_run_start(token.as_str());

        let routine = Arc::clone(&self.routine);
        let bag = parameters.clone();
        let joined = tokio::task::spawn_blocking(move || routine.titrate(&bag, &ctx))
            .instrument(telemetry::run_span(token.as_str()))
            .await;

        let result = match joined {
            Ok(Ok(raw)) => self.normalize(raw, parameters).await,
            Ok(Err(e)) => Err(RunFailure(e.0)),
            Err(join_err) if join_err.is_panic() => {
                error!(token = %token, "titration routine panicked");
                Err(RunFailure("titration routine panicked".to_string()))
            }
            Err(join_err) => Err(RunFailure(join_err.to_string())),
        };

        telemetry::record_run_end(
            timing,
            if result.is_ok() { "succeeded" } else { "failed" },
        );
        if let Err(failure) = &result {
            warn!(token = %token, error = %failure, "titration failed");
        }
        result
    }

    async fn normalize(
        &self,
        raw: RawTitration,
        parameters: &ParameterBag,
    ) -> std::result::Result<TitrationReport, RunFailure> {
        let (tit_x, tit_y): (Vec<f64>, Vec<f64>) = raw.curve.into_iter().unzip();
        let pkas = raw
            .sites
            .into_iter()
            .map(|site| SitePka {
                chain: site.chain,
                res_name: site.res_name,
                res_number: site.res_number,
                pka: site.pka.map(round2),
            })
            .collect();

        let output_structure = match parameters.structure_output() {
            Some(request) => {
                let pdb = tokio::fs::read_to_string(&request.path).await.map_err(|e| {
                    RunFailure(format!(
                        "output structure {} not produced: {e}",
                        request.path.display()
                    ))
                })?;
                Some(OutputStructure {
                    pdb,
                    ph: request.ph,
                })
            }
            None => None,
        };

        Ok(TitrationReport {
            tit_x,
            tit_y,
            pkas,
            isoelectric_point: round2(raw.isoelectric_point.value()),
            parameters: raw.parameters.echo(&self.routine.version()),
            output_structure,
        })
    }
}

/// Run one work item and persist its outcome.
///
/// A Result written concurrently by a timeout detector wins; this run's
/// outcome is then logged and dropped.
pub async fn run_computation<R, S>(
    runner: &ComputationRunner<R>,
    store: &S,
    work: &WorkItem,
) -> Result<JobOutcome>
where
    R: TitrationRoutine,
    S: LifecycleStore + ?Sized,
{
    run_computation_until(runner, store, work, &ShutdownToken::new()).await
}

/// [`run_computation`] with an abort signal for the routine.
pub async fn run_computation_until<R, S>(
    runner: &ComputationRunner<R>,
    store: &S,
    work: &WorkItem,
    abort: &ShutdownToken,
) -> Result<JobOutcome>
where
    R: TitrationRoutine,
    S: LifecycleStore + ?Sized,
{
    let outcome = match runner.run_until(&work.token, &work.parameters, abort).await {
        Ok(report) => JobOutcome::Succeeded(report),
        Err(failure) => JobOutcome::failed(failure.0),
    };

    let written = record_result_once(store, work.job_id, work.protein_id, &outcome).await?;
    if !written {
        warn!(token = %work.token, outcome = outcome.label(), "discarding outcome, result already recorded");
    }
    store.finalize(work.job_id).await?;
    telemetry::record_job_finished(work.token.as_str(), outcome.label());
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round2() {
        assert_eq!(round2(3.14159), 3.14);
        assert_eq!(round2(7.4261), 7.43);
        assert_eq!(round2(-1.004), -1.0);
    }
}
