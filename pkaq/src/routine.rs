//! Seam to the scientific titration routine.
//!
//! The routine is synchronous and may run for hours; callers run it on a
//! blocking thread.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::job::JobToken;
use crate::params::{ParameterBag, ResolvedParameters};
use crate::runtime::ShutdownToken;

/// How often a running child process is checked for exit or abort.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Error raised by the routine. The message is what ends up in the Result.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct RoutineError(pub String);

impl RoutineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Per-run context handed to the routine.
#[derive(Clone, Debug)]
pub struct RoutineContext {
    pub token: JobToken,
    /// Isolated working directory for intermediate files.
    pub work_dir: PathBuf,
    /// Append-only live log read by the progress reporter.
    pub log_path: PathBuf,
    /// Set when the run must stop early, e.g. because the compute slot was
    /// lost. Long-running routines should check it between steps.
    pub abort: ShutdownToken,
}

/// One titratable site as reported by the routine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSite {
    pub chain: String,
    pub res_name: String,
    pub res_number: i64,
    /// `None` when the routine could not resolve a pKa.
    pub pka: Option<f64>,
}

/// Isoelectric point as the routine returns it.
///
/// Some routine versions add the bracketing limit and the net charge.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawIsoelectricPoint {
    Value(f64),
    WithDiagnostics(f64, f64, f64),
}

impl RawIsoelectricPoint {
    pub fn value(&self) -> f64 {
        match *self {
            RawIsoelectricPoint::Value(pi) => pi,
            RawIsoelectricPoint::WithDiagnostics(pi, _, _) => pi,
        }
    }
}

/// Unprocessed routine output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawTitration {
    /// Titration curve as `(pH, protonation)` samples.
    pub curve: Vec<(f64, f64)>,
    pub sites: Vec<RawSite>,
    #[serde(default)]
    pub parameters: ResolvedParameters,
    pub isoelectric_point: RawIsoelectricPoint,
}

/// The external scientific computation.
pub trait TitrationRoutine: Send + Sync + 'static {
    fn titrate(
        &self,
        parameters: &ParameterBag,
        ctx: &RoutineContext,
    ) -> Result<RawTitration, RoutineError>;

    /// Version string echoed with the parameters.
    fn version(&self) -> String {
        "unknown".to_string()
    }
}

/// Output document written by the external executable.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandOutput {
    Failed { error: String },
    Done(RawTitration),
}

/// Runs a titration executable as a child process.
///
/// The program is called as `<program> --parameters <file> --output <file>`
/// with both files inside the working directory. Its stdout and stderr are
/// appended to the live log. The child is killed when the run is aborted.
#[derive(Clone, Debug)]
pub struct CommandRoutine {
    program: PathBuf,
    version: String,
}

impl CommandRoutine {
    pub fn new(program: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            version: version.into(),
        }
    }

    fn wait(mut child: std::process::Child, ctx: &RoutineContext) -> Result<ExitStatus, RoutineError> {
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| RoutineError(format!("cannot wait for routine: {e}")))?
            {
                return Ok(status);
            }
            if ctx.abort.is_cancelled() {
                warn!(token = %ctx.token, pid = child.id(), "killing titration routine");
                // The child may exit on its own between the checks.
                let _ = child.kill();
                let _ = child.wait();
                return Err(RoutineError("titration aborted".to_string()));
            }
            std::thread::sleep(CHILD_POLL_INTERVAL);
        }
    }

    fn read_output(path: &Path) -> Result<Option<CommandOutput>, RoutineError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RoutineError(format!("cannot read routine output: {e}")))?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| RoutineError(format!("malformed routine output: {e}")))
    }
}

impl TitrationRoutine for CommandRoutine {
    fn titrate(
        &self,
        parameters: &ParameterBag,
        ctx: &RoutineContext,
    ) -> Result<RawTitration, RoutineError> {
        let params_path = ctx.work_dir.join("parameters.json");
        let output_path = ctx.work_dir.join("titration.json");

        let encoded = serde_json::to_vec_pretty(parameters)
            .map_err(|e| RoutineError(format!("cannot encode parameters: {e}")))?;
        std::fs::write(&params_path, encoded)
            .map_err(|e| RoutineError(format!("cannot write parameters: {e}")))?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ctx.log_path)
            .map_err(|e| RoutineError(format!("cannot open log: {e}")))?;
        let log_err = log
            .try_clone()
            .map_err(|e| RoutineError(format!("cannot open log: {e}")))?;

        info!(token = %ctx.token, program = %self.program.display(), "Launching titration routine");

        let child = Command::new(&self.program)
            .arg("--parameters")
            .arg(&params_path)
            .arg("--output")
            .arg(&output_path)
            .current_dir(&ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| RoutineError(format!("cannot start {}: {e}", self.program.display())))?;
        let status = Self::wait(child, ctx)?;

        debug!(token = %ctx.token, status = %status, "Titration routine exited");

        match Self::read_output(&output_path)? {
            Some(CommandOutput::Failed { error }) => Err(RoutineError(error)),
            Some(CommandOutput::Done(titration)) if status.success() => Ok(titration),
            _ => Err(RoutineError(format!("titration routine exited with {status}"))),
        }
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isoelectric_point_forms() {
        let plain: RawIsoelectricPoint = serde_json::from_str("7.42").unwrap();
        assert_eq!(plain.value(), 7.42);

        let triple: RawIsoelectricPoint = serde_json::from_str("[7.42, 0.5, -0.01]").unwrap();
        assert_eq!(triple, RawIsoelectricPoint::WithDiagnostics(7.42, 0.5, -0.01));
        assert_eq!(triple.value(), 7.42);
    }

    #[test]
    fn test_command_output_failure_document() {
        let out: CommandOutput = serde_json::from_str(r#"{"error": "bad structure"}"#).unwrap();
        assert!(matches!(out, CommandOutput::Failed { error } if error == "bad structure"));
    }

    #[test]
    fn test_command_output_success_document() {
        let out: CommandOutput = serde_json::from_str(
            r#"{
                "curve": [[0.0, 1.0], [14.0, -1.0]],
                "sites": [{"chain": "A", "res_name": "ASP", "res_number": 7, "pka": 3.91}],
                "isoelectric_point": 6.1
            }"#,
        )
        .unwrap();
        match out {
            CommandOutput::Done(t) => {
                assert_eq!(t.curve.len(), 2);
                assert_eq!(t.sites[0].pka, Some(3.91));
                assert!(t.parameters.general.is_empty());
            }
            CommandOutput::Failed { .. } => panic!("expected success"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_program_is_a_routine_error() {
        let dir = tempfile::tempdir().unwrap();
        let routine = CommandRoutine::new("/nonexistent/titrate", "0");
        let ctx = RoutineContext {
            token: JobToken::from("t"),
            work_dir: dir.path().to_path_buf(),
            log_path: dir.path().join("LOG_t"),
            abort: ShutdownToken::new(),
        };
        let err = routine.titrate(&ParameterBag::new(), &ctx).unwrap_err();
        assert!(err.0.contains("cannot start"));
    }

    #[cfg(unix)]
    #[test]
    fn test_abort_kills_running_program() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("titrate.sh");
        std::fs::write(&program, "#!/bin/sh\necho 'MC Run 1'\nsleep 30\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let routine = CommandRoutine::new(&program, "0");
        let ctx = RoutineContext {
            token: JobToken::from("t"),
            work_dir: dir.path().to_path_buf(),
            log_path: dir.path().join("LOG_t"),
            abort: ShutdownToken::new(),
        };
        let abort = ctx.abort.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            abort.cancel();
        });

        let started = std::time::Instant::now();
        let err = routine.titrate(&ParameterBag::new(), &ctx).unwrap_err();
        assert_eq!(err.0, "titration aborted");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(std::fs::read_to_string(dir.path().join("LOG_t"))
            .unwrap()
            .contains("MC Run 1"));
    }
}
