use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pkaq::*;

use crate::fixtures::sample_raw_titration;

/// What a [`ScriptedRoutine`] does for one call.
#[derive(Clone, Debug)]
pub enum Scripted {
    Succeed(RawTitration),
    Slow { duration_ms: u64, output: RawTitration },
    Fail { error: String },
    Panic,
}

/// A [`TitrationRoutine`] that plays back scripted behaviour.
///
/// Every call is logged in order, a few lines are appended to the live log,
/// and the highest number of overlapping calls is tracked.
#[derive(Clone)]
pub struct ScriptedRoutine {
    default: Scripted,
    per_token: Arc<Mutex<HashMap<String, Scripted>>>,
    log_lines: Vec<String>,
    writes_structure: bool,
    calls: Arc<Mutex<Vec<JobToken>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedRoutine {
    pub fn new(default: Scripted) -> Self {
        Self {
            default,
            per_token: Arc::new(Mutex::new(HashMap::new())),
            log_lines: vec![
                "PB Runs: 1/2".to_string(),
                "PB Runs: 2/2".to_string(),
                "MC Run: 1/1".to_string(),
            ],
            writes_structure: true,
            calls: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Succeeds with [`sample_raw_titration`].
    pub fn succeeding() -> Self {
        Self::new(Scripted::Succeed(sample_raw_titration()))
    }

    /// Succeeds with [`sample_raw_titration`] after `duration_ms`.
    pub fn slow(duration_ms: u64) -> Self {
        Self::new(Scripted::Slow {
            duration_ms,
            output: sample_raw_titration(),
        })
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self::new(Scripted::Fail {
            error: error.into(),
        })
    }

    pub fn panicking() -> Self {
        Self::new(Scripted::Panic)
    }

    /// Override the behaviour for one token.
    pub fn script(&self, token: &str, behaviour: Scripted) {
        self.per_token.lock().insert(token.to_string(), behaviour);
    }

    pub fn with_log_lines(mut self, lines: Vec<String>) -> Self {
        self.log_lines = lines;
        self
    }

    /// Succeed without writing the requested output structure.
    pub fn skipping_structure_output(mut self) -> Self {
        self.writes_structure = false;
        self
    }

    /// Tokens in the order the routine was called.
    pub fn calls(&self) -> Vec<JobToken> {
        self.calls.lock().clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn append_log(&self, ctx: &RoutineContext) {
        let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ctx.log_path)
        else {
            return;
        };
        for line in &self.log_lines {
            let _ = writeln!(file, "{line}");
        }
    }

    fn write_structure(&self, parameters: &ParameterBag) {
        if !self.writes_structure {
            return;
        }
        if let Some(request) = parameters.structure_output() {
            if let Some(parent) = request.path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::write(
                &request.path,
                format!("REMARK protonated at pH {}\nEND\n", request.ph),
            );
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TitrationRoutine for ScriptedRoutine {
    fn titrate(
        &self,
        parameters: &ParameterBag,
        ctx: &RoutineContext,
    ) -> Result<RawTitration, RoutineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push(ctx.token.clone());

        let behaviour = self
            .per_token
            .lock()
            .get(ctx.token.as_str())
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        self.append_log(ctx);
        match behaviour {
            Scripted::Succeed(output) => {
                self.write_structure(parameters);
                Ok(output)
            }
            Scripted::Slow {
                duration_ms,
                output,
            } => {
                std::thread::sleep(Duration::from_millis(duration_ms));
                self.write_structure(parameters);
                Ok(output)
            }
            Scripted::Fail { error } => Err(RoutineError::new(error)),
            Scripted::Panic => panic!("scripted routine panic"),
        }
    }

    fn version(&self) -> String {
        "scripted-1.0".to_string()
    }
}
