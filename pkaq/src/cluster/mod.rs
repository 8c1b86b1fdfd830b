//! Batch cluster dispatch: script generation, the scheduler CLI seam and the
//! submit-and-poll dispatcher.

use serde::{Deserialize, Serialize};

use crate::job::JobToken;

pub mod cli;
pub mod dispatcher;
pub mod script;

pub use cli::{ClusterCli, SlurmCli, SubmitRequest};
pub use dispatcher::{ClusterDispatcher, PERMANENT_FAILURE_PREFIX, TIME_LIMIT_MESSAGE};
pub use script::{render_script, BatchScript};

/// Dispatch behaviour selected by deployment configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStrategy {
    /// Submit, wait, detect timeouts.
    Plain,
    /// Also wake powered-down nodes and resubmit jobs evicted before running.
    PowerAware,
}

/// Name the cluster job carries; status queries filter on it.
pub fn cluster_job_name(prefix: &str, token: &JobToken) -> String {
    format!("{}{}", prefix, token)
}
