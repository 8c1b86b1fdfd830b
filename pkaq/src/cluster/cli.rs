use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{PkaqError, Result};

/// One batch submission.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitRequest {
    pub script: PathBuf,
    pub job_name: String,
    pub cores: u32,
    pub partition: String,
    pub time_limit_minutes: Option<u32>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// The batch scheduler's command-line surface.
#[async_trait]
pub trait ClusterCli: Send + Sync {
    /// Submit a script. Returns the scheduler's job id.
    async fn submit(&self, request: &SubmitRequest) -> Result<String>;

    /// Whether a job named `job_name` is pending or running.
    async fn queue_contains(&self, job_name: &str) -> Result<bool>;

    /// Nodes currently idle and powered on.
    async fn idle_node_count(&self) -> Result<u32>;

    /// Idle nodes that are powered down.
    async fn powered_down_nodes(&self) -> Result<Vec<String>>;

    async fn power_on(&self, node: &str) -> Result<()>;

    async fn cancel(&self, job_id: &str) -> Result<()>;
}

/// [`ClusterCli`] backed by the Slurm tools on `PATH`.
#[derive(Clone, Debug, Default)]
pub struct SlurmCli {
    /// Restrict queue queries to this user's jobs.
    user: Option<String>,
}

impl SlurmCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
        }
    }

    async fn run(program: &str, args: &[String]) -> Result<String> {
        debug!(program, ?args, "running cluster command");
        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PkaqError::Cluster(format!("cannot run {program}: {e}")))?;
        if !out.status.success() {
            return Err(PkaqError::Cluster(format!(
                "{program} failed ({}): {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn node_states(&self) -> Result<Vec<(String, String)>> {
        let args = ["-h", "-N", "-o", "%N %t"].map(String::from);
        let text = Self::run("sinfo", &args).await?;
        Ok(parse_node_states(&text))
    }
}

/// Build the `sbatch` argument list for a request.
pub fn sbatch_args(request: &SubmitRequest) -> Vec<String> {
    let mut args = vec![
        "--parsable".to_string(),
        "--job-name".to_string(),
        request.job_name.clone(),
        "--partition".to_string(),
        request.partition.clone(),
        "--nodes".to_string(),
        "1".to_string(),
        "--ntasks".to_string(),
        request.cores.to_string(),
        "--output".to_string(),
        request.stdout.to_string_lossy().into_owned(),
        "--error".to_string(),
        request.stderr.to_string_lossy().into_owned(),
    ];
    if let Some(minutes) = request.time_limit_minutes {
        args.push("--time".to_string());
        args.push(minutes.to_string());
    }
    args.push(request.script.to_string_lossy().into_owned());
    args
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
pub fn parse_sbatch_id(stdout: &str) -> Option<String> {
    let raw = stdout.trim();
    let id = raw.split(';').next().unwrap_or(raw).trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Parse `sinfo -h -N -o "%N %t"` into `(node, state)` pairs.
///
/// A node listed in several partitions appears once.
pub fn parse_node_states(text: &str) -> Vec<(String, String)> {
    let mut nodes: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(node), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };
        if nodes.iter().all(|(n, _)| n != node) {
            nodes.push((node.to_string(), state.to_string()));
        }
    }
    nodes
}

/// Powered-on idle nodes. Suffixes such as `~` (powered off) or `#`
/// (powering up) mean the node cannot take work yet.
pub fn count_idle(nodes: &[(String, String)]) -> u32 {
    nodes.iter().filter(|(_, state)| state == "idle").count() as u32
}

pub fn powered_down(nodes: &[(String, String)]) -> Vec<String> {
    nodes
        .iter()
        .filter(|(_, state)| state == "idle~")
        .map(|(node, _)| node.clone())
        .collect()
}

#[async_trait]
impl ClusterCli for SlurmCli {
    async fn submit(&self, request: &SubmitRequest) -> Result<String> {
        let stdout = Self::run("sbatch", &sbatch_args(request)).await?;
        parse_sbatch_id(&stdout)
            .ok_or_else(|| PkaqError::Cluster(format!("unexpected sbatch output: {stdout:?}")))
    }

    async fn queue_contains(&self, job_name: &str) -> Result<bool> {
        let mut args = vec![
            "-h".to_string(),
            "-o".to_string(),
            "%j".to_string(),
            "--name".to_string(),
            job_name.to_string(),
        ];
        if let Some(user) = &self.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        let text = Self::run("squeue", &args).await?;
        Ok(text.lines().any(|line| line.trim() == job_name))
    }

    async fn idle_node_count(&self) -> Result<u32> {
        Ok(count_idle(&self.node_states().await?))
    }

    async fn powered_down_nodes(&self) -> Result<Vec<String>> {
        Ok(powered_down(&self.node_states().await?))
    }

    async fn power_on(&self, node: &str) -> Result<()> {
        let args = vec![
            "update".to_string(),
            format!("NodeName={node}"),
            "State=POWER_UP".to_string(),
        ];
        Self::run("scontrol", &args).await.map(|_| ())
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        Self::run("scancel", &[job_id.to_string()]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sbatch_id() {
        assert_eq!(parse_sbatch_id("12345\n").as_deref(), Some("12345"));
        assert_eq!(parse_sbatch_id("12345;cluster\n").as_deref(), Some("12345"));
        assert_eq!(parse_sbatch_id("  \n"), None);
    }

    #[test]
    fn test_node_state_parsing() {
        let nodes = parse_node_states("n1 idle\nn2 alloc\nn3 idle~\nn1 idle\nn4 idle#\ngarbage\n");
        assert_eq!(nodes.len(), 4);
        assert_eq!(count_idle(&nodes), 1);
        assert_eq!(powered_down(&nodes), vec!["n3".to_string()]);
    }

    #[test]
    fn test_sbatch_args() {
        let request = SubmitRequest {
            script: PathBuf::from("/s/slurm_t.sh"),
            job_name: "pkaq_t".into(),
            cores: 16,
            partition: "debug".into(),
            time_limit_minutes: Some(90),
            stdout: PathBuf::from("/s/t.out"),
            stderr: PathBuf::from("/s/t.err"),
        };
        let args = sbatch_args(&request);
        assert_eq!(args.first().map(String::as_str), Some("--parsable"));
        assert_eq!(args.last().map(String::as_str), Some("/s/slurm_t.sh"));
        let joined = args.join(" ");
        assert!(joined.contains("--partition debug"));
        assert!(joined.contains("--ntasks 16"));
        assert!(joined.contains("--output /s/t.out"));
        assert!(joined.contains("--time 90"));
    }
}
