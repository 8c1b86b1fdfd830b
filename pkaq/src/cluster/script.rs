use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::runner::WorkItem;

const PARAMETERS_MARKER: &str = "PKAQ_PARAMETERS";

/// Inputs for one generated batch script.
#[derive(Clone, Debug)]
pub struct BatchScript<'a> {
    pub work: &'a WorkItem,
    /// Executable providing the `run-computation` entry point.
    pub program: &'a Path,
    /// Config file forwarded to the entry point.
    pub config: Option<&'a Path>,
}

/// Render a self-contained bash script for one job.
///
/// The parameter bag travels inside the script as a quoted heredoc, so the
/// script depends on nothing but the entry point executable.
pub fn render_script(batch: &BatchScript<'_>) -> Result<String> {
    let params = serde_json::to_string(&batch.work.parameters)?;
    let token = batch.work.token.as_str();

    let mut lines = vec![
        "#!/usr/bin/env bash".to_string(),
        "set -euo pipefail".to_string(),
        format!(
            "PARAMS_FILE=\"${{TMPDIR:-/tmp}}/pkaq_params_{}.json\"",
            file_safe(token)
        ),
        format!("cat > \"$PARAMS_FILE\" <<'{PARAMETERS_MARKER}'"),
        params,
        PARAMETERS_MARKER.to_string(),
    ];

    let mut command = vec![shell_escape(&batch.program.to_string_lossy())];
    if let Some(config) = batch.config {
        command.push("--config".to_string());
        command.push(shell_escape(&config.to_string_lossy()));
    }
    command.extend([
        "run-computation".to_string(),
        "--parameters".to_string(),
        "\"$PARAMS_FILE\"".to_string(),
        "--token".to_string(),
        shell_escape(token),
        "--job-id".to_string(),
        batch.work.job_id.to_string(),
        "--protein-id".to_string(),
        batch.work.protein_id.to_string(),
    ]);
    lines.push(command.join(" "));

    Ok(lines.join("\n") + "\n")
}

/// Write the script and mark it executable.
pub fn write_script(path: &Path, contents: &str) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(path.to_path_buf())
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:@".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobToken, ProteinId};
    use crate::params::ParameterBag;

    fn work() -> WorkItem {
        let mut parameters = ParameterBag::new();
        parameters.insert("pH", "0,14").insert("epsin", 15);
        WorkItem {
            token: JobToken::from("2024010112000012345"),
            job_id: JobId(7),
            protein_id: ProteinId(3),
            parameters,
        }
    }

    #[test]
    fn test_script_invokes_entry_point_with_identifiers() {
        let work = work();
        let script = render_script(&BatchScript {
            work: &work,
            program: Path::new("/opt/pkaq/bin/pkaq"),
            config: Some(Path::new("/etc/pkaq.toml")),
        })
        .unwrap();

        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.contains(r#"{"epsin":15,"pH":"0,14"}"#));
        let last = script.lines().last().unwrap();
        assert_eq!(
            last,
            "/opt/pkaq/bin/pkaq --config /etc/pkaq.toml run-computation --parameters \"$PARAMS_FILE\" \
             --token 2024010112000012345 --job-id 7 --protein-id 3"
        );
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("plain/path"), "plain/path");
        assert_eq!(shell_escape("with space"), "'with space'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_write_script_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/slurm_t.sh");
        write_script(&path, "#!/usr/bin/env bash\n").unwrap();
        assert!(path.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
