//! Submission intake: validation, token assignment, structure storage and
//! the parameter bag handed to the titration routine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::RunnerConfig;
use crate::error::{PkaqError, Result};
use crate::job::{JobToken, Provenance, SubmissionMeta};
use crate::params::ParameterBag;
use crate::store::ProteinCounts;

/// Protonated output structure requested with a submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputStructureRequest {
    pub ph: f64,
    /// Residue naming scheme of the written structure.
    pub naming: String,
}

/// A titration request as received from the transport layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    /// Client-supplied token; generated when absent.
    #[serde(default)]
    pub token: Option<JobToken>,
    /// Structure file contents (PDB).
    pub structure: String,
    /// Public structure identifier, used to deduplicate proteins.
    #[serde(default)]
    pub structure_code: Option<String>,
    /// Residue naming scheme of the input structure.
    pub input_naming: String,
    pub ph_min: f64,
    pub ph_max: f64,
    pub ph_step: f64,
    pub protein_dielectric: f64,
    pub solvent_dielectric: f64,
    pub ionic_strength: f64,
    /// Sweep `ph_min..ph_max` for pKa values.
    pub output_pkas: bool,
    #[serde(default)]
    pub output_structure: Option<OutputStructureRequest>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub nsites: Option<i32>,
    #[serde(default)]
    pub nchains: Option<i32>,
    #[serde(default)]
    pub provenance: Provenance,
}

impl SubmissionRequest {
    /// Reject malformed input before anything is stored or queued.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PkaqError::InvalidSubmission(msg.to_string()));

        if let Some(token) = &self.token {
            if !token.is_file_safe() {
                return invalid("token may only contain letters, digits, '-' and '_'");
            }
        }
        if self.structure.trim().is_empty() {
            return invalid("structure is empty");
        }
        if !self
            .structure
            .lines()
            .any(|l| l.starts_with("ATOM ") || l.starts_with("HETATM"))
        {
            return invalid("structure has no ATOM records");
        }
        if !self.output_pkas && self.output_structure.is_none() {
            return invalid("neither pKa values nor an output structure were requested");
        }
        if self.output_pkas {
            if !(self.ph_min.is_finite() && self.ph_max.is_finite()) || self.ph_min > self.ph_max {
                return invalid("pH range is inverted or not finite");
            }
            if !(self.ph_step > 0.0) {
                return invalid("pH step must be positive");
            }
        }
        if !(self.protein_dielectric > 0.0 && self.solvent_dielectric > 0.0) {
            return invalid("dielectric constants must be positive");
        }
        if !(self.ionic_strength >= 0.0) {
            return invalid("ionic strength must not be negative");
        }
        if self.input_naming.trim().is_empty() {
            return invalid("input naming scheme is missing");
        }
        if let Some(out) = &self.output_structure {
            if !out.ph.is_finite() {
                return invalid("output structure pH is not finite");
            }
        }
        Ok(())
    }

    /// The pH argument: the sweep range when pKas are requested, else the
    /// fixed output pH.
    pub fn ph_argument(&self) -> String {
        match (&self.output_structure, self.output_pkas) {
            (Some(out), false) => out.ph.to_string(),
            _ => format!("{},{}", self.ph_min, self.ph_max),
        }
    }

    /// Build the parameter bag for a structure stored at `structure_path`.
    pub fn parameters(
        &self,
        token: &JobToken,
        structure_path: &Path,
        runner: &RunnerConfig,
    ) -> ParameterBag {
        let mut bag = ParameterBag::new();
        bag.insert("structure", structure_path.to_string_lossy().into_owned())
            .insert("pH", self.ph_argument())
            .insert("pHstep", self.ph_step)
            .insert("epsin", self.protein_dielectric)
            .insert("epssol", self.solvent_dielectric)
            .insert("ionicstr", self.ionic_strength)
            .insert("ffinput", self.input_naming.clone())
            .insert("scaleM", 2)
            .insert("convergence", 0.1)
            .insert("pbc_dimensions", 0)
            .insert("ncpus", runner.ncpus)
            .insert("clean", true)
            .insert("keep_ions", true)
            .insert("ser_thr_titration", false)
            .insert(
                "titration_output",
                runner
                    .titrations_dir
                    .join(format!("titration_{}.out", token))
                    .to_string_lossy()
                    .into_owned(),
            )
            .insert(
                "output",
                runner
                    .pkas_dir
                    .join(format!("pKas_{}.out", token))
                    .to_string_lossy()
                    .into_owned(),
            );
        if let Some(out) = &self.output_structure {
            bag.insert(
                "structure_output",
                json!([
                    runner.output_structure_path(token).to_string_lossy(),
                    out.ph,
                    out.naming
                ]),
            );
        }
        bag
    }

    pub fn counts(&self) -> ProteinCounts {
        ProteinCounts {
            nchains: self.nchains,
            nsites: self.nsites,
        }
    }
}

/// A validated submission with its token fixed and structure on disk.
#[derive(Clone, Debug)]
pub struct PreparedSubmission {
    pub meta: SubmissionMeta,
    pub structure_path: PathBuf,
    pub parameters: ParameterBag,
    pub natural_key: Option<String>,
    pub structure: String,
    pub counts: ProteinCounts,
}

/// Write `structure` as `<dir>/<token>.pdb`, appending `_` to the token until
/// the file name is free. Returns the token actually used.
///
/// The file is created with `create_new`, so two submissions racing for the
/// same token never end up with the same file.
pub async fn save_structure(
    dir: &Path,
    token: JobToken,
    structure: &str,
) -> Result<(JobToken, PathBuf)> {
    tokio::fs::create_dir_all(dir).await?;
    let mut token = token;
    loop {
        let path = dir.join(format!("{}.pdb", token));
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match opened {
            Ok(mut file) => {
                file.write_all(structure.as_bytes()).await?;
                file.flush().await?;
                debug!(token = %token, path = %path.display(), "structure saved");
                return Ok((token, path));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                token = token.disambiguated();
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Validate, assign the token and store the structure.
pub async fn prepare(request: SubmissionRequest, runner: &RunnerConfig) -> Result<PreparedSubmission> {
    request.validate()?;

    let candidate = request.token.clone().unwrap_or_else(JobToken::generate);
    let (token, structure_path) =
        save_structure(&runner.structures_dir, candidate, &request.structure).await?;
    let parameters = request.parameters(&token, &structure_path, runner);

    let mut meta = SubmissionMeta::new(token);
    meta.email = request.email.clone().filter(|e| !e.trim().is_empty());
    meta.provenance = request.provenance.clone();

    Ok(PreparedSubmission {
        meta,
        structure_path,
        parameters,
        natural_key: request
            .structure_code
            .clone()
            .filter(|code| !code.trim().is_empty()),
        counts: request.counts(),
        structure: request.structure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn request() -> SubmissionRequest {
        SubmissionRequest {
            token: None,
            structure: "ATOM      1  N   ASP A   7      11.1  12.2  13.3  1.00  0.00\nEND\n".into(),
            structure_code: Some("1abc".into()),
            input_naming: "PDB".into(),
            ph_min: 0.0,
            ph_max: 14.0,
            ph_step: 0.25,
            protein_dielectric: 15.0,
            solvent_dielectric: 80.0,
            ionic_strength: 0.1,
            output_pkas: true,
            output_structure: None,
            email: None,
            nsites: Some(1),
            nchains: Some(1),
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        assert!(request().validate().is_ok());

        let cases: Vec<Box<dyn Fn(&mut SubmissionRequest)>> = vec![
            Box::new(|r| r.structure = "   ".into()),
            Box::new(|r| r.structure = "REMARK nothing here\n".into()),
            Box::new(|r| {
                r.ph_min = 10.0;
                r.ph_max = 2.0;
            }),
            Box::new(|r| r.ph_step = 0.0),
            Box::new(|r| r.protein_dielectric = -1.0),
            Box::new(|r| r.ionic_strength = -0.1),
            Box::new(|r| r.output_pkas = false),
            Box::new(|r| r.token = Some("../etc/passwd".into())),
            Box::new(|r| r.token = Some("".into())),
        ];
        for mutate in cases {
            let mut r = request();
            mutate(&mut r);
            assert!(matches!(r.validate(), Err(PkaqError::InvalidSubmission(_))));
        }
    }

    #[test]
    fn test_parameters_for_pka_sweep() {
        let runner = RunnerConfig::default();
        let token = JobToken::from("tok");
        let bag = request().parameters(&token, Path::new("/s/tok.pdb"), &runner);
        assert_eq!(bag.get("pH").unwrap(), "0,14");
        assert_eq!(bag.get("scaleM").unwrap(), 2);
        assert_eq!(bag.get("clean").unwrap(), true);
        assert_eq!(bag.get("ser_thr_titration").unwrap(), false);
        assert_eq!(bag.get("ncpus").unwrap(), 16);
        assert!(bag.structure_output().is_none());
    }

    #[test]
    fn test_parameters_for_fixed_ph_structure() {
        let runner = RunnerConfig::default();
        let token = JobToken::from("tok");
        let mut r = request();
        r.output_pkas = false;
        r.output_structure = Some(OutputStructureRequest {
            ph: 7.5,
            naming: "AMBER".into(),
        });
        let bag = r.parameters(&token, Path::new("/s/tok.pdb"), &runner);
        assert_eq!(bag.get("pH").unwrap(), "7.5");
        let out = bag.structure_output().unwrap();
        assert_eq!(out.path, runner.output_structure_path(&token));
        assert_eq!(out.ph, 7.5);
        assert_eq!(out.naming, "AMBER");
    }

    #[tokio::test]
    async fn test_save_structure_disambiguates() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = save_structure(dir.path(), "t".into(), "A").await.unwrap();
        let (second, path) = save_structure(dir.path(), "t".into(), "B").await.unwrap();
        let (third, _) = save_structure(dir.path(), "t".into(), "C").await.unwrap();
        assert_eq!(first.as_str(), "t");
        assert_eq!(second.as_str(), "t_");
        assert_eq!(third.as_str(), "t__");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "B");
    }

    #[tokio::test]
    async fn test_concurrent_saves_never_share_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let saves = (0..16).map(|i| {
            let dir = dir.path().to_path_buf();
            tokio::spawn(async move {
                save_structure(&dir, "dup".into(), &format!("S{i}")).await.unwrap()
            })
        });
        let saved = futures::future::join_all(saves).await;

        let mut tokens = std::collections::HashSet::new();
        for joined in saved {
            let (token, path) = joined.unwrap();
            assert!(tokens.insert(token));
            assert!(std::fs::read_to_string(path).unwrap().starts_with('S'));
        }
        assert_eq!(tokens.len(), 16);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 16);
    }
}
