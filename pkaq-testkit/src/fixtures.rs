use std::path::Path;

use pkaq::*;

/// A three-residue fragment, enough to pass submission validation.
pub const SAMPLE_STRUCTURE: &str = "\
ATOM      1  N   LYS A   1      11.104   6.134  -6.504  1.00  0.00           N
ATOM      2  CA  LYS A   1      11.639   6.071  -5.147  1.00  0.00           C
ATOM      3  N   GLU A   2      10.320   4.968  -3.330  1.00  0.00           N
ATOM      4  CA  GLU A   2       9.926   3.749  -2.627  1.00  0.00           C
ATOM      5  N   ASP A   3       8.812   2.977  -0.619  1.00  0.00           N
ATOM      6  CA  ASP A   3       8.449   1.717   0.048  1.00  0.00           C
END
";

/// A pKa sweep from 0 to 14 with default dielectrics.
pub fn sample_request() -> SubmissionRequest {
    SubmissionRequest {
        token: None,
        structure: SAMPLE_STRUCTURE.to_string(),
        structure_code: None,
        input_naming: "AMBER".to_string(),
        ph_min: 0.0,
        ph_max: 14.0,
        ph_step: 0.25,
        protein_dielectric: 15.0,
        solvent_dielectric: 80.0,
        ionic_strength: 0.1,
        output_pkas: true,
        output_structure: None,
        email: None,
        nsites: None,
        nchains: None,
        provenance: Provenance::default(),
    }
}

/// [`sample_request`] with a client-supplied token.
pub fn sample_request_with_token(token: &str) -> SubmissionRequest {
    SubmissionRequest {
        token: Some(JobToken::new(token)),
        ..sample_request()
    }
}

/// What a routine returns for the sample structure.
pub fn sample_raw_titration() -> RawTitration {
    let general = serde_json::json!({
        "ncpus": 16,
        "structure": "/structures/sample.pdb",
        "ffinput": "AMBER",
        "epsin": 15.0,
        "ionicstr": 0.1,
    });
    let monte_carlo = serde_json::json!({ "pH_values": "0.0,14.0", "pHstep": 0.25 });
    RawTitration {
        curve: vec![(0.0, 3.0), (7.0, 1.2), (14.0, -2.0)],
        sites: vec![
            RawSite {
                chain: "A".to_string(),
                res_name: "LYS".to_string(),
                res_number: 1,
                pka: Some(10.4321),
            },
            RawSite {
                chain: "A".to_string(),
                res_name: "GLU".to_string(),
                res_number: 2,
                pka: Some(4.256),
            },
            RawSite {
                chain: "A".to_string(),
                res_name: "ASP".to_string(),
                res_number: 3,
                pka: None,
            },
        ],
        parameters: ResolvedParameters {
            general: general.as_object().cloned().unwrap_or_default(),
            poisson_boltzmann: serde_json::Map::new(),
            monte_carlo: monte_carlo.as_object().cloned().unwrap_or_default(),
        },
        isoelectric_point: RawIsoelectricPoint::Value(7.2468),
    }
}

/// A successful report as the runner would normalize [`sample_raw_titration`].
pub fn sample_report() -> TitrationReport {
    TitrationReport {
        tit_x: vec![0.0, 7.0, 14.0],
        tit_y: vec![3.0, 1.2, -2.0],
        pkas: vec![
            SitePka {
                chain: "A".to_string(),
                res_name: "LYS".to_string(),
                res_number: 1,
                pka: Some(10.43),
            },
            SitePka {
                chain: "A".to_string(),
                res_name: "GLU".to_string(),
                res_number: 2,
                pka: Some(4.26),
            },
        ],
        isoelectric_point: 7.25,
        parameters: ResolvedParameters::default(),
        output_structure: None,
    }
}

/// Runner directories rooted under `root`, all created.
pub fn runner_config(root: &Path) -> RunnerConfig {
    let config = RunnerConfig {
        work_root: root.join("work"),
        structures_dir: root.join("structures"),
        structures_out_dir: root.join("structures_out"),
        titrations_dir: root.join("titrations"),
        pkas_dir: root.join("pkas"),
        ncpus: 2,
        routine_version: "test".to_string(),
        ..RunnerConfig::default()
    };
    for dir in [
        &config.work_root,
        &config.structures_dir,
        &config.structures_out_dir,
        &config.titrations_dir,
        &config.pkas_dir,
    ] {
        let _ = std::fs::create_dir_all(dir);
    }
    config
}

/// Admission settings with millisecond polling for tests.
pub fn fast_admission() -> AdmissionConfig {
    AdmissionConfig {
        poll_interval_ms: 10,
        max_wait_ms: 10_000,
        lease_ttl_ms: 400,
        renew_at_fraction: 0.5,
        renew_min_margin_ms: 50,
        housekeeper_interval_ms: 50,
    }
}

/// Cluster settings with millisecond polling, writing under `root`.
pub fn fast_cluster(root: &Path) -> ClusterConfig {
    ClusterConfig {
        poll_interval_ms: 10,
        max_wait_ms: 5_000,
        submissions_dir: root.join("submissions"),
        power_on_timeout_ms: 2_000,
        resubmit: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_backoff_ms: 5,
        },
        ..ClusterConfig::default()
    }
}
