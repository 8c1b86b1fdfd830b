//! Parameter bags handed to the titration routine and the parameter sets it
//! reports back.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// General-set keys kept when echoing the parameters actually used.
pub const ECHOED_GENERAL_KEYS: &[&str] = &[
    "CpHMD_mode",
    "ffID",
    "ff_family",
    "ffinput",
    "clean_pdb",
    "LIPIDS",
    "keep_ions",
    "ser_thr_titration",
    "cutoff",
    "slice",
];

/// Opaque key/value parameters for one computation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterBag(Map<String, Value>);

impl ParameterBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// The output structure request, if one was made.
    ///
    /// Encoded as `[path, pH, naming]`.
    pub fn structure_output(&self) -> Option<StructureOutput> {
        let items = self.0.get("structure_output")?.as_array()?;
        let path = items.first()?.as_str()?;
        let ph = items.get(1)?.as_f64()?;
        let naming = items
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(StructureOutput {
            path: PathBuf::from(path),
            ph,
            naming,
        })
    }
}

impl From<Map<String, Value>> for ParameterBag {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

/// Where and at which pH to write a protonated output structure.
#[derive(Clone, Debug, PartialEq)]
pub struct StructureOutput {
    pub path: PathBuf,
    pub ph: f64,
    pub naming: String,
}

/// The three parameter sets the routine reports it actually used.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParameters {
    #[serde(default)]
    pub general: Map<String, Value>,
    #[serde(default)]
    pub poisson_boltzmann: Map<String, Value>,
    #[serde(default)]
    pub monte_carlo: Map<String, Value>,
}

impl ResolvedParameters {
    /// Reduce the sets to what gets persisted alongside a successful run.
    ///
    /// The general set keeps only [`ECHOED_GENERAL_KEYS`] plus `version`;
    /// `pH_values` in the Monte Carlo set always becomes a list.
    pub fn echo(&self, version: &str) -> ResolvedParameters {
        let mut general: Map<String, Value> = self
            .general
            .iter()
            .filter(|(key, _)| ECHOED_GENERAL_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        general.insert("version".to_string(), Value::from(version));

        let mut monte_carlo = self.monte_carlo.clone();
        if let Some(values) = monte_carlo.get_mut("pH_values") {
            if !values.is_array() {
                *values = Value::Array(vec![values.take()]);
            }
        }

        ResolvedParameters {
            general,
            poisson_boltzmann: self.poisson_boltzmann.clone(),
            monte_carlo,
        }
    }

    /// All sets flattened into one map; later sets win on key clashes.
    pub fn merged(&self) -> Map<String, Value> {
        let mut all = self.general.clone();
        all.extend(self.poisson_boltzmann.clone());
        all.extend(self.monte_carlo.clone());
        all
    }

    pub fn monte_carlo_f64(&self, key: &str) -> Option<f64> {
        self.monte_carlo.get(key).and_then(Value::as_f64)
    }

    pub fn poisson_boltzmann_f64(&self, key: &str) -> Option<f64> {
        self.poisson_boltzmann.get(key).and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_structure_output_parsed() {
        let mut bag = ParameterBag::new();
        bag.insert("structure_output", json!(["/out/out_x.pdb", 7.0, "amber"]));
        let out = bag.structure_output().unwrap();
        assert_eq!(out.path, PathBuf::from("/out/out_x.pdb"));
        assert_eq!(out.ph, 7.0);
        assert_eq!(out.naming, "amber");

        assert!(ParameterBag::new().structure_output().is_none());
    }

    #[test]
    fn test_echo_filters_general_set() {
        let resolved = ResolvedParameters {
            general: map(json!({
                "ffID": "G54A7",
                "ncpus": 16,
                "keep_ions": true,
                "structure": "/tmp/x.pdb"
            })),
            poisson_boltzmann: map(json!({"epsin": 15.0})),
            monte_carlo: map(json!({"pH_values": 7.0, "pHmin": 0.0})),
        };

        let echo = resolved.echo("2.9.0");
        assert_eq!(
            Value::Object(echo.general),
            json!({"ffID": "G54A7", "keep_ions": true, "version": "2.9.0"})
        );
        assert_eq!(echo.monte_carlo["pH_values"], json!([7.0]));
        assert_eq!(echo.poisson_boltzmann["epsin"], json!(15.0));
    }

    #[test]
    fn test_echo_keeps_ph_list() {
        let resolved = ResolvedParameters {
            monte_carlo: map(json!({"pH_values": [1.0, 2.0]})),
            ..Default::default()
        };
        assert_eq!(resolved.echo("v").monte_carlo["pH_values"], json!([1.0, 2.0]));
    }

    #[test]
    fn test_merged_precedence() {
        let resolved = ResolvedParameters {
            general: map(json!({"a": 1, "b": 1})),
            poisson_boltzmann: map(json!({"b": 2})),
            monte_carlo: map(json!({"c": 3})),
        };
        assert_eq!(
            Value::Object(resolved.merged()),
            json!({"a": 1, "b": 2, "c": 3})
        );
    }
}
