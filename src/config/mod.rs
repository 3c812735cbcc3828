mod force_params;

use std::path::Path;

use log::warn;
use serde::Deserialize;
use serde::Serialize;
use serde_yaml::Mapping;
use serde_yaml::Value;

pub use force_params::ForceId;
pub use force_params::ForceParams;

use crate::error::ConfigError;

/// Keys accepted under a component's `parameters:` section.
const COMPONENT_KEYS: &[&str] = &[
    "rtrunc", "rcom", "indexing", "com", "comlog", "tidal", "nlevel", "keypos",
    "EJ", "nEJkeep", "nEJwant", "EJkinE", "EJext", "EJdiag", "EJdamp",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunParameters {
    #[serde(default = "default_nsteps")]
    pub nsteps: usize,
    #[serde(default = "default_dtime")]
    pub dtime: f64,
    #[serde(default)]
    pub multistep: usize,
    #[serde(default = "default_nthreads")]
    pub nthreads: usize,
    /// Rebalance interval in outer steps; 0 disables.
    #[serde(default)]
    pub nbalance: usize,
    /// Per-rank work rates for the initial distribution and rebalance
    /// targets; uniform when empty.
    #[serde(default)]
    pub rates: Vec<f64>,
}

fn default_nsteps() -> usize {
    1
}
fn default_dtime() -> f64 {
    0.01
}
fn default_nthreads() -> usize {
    1
}

impl Default for RunParameters {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogParameters {
    #[serde(default)]
    pub verbosity: Option<usize>,
    #[serde(default)]
    pub only_main_rank: Option<bool>,
}

/// Per-component behavior switches (§ `parameters:`). Orientation (`EJ*`)
/// keys are recognized for compatibility; the estimator itself lives
/// outside this code and only its center offset is consumed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct ComponentParams {
    #[serde(default = "default_infinite")]
    pub rtrunc: f64,
    #[serde(default = "default_infinite")]
    pub rcom: f64,
    #[serde(default)]
    pub indexing: bool,
    #[serde(default)]
    pub com: bool,
    #[serde(default)]
    pub comlog: bool,
    #[serde(default)]
    pub tidal: bool,
    #[serde(default)]
    pub nlevel: i64,
    /// Index of the integer attribute gating escape flagging.
    #[serde(default)]
    pub keypos: Option<usize>,
    #[serde(default)]
    pub EJ: i64,
    #[serde(default)]
    pub nEJkeep: i64,
    #[serde(default)]
    pub nEJwant: i64,
    #[serde(default)]
    pub EJkinE: bool,
    #[serde(default)]
    pub EJext: bool,
    #[serde(default)]
    pub EJdiag: bool,
    #[serde(default = "default_one")]
    pub EJdamp: f64,
}

fn default_infinite() -> f64 {
    f64::INFINITY
}
fn default_one() -> f64 {
    1.0
}

impl Default for ComponentParams {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

#[derive(Clone, Debug)]
pub struct ForceConfig {
    pub id: ForceId,
    pub params: ForceParams,
}

#[derive(Clone, Debug)]
pub struct ComponentConfig {
    pub name: String,
    pub bodyfile: Option<String>,
    pub params: ComponentParams,
    pub force: ForceConfig,
}

#[derive(Clone, Debug, Default)]
pub struct SimulationConfig {
    pub run: RunParameters,
    pub logging: LogParameters,
    pub components: Vec<ComponentConfig>,
    pub strict: bool,
}

/// A path override applied to the YAML document before extraction, e.g.
/// `simulation/dtime:0.005` from the command line.
#[derive(Clone, Debug)]
pub struct Override {
    pub keys: Vec<String>,
    pub value: Value,
}

impl std::str::FromStr for Override {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once(':')
            .ok_or_else(|| format!("expected key:value, found `{s}`"))?;
        let keys = path.split('/').map(|k| k.to_owned()).collect();
        let value = serde_yaml::from_str(value)
            .map_err(|e| format!("could not parse override value `{value}`: {e}"))?;
        Ok(Override { keys, value })
    }
}

impl SimulationConfig {
    pub fn from_file(path: &Path, overrides: &[Override]) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::MissingKey {
            key: path.display().to_string(),
            fragment: format!("could not read configuration file: {e}"),
        })?;
        Self::from_str(&contents, overrides)
    }

    pub fn from_str(contents: &str, overrides: &[Override]) -> Result<Self, ConfigError> {
        let mut root: Value = serde_yaml::from_str(contents)?;
        if root.is_null() {
            root = Value::Mapping(Mapping::new());
        }
        for o in overrides {
            apply_override(&mut root, o)?;
        }

        let strict = section(&root, "strict")
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);
        let run: RunParameters = extract_section(&root, "simulation")?;
        let logging: LogParameters = extract_section(&root, "logging")?;

        let mut components = vec![];
        if let Some(list) = section(&root, "components") {
            let list = list.as_sequence().ok_or_else(|| ConfigError::MissingKey {
                key: "components".into(),
                fragment: fragment_of(list),
            })?;
            for entry in list {
                components.push(parse_component(entry, strict)?);
            }
        }

        Ok(Self {
            run,
            logging,
            components,
            strict,
        })
    }
}

fn section<'a>(root: &'a Value, name: &str) -> Option<&'a Value> {
    root.as_mapping()?.get(name)
}

fn fragment_of(value: &Value) -> String {
    serde_yaml::to_string(value).unwrap_or_else(|_| "<unprintable>".into())
}

fn extract_section<T: for<'de> Deserialize<'de>>(
    root: &Value,
    name: &str,
) -> Result<T, ConfigError> {
    match section(root, name) {
        // Re-serialize so the section deserializes with its own defaults.
        Some(value) => serde_yaml::from_str(&serde_yaml::to_string(value).unwrap())
            .map_err(ConfigError::Parse),
        None => serde_yaml::from_str("{}").map_err(ConfigError::Parse),
    }
}

fn parse_component(entry: &Value, strict: bool) -> Result<ComponentConfig, ConfigError> {
    let mapping = entry.as_mapping().ok_or_else(|| ConfigError::MissingKey {
        key: "components[]".into(),
        fragment: fragment_of(entry),
    })?;
    let name = mapping
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ConfigError::MissingKey {
            key: "name".into(),
            fragment: fragment_of(entry),
        })?
        .to_owned();
    let bodyfile = mapping
        .get("bodyfile")
        .and_then(|v| v.as_str())
        .map(|s| s.to_owned());

    let params_value = mapping.get("parameters").cloned().unwrap_or_default();
    let filtered = check_keys(&params_value, COMPONENT_KEYS, strict)?;
    let params: ComponentParams =
        serde_yaml::from_str(&serde_yaml::to_string(&filtered).unwrap())?;

    let force_value = mapping.get("force").ok_or_else(|| ConfigError::MissingKey {
        key: "force".into(),
        fragment: fragment_of(entry),
    })?;
    let force = parse_force(force_value, strict)?;

    Ok(ComponentConfig {
        name,
        bodyfile,
        params,
        force,
    })
}

fn parse_force(value: &Value, strict: bool) -> Result<ForceConfig, ConfigError> {
    let mapping = value.as_mapping().ok_or_else(|| ConfigError::MissingKey {
        key: "force".into(),
        fragment: fragment_of(value),
    })?;
    let id_str = mapping
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ConfigError::MissingKey {
            key: "force.id".into(),
            fragment: fragment_of(value),
        })?;
    let id = ForceId::from_name(id_str)
        .ok_or_else(|| ConfigError::UnknownForce(id_str.to_owned()))?;

    let params_value = mapping.get("parameters").cloned().unwrap_or_default();
    let filtered = check_keys(&params_value, force_params::FORCE_KEYS, strict)?;
    let params: ForceParams =
        serde_yaml::from_str(&serde_yaml::to_string(&filtered).unwrap())?;
    Ok(ForceConfig { id, params })
}

/// Unknown keys are a hard error in strict mode and a logged warning
/// otherwise (the key is dropped either way).
fn check_keys(value: &Value, known: &[&str], strict: bool) -> Result<Value, ConfigError> {
    let Some(mapping) = value.as_mapping() else {
        return Ok(Value::Mapping(Mapping::new()));
    };
    let mut filtered = Mapping::new();
    for (key, entry) in mapping {
        let key_str = key.as_str().unwrap_or_default();
        if known.contains(&key_str) {
            filtered.insert(key.clone(), entry.clone());
        } else if strict {
            return Err(ConfigError::UnknownKey {
                key: key_str.to_owned(),
                fragment: fragment_of(value),
            });
        } else {
            warn!("ignoring unknown parameter key `{key_str}`");
        }
    }
    Ok(Value::Mapping(filtered))
}

fn apply_override(root: &mut Value, o: &Override) -> Result<(), ConfigError> {
    let mut cursor = root;
    for key in &o.keys[..o.keys.len() - 1] {
        let mapping = cursor
            .as_mapping_mut()
            .ok_or_else(|| ConfigError::MissingKey {
                key: key.clone(),
                fragment: "override path does not address a mapping".into(),
            })?;
        let entry = Value::String(key.clone());
        if !mapping.contains_key(&entry) {
            mapping.insert(entry.clone(), Value::Mapping(Mapping::new()));
        }
        cursor = mapping.get_mut(&entry).unwrap();
    }
    let last = o.keys.last().unwrap();
    let mapping = cursor
        .as_mapping_mut()
        .ok_or_else(|| ConfigError::MissingKey {
            key: last.clone(),
            fragment: "override path does not address a mapping".into(),
        })?;
    mapping.insert(Value::String(last.clone()), o.value.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "
simulation:
  nsteps: 10
  dtime: 0.05
  multistep: 2
components:
  - name: halo
    bodyfile: halo.bods
    parameters:
      rtrunc: 5.0
      indexing: true
    force:
      id: sphereSL
      parameters:
        Lmax: 4
        nmax: 10
        rmax: 5.0
";

    #[test]
    fn parses_components_and_sections() {
        let config = SimulationConfig::from_str(EXAMPLE, &[]).unwrap();
        assert_eq!(config.run.nsteps, 10);
        assert_eq!(config.run.multistep, 2);
        assert_eq!(config.components.len(), 1);
        let comp = &config.components[0];
        assert_eq!(comp.name, "halo");
        assert_eq!(comp.params.rtrunc, 5.0);
        assert!(comp.params.indexing);
        assert_eq!(comp.force.id, ForceId::SphereSL);
        assert_eq!(comp.force.params.Lmax, 4);
    }

    #[test]
    fn missing_force_is_an_error() {
        let text = "
components:
  - name: bare
";
        assert!(matches!(
            SimulationConfig::from_str(text, &[]),
            Err(ConfigError::MissingKey { .. })
        ));
    }

    #[test]
    fn unknown_force_id_is_an_error() {
        let text = "
components:
  - name: x
    force:
      id: directsum
";
        assert!(matches!(
            SimulationConfig::from_str(text, &[]),
            Err(ConfigError::UnknownForce(_))
        ));
    }

    #[test]
    fn unknown_keys_fail_only_in_strict_mode() {
        let text = "
strict: STRICT
components:
  - name: halo
    parameters:
      bogus_key: 1
    force:
      id: sphereSL
";
        let lenient = text.replace("STRICT", "false");
        assert!(SimulationConfig::from_str(&lenient, &[]).is_ok());
        let strict = text.replace("STRICT", "true");
        assert!(matches!(
            SimulationConfig::from_str(&strict, &[]),
            Err(ConfigError::UnknownKey { .. })
        ));
    }

    #[test]
    fn overrides_rewrite_the_document() {
        let o: Override = "simulation/dtime:0.5".parse().unwrap();
        let config = SimulationConfig::from_str(EXAMPLE, &[o]).unwrap();
        assert_eq!(config.run.dtime, 0.5);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = SimulationConfig::from_str("", &[]).unwrap();
        assert_eq!(config.run.nsteps, 1);
        assert!(config.components.is_empty());
    }
}
