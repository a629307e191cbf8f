use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use synthguard_telemetry::TelemetryConfig;
use thiserror::Error;

use crate::compliance::{RuleCatalog, RuleDefinition};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

impl FromStr for ConfigFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(format!("unknown config format `{other}` (auto, toml, yaml)")),
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Toml => "toml",
            Self::Yaml => "yaml",
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub disclosure: DisclosureConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Total epsilon/delta a dataset may spend over its lifetime.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DatasetPolicy {
    pub epsilon_total: f64,
    pub delta_total: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct BudgetConfig {
    #[serde(default = "default_reservation_ttl_ms")]
    pub reservation_ttl_ms: u64,
    #[serde(default = "default_epsilon_total")]
    pub default_epsilon_total: f64,
    #[serde(default = "default_delta_total")]
    pub default_delta_total: f64,
    /// Per-dataset totals; datasets not listed use the defaults above.
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetPolicy>,
}

const fn default_reservation_ttl_ms() -> u64 {
    300_000
}

const fn default_epsilon_total() -> f64 {
    1.0
}

const fn default_delta_total() -> f64 {
    1e-5
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: default_reservation_ttl_ms(),
            default_epsilon_total: default_epsilon_total(),
            default_delta_total: default_delta_total(),
            datasets: BTreeMap::new(),
        }
    }
}

impl BudgetConfig {
    pub fn policy_for(&self, dataset_id: &str) -> DatasetPolicy {
        self.datasets
            .get(dataset_id)
            .copied()
            .unwrap_or(DatasetPolicy {
                epsilon_total: self.default_epsilon_total,
                delta_total: self.default_delta_total,
            })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DisclosureConfig {
    /// Minimum distinct sensitive values per equivalence class.
    #[serde(default = "default_l_diversity_min")]
    pub l_diversity_min: u64,
    /// Maximum total-variation distance between a class and the batch.
    #[serde(default = "default_t_closeness_max")]
    pub t_closeness_max: f64,
    /// Batches whose smallest class is at or below this size are rejected
    /// before compliance runs.
    #[serde(default)]
    pub k_floor: u64,
    /// Class sizes below this count are only reported with noise.
    #[serde(default = "default_min_reportable_count")]
    pub min_reportable_count: u64,
    #[serde(default = "default_count_noise_epsilon")]
    pub count_noise_epsilon: f64,
}

const fn default_l_diversity_min() -> u64 {
    2
}

const fn default_t_closeness_max() -> f64 {
    0.2
}

const fn default_min_reportable_count() -> u64 {
    5
}

const fn default_count_noise_epsilon() -> f64 {
    1.0
}

impl Default for DisclosureConfig {
    fn default() -> Self {
        Self {
            l_diversity_min: default_l_diversity_min(),
            t_closeness_max: default_t_closeness_max(),
            k_floor: 0,
            min_reportable_count: default_min_reportable_count(),
            count_noise_epsilon: default_count_noise_epsilon(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ComplianceConfig {
    #[serde(default = "default_include_builtin")]
    pub include_builtin: bool,
    /// Rule sets loaded at startup. A set named after a built-in framework
    /// replaces the built-in rules.
    #[serde(default)]
    pub frameworks: Vec<FrameworkRules>,
}

const fn default_include_builtin() -> bool {
    true
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            include_builtin: default_include_builtin(),
            frameworks: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FrameworkRules {
    pub framework: String,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AuditConfig {
    /// JSON-lines log; the trail stays in memory when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let budget = &self.budget;
        if budget.reservation_ttl_ms == 0 {
            return Err(ConfigError::Validation(
                "budget reservation ttl must be greater than zero".into(),
            ));
        }
        check_totals("default", budget.default_epsilon_total, budget.default_delta_total)?;
        for (dataset_id, policy) in &budget.datasets {
            check_totals(dataset_id, policy.epsilon_total, policy.delta_total)?;
        }

        let disclosure = &self.disclosure;
        if !(0.0..=1.0).contains(&disclosure.t_closeness_max) {
            return Err(ConfigError::Validation(
                "disclosure t-closeness-max must be within [0, 1]".into(),
            ));
        }
        if !(disclosure.count_noise_epsilon.is_finite() && disclosure.count_noise_epsilon > 0.0) {
            return Err(ConfigError::Validation(
                "disclosure count-noise-epsilon must be a positive number".into(),
            ));
        }

        RuleCatalog::from_config(&self.compliance)
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            budget: BudgetConfig {
                datasets: BTreeMap::from([(
                    "patients_v1".to_owned(),
                    DatasetPolicy {
                        epsilon_total: 1.0,
                        delta_total: 1e-5,
                    },
                )]),
                ..BudgetConfig::default()
            },
            disclosure: DisclosureConfig::default(),
            compliance: ComplianceConfig::default(),
            audit: AuditConfig {
                log_path: Some(PathBuf::from("var/audit.jsonl")),
            },
            telemetry: TelemetryConfig::sample("http://localhost:4318"),
        }
    }
}

fn check_totals(name: &str, epsilon_total: f64, delta_total: f64) -> Result<(), ConfigError> {
    if !(epsilon_total.is_finite() && epsilon_total > 0.0) {
        return Err(ConfigError::Validation(format!(
            "budget `{name}`: epsilon total must be a positive number"
        )));
    }
    if !(0.0..1.0).contains(&delta_total) {
        return Err(ConfigError::Validation(format!(
            "budget `{name}`: delta total must be within [0, 1)"
        )));
    }
    Ok(())
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<EngineConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<EngineConfig, ConfigError> {
    let parse_err = |details: String| ConfigError::Parse { format, details };
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| parse_err(err.to_string())),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| parse_err(err.to_string()))
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
