//! Statistical disclosure control over a candidate batch: k-anonymity,
//! l-diversity and t-closeness on exact equivalence classes of the
//! quasi-identifier projection.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use synthguard_audit::DisclosureSummary;
use thiserror::Error;
use tracing::debug;

use crate::{
    config::DisclosureConfig,
    noise::{calibrate, NoiseMechanism, NoiseParameters, NoiseSampler},
    record::{cell_key, Record},
};

const T_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisclosureError {
    #[error("at least one quasi-identifier column is required")]
    NoQuasiIdentifiers,
    #[error("column name must not be empty")]
    EmptyColumnName,
    #[error("column {0} cannot be both a quasi-identifier and a sensitive column")]
    OverlappingColumn(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisclosureViolation {
    /// The batch had no rows; nothing can be released from it.
    EmptyBatch,
    KAnonymity { k_min: u64, k_threshold: u64 },
    LDiversity {
        column: String,
        observed: u64,
        required: u64,
    },
    TCloseness {
        column: String,
        observed: f64,
        threshold: f64,
    },
}

impl DisclosureViolation {
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::LDiversity { column, .. } | Self::TCloseness { column, .. } => Some(column),
            _ => None,
        }
    }
}

impl fmt::Display for DisclosureViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBatch => f.write_str("empty batch"),
            Self::KAnonymity { k_min, k_threshold } => {
                write!(f, "k-anonymity: smallest class has {k_min} rows, need {k_threshold}")
            }
            Self::LDiversity {
                column,
                observed,
                required,
            } => write!(
                f,
                "l-diversity on {column}: {observed} distinct values in a class, need {required}"
            ),
            Self::TCloseness {
                column,
                observed,
                threshold,
            } => write!(
                f,
                "t-closeness on {column}: distance {observed:.4} exceeds {threshold}"
            ),
        }
    }
}

/// A count as it may be shown outside the engine. Counts below the minimum
/// reportable size only leave with Laplace noise.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReportedCount {
    Exact(u64),
    Noised(f64),
}

impl ReportedCount {
    pub fn value(&self) -> f64 {
        match *self {
            Self::Exact(count) => count as f64,
            Self::Noised(value) => value,
        }
    }

    pub fn is_noised(&self) -> bool {
        matches!(self, Self::Noised(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisclosureReport {
    pub rows: u64,
    pub class_count: u64,
    /// Exact smallest class size; release decisions depend on it.
    pub k_min: u64,
    pub k_threshold: u64,
    /// `k_min` as it may be shown to callers and the audit log.
    pub k_min_released: ReportedCount,
    pub singleton_classes: u64,
    /// Minimum distinct values per class, by sensitive column.
    pub l_diversity: BTreeMap<String, u64>,
    /// Maximum class-to-batch total-variation distance, by sensitive column.
    pub t_closeness: BTreeMap<String, f64>,
    /// Class sizes in ascending order of the underlying exact size.
    pub class_sizes: Vec<ReportedCount>,
    pub violations: Vec<DisclosureViolation>,
}

impl DisclosureReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Batches this small are discarded without running compliance.
    pub fn below_floor(&self, k_floor: u64) -> bool {
        self.k_min <= k_floor
    }

    pub fn summary(&self) -> DisclosureSummary {
        DisclosureSummary {
            rows: self.rows,
            class_count: self.class_count,
            k_threshold: self.k_threshold,
            k_min_released: self.k_min_released.value(),
            k_min_noised: self.k_min_released.is_noised(),
            passed: self.passed(),
            violations: self.violations.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Clone)]
pub struct DisclosureAnalyzer {
    config: DisclosureConfig,
    /// Keys the small-count noise stream so it cannot be recomputed from
    /// the batch alone.
    noise_key: [u8; 32],
}

impl Default for DisclosureAnalyzer {
    fn default() -> Self {
        Self::new(DisclosureConfig::default())
    }
}

struct ColumnStats {
    column: String,
    l_min: u64,
    t_max: f64,
}

impl DisclosureAnalyzer {
    /// Draws a fresh noise key from the thread-local CSPRNG.
    pub fn new(config: DisclosureConfig) -> Self {
        Self::with_noise_key(config, rand::random())
    }

    pub fn with_noise_key(config: DisclosureConfig, noise_key: [u8; 32]) -> Self {
        Self { config, noise_key }
    }

    pub fn config(&self) -> &DisclosureConfig {
        &self.config
    }

    pub fn check_columns(
        quasi_identifiers: &BTreeSet<String>,
        sensitive_columns: &BTreeSet<String>,
    ) -> Result<(), DisclosureError> {
        if quasi_identifiers.is_empty() {
            return Err(DisclosureError::NoQuasiIdentifiers);
        }
        if quasi_identifiers
            .iter()
            .chain(sensitive_columns)
            .any(|column| column.trim().is_empty())
        {
            return Err(DisclosureError::EmptyColumnName);
        }
        if let Some(column) = quasi_identifiers.intersection(sensitive_columns).next() {
            return Err(DisclosureError::OverlappingColumn(column.clone()));
        }
        Ok(())
    }

    /// Partitions `records` by exact equality on `quasi_identifiers` and
    /// measures every class. The result depends only on the multiset of
    /// rows, not their order.
    pub fn analyze(
        &self,
        records: &[Record],
        quasi_identifiers: &BTreeSet<String>,
        sensitive_columns: &BTreeSet<String>,
        k_threshold: u64,
    ) -> Result<DisclosureReport, DisclosureError> {
        Self::check_columns(quasi_identifiers, sensitive_columns)?;

        if records.is_empty() {
            return Ok(DisclosureReport {
                rows: 0,
                class_count: 0,
                k_min: 0,
                k_threshold,
                k_min_released: ReportedCount::Exact(0),
                singleton_classes: 0,
                l_diversity: sensitive_columns.iter().map(|c| (c.clone(), 0)).collect(),
                t_closeness: sensitive_columns.iter().map(|c| (c.clone(), 0.0)).collect(),
                class_sizes: Vec::new(),
                violations: vec![DisclosureViolation::EmptyBatch],
            });
        }

        let mut classes: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            let key = quasi_identifiers
                .iter()
                .map(|column| cell_key(record, column))
                .collect();
            classes.entry(key).or_default().push(index);
        }
        let classes: Vec<Vec<usize>> = classes.into_values().collect();

        let mut sizes: Vec<u64> = classes.iter().map(|rows| rows.len() as u64).collect();
        sizes.sort_unstable();
        let k_min = sizes.first().copied().unwrap_or(0);
        let singleton_classes = sizes.iter().filter(|&&size| size == 1).count() as u64;

        let columns: Vec<&String> = sensitive_columns.iter().collect();
        let stats: Vec<ColumnStats> = columns
            .par_iter()
            .map(|column| column_stats(records, &classes, column))
            .collect();

        let mut violations = Vec::new();
        if k_min < k_threshold {
            violations.push(DisclosureViolation::KAnonymity { k_min, k_threshold });
        }
        let mut l_diversity = BTreeMap::new();
        let mut t_closeness = BTreeMap::new();
        for stat in stats {
            if stat.l_min < self.config.l_diversity_min {
                violations.push(DisclosureViolation::LDiversity {
                    column: stat.column.clone(),
                    observed: stat.l_min,
                    required: self.config.l_diversity_min,
                });
            }
            if stat.t_max > self.config.t_closeness_max + T_TOLERANCE {
                violations.push(DisclosureViolation::TCloseness {
                    column: stat.column.clone(),
                    observed: stat.t_max,
                    threshold: self.config.t_closeness_max,
                });
            }
            l_diversity.insert(stat.column.clone(), stat.l_min);
            t_closeness.insert(stat.column, stat.t_max);
        }

        let (k_min_released, class_sizes) = self.release_counts(records, k_min, &sizes);
        debug!(
            rows = records.len(),
            classes = classes.len(),
            k_min,
            violations = violations.len(),
            "disclosure analysis complete"
        );
        Ok(DisclosureReport {
            rows: records.len() as u64,
            class_count: classes.len() as u64,
            k_min,
            k_threshold,
            k_min_released,
            singleton_classes,
            l_diversity,
            t_closeness,
            class_sizes,
            violations,
        })
    }

    fn release_counts(
        &self,
        records: &[Record],
        k_min: u64,
        sizes: &[u64],
    ) -> (ReportedCount, Vec<ReportedCount>) {
        let floor = self.config.min_reportable_count;
        if k_min >= floor {
            return (
                ReportedCount::Exact(k_min),
                sizes.iter().copied().map(ReportedCount::Exact).collect(),
            );
        }
        let params = match self.count_noise() {
            Some(params) => params,
            // a validated config always calibrates; withhold small counts otherwise
            None => {
                return (
                    ReportedCount::Noised(0.0),
                    sizes
                        .iter()
                        .map(|&size| {
                            if size < floor {
                                ReportedCount::Noised(0.0)
                            } else {
                                ReportedCount::Exact(size)
                            }
                        })
                        .collect(),
                )
            }
        };
        let mut sampler = NoiseSampler::keyed(&self.noise_key, batch_fingerprint(records));
        let k_min_released = ReportedCount::Noised(sampler.perturb(k_min as f64, &params));
        let class_sizes = sizes
            .iter()
            .map(|&size| {
                if size < floor {
                    ReportedCount::Noised(sampler.perturb(size as f64, &params))
                } else {
                    ReportedCount::Exact(size)
                }
            })
            .collect();
        (k_min_released, class_sizes)
    }

    fn count_noise(&self) -> Option<NoiseParameters> {
        calibrate(
            NoiseMechanism::Laplace,
            1.0,
            self.config.count_noise_epsilon,
            0.0,
        )
        .ok()
    }
}

impl fmt::Debug for DisclosureAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisclosureAnalyzer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn column_stats(records: &[Record], classes: &[Vec<usize>], column: &str) -> ColumnStats {
    let mut global: HashMap<String, u64> = HashMap::new();
    for record in records {
        *global.entry(cell_key(record, column)).or_default() += 1;
    }
    let total = records.len() as f64;

    let mut l_min = u64::MAX;
    let mut t_max = 0.0f64;
    for rows in classes {
        let mut local: HashMap<String, u64> = HashMap::new();
        for &index in rows {
            *local.entry(cell_key(&records[index], column)).or_default() += 1;
        }
        l_min = l_min.min(local.len() as u64);

        let size = rows.len() as f64;
        let distance = 0.5
            * global
                .iter()
                .map(|(value, &count)| {
                    let p_class = local.get(value).copied().unwrap_or(0) as f64 / size;
                    (p_class - count as f64 / total).abs()
                })
                .sum::<f64>();
        t_max = t_max.max(distance);
    }
    ColumnStats {
        column: column.to_owned(),
        l_min: if classes.is_empty() { 0 } else { l_min },
        t_max,
    }
}

/// Order-independent digest input for the batch.
fn batch_fingerprint(records: &[Record]) -> Vec<u8> {
    let mut lines: Vec<String> = records
        .iter()
        .map(|record| serde_json::to_string(record).unwrap_or_default())
        .collect();
    lines.sort_unstable();
    lines.join("\n").into_bytes()
}
