use serde::{Deserialize, Serialize};

use crate::disclosure::{DisclosureReport, DisclosureViolation};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn from_score(score: f64) -> Self {
        match score {
            s if s >= 75.0 => Self::Critical,
            s if s >= 50.0 => Self::High,
            s if s >= 25.0 => Self::Medium,
            _ => Self::Low,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Prosecutor-model re-identification risk, `1 / k_min`.
    pub reidentification_risk: f64,
    /// Share of rows that sit alone in their equivalence class.
    pub singleton_share: f64,
    /// Share of sensitive columns failing l-diversity or t-closeness.
    pub attribute_disclosure_risk: f64,
    /// Weighted overall risk on a 0-100 scale.
    pub overall_risk: f64,
    pub level: RiskLevel,
    pub vulnerabilities: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Summarizes how exposed a batch would be if released as-is.
pub fn assess_risk(report: &DisclosureReport) -> RiskAssessment {
    if report.rows == 0 {
        return RiskAssessment {
            reidentification_risk: 0.0,
            singleton_share: 0.0,
            attribute_disclosure_risk: 0.0,
            overall_risk: 0.0,
            level: RiskLevel::Low,
            vulnerabilities: vec!["empty batch: nothing to assess".into()],
            recommendations: vec!["regenerate the batch; empty output cannot be released".into()],
        };
    }

    let reidentification_risk = 1.0 / report.k_min.max(1) as f64;
    let singleton_share = report.singleton_classes as f64 / report.rows as f64;
    let sensitive = report.l_diversity.len();
    let weak_columns = report
        .l_diversity
        .keys()
        .filter(|column| {
            report
                .violations
                .iter()
                .any(|v| v.column() == Some(column.as_str()))
        })
        .count();
    let attribute_disclosure_risk = if sensitive == 0 {
        0.0
    } else {
        weak_columns as f64 / sensitive as f64
    };
    let overall_risk = (100.0
        * (0.5 * reidentification_risk + 0.3 * singleton_share + 0.2 * attribute_disclosure_risk))
        .clamp(0.0, 100.0);

    let mut vulnerabilities = Vec::new();
    let mut recommendations = Vec::new();
    if report.singleton_classes > 0 {
        vulnerabilities.push(format!(
            "linkage: {} quasi-identifier combinations identify a single row",
            report.singleton_classes
        ));
    }
    for violation in &report.violations {
        match violation {
            DisclosureViolation::KAnonymity { k_threshold, .. } => {
                recommendations.push(format!(
                    "coarsen quasi-identifiers or enlarge the batch so every class holds at least {k_threshold} rows"
                ));
            }
            DisclosureViolation::LDiversity { column, required, .. } => {
                vulnerabilities.push(format!("homogeneity: classes with too few values of {column}"));
                recommendations.push(format!(
                    "increase diversity of {column} to at least {required} distinct values per class"
                ));
            }
            DisclosureViolation::TCloseness { column, .. } => {
                vulnerabilities.push(format!("skewness: class distribution of {column} departs from the batch"));
                recommendations.push(format!("rebalance {column} across quasi-identifier classes"));
            }
            DisclosureViolation::EmptyBatch => {}
        }
    }
    recommendations.dedup();
    if recommendations.is_empty() && reidentification_risk > 0.2 {
        recommendations.push("consider a higher privacy level or larger classes".into());
    }

    RiskAssessment {
        reidentification_risk,
        singleton_share,
        attribute_disclosure_risk,
        overall_risk,
        level: RiskLevel::from_score(overall_risk),
        vulnerabilities,
        recommendations,
    }
}
