use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use synthguard_audit::FrameworkSummary;
use tracing::debug;

use super::{ComplianceError, Framework, Rule, RuleCatalog, RuleSets, RuleViolation};
use crate::record::Record;

/// Upper bound on rule ids listed in an audit summary.
const SUMMARY_RULE_LIMIT: usize = 16;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub framework: Framework,
    pub passed: bool,
    /// Sorted by record index, then rule id.
    pub violations: Vec<RuleViolation>,
    /// Share of records with at least one violation.
    pub risk_score: f64,
    pub recommendations: Vec<String>,
}

impl ComplianceVerdict {
    pub fn failed_rules(&self) -> BTreeSet<&str> {
        self.violations.iter().map(|v| v.rule_id.as_str()).collect()
    }

    pub fn summary(&self, blocking: bool) -> FrameworkSummary {
        FrameworkSummary {
            framework: self.framework.to_string(),
            passed: self.passed,
            blocking,
            violation_count: self.violations.len() as u64,
            failed_rules: self
                .failed_rules()
                .into_iter()
                .take(SUMMARY_RULE_LIMIT)
                .map(str::to_owned)
                .collect(),
        }
    }
}

fn evaluate_framework(records: &[Record], framework: &Framework, rules: &[Rule]) -> ComplianceVerdict {
    let mut violations: Vec<RuleViolation> = records
        .par_iter()
        .enumerate()
        .flat_map_iter(|(index, record)| rules.iter().filter_map(move |rule| rule.check(index, record)))
        .collect();
    violations.sort();

    let offending: BTreeSet<usize> = violations.iter().map(|v| v.record_index).collect();
    let risk_score = if records.is_empty() {
        0.0
    } else {
        offending.len() as f64 / records.len() as f64
    };

    let failed: BTreeSet<&str> = violations.iter().map(|v| v.rule_id.as_str()).collect();
    let mut recommendations: Vec<String> = rules
        .iter()
        .filter(|rule| failed.contains(rule.id.as_str()))
        .filter_map(|rule| rule.remediation.clone())
        .collect();
    recommendations.sort();
    recommendations.dedup();

    debug!(
        %framework,
        records = records.len(),
        violations = violations.len(),
        "compliance rules evaluated"
    );
    ComplianceVerdict {
        framework: framework.clone(),
        passed: violations.is_empty(),
        violations,
        risk_score,
        recommendations,
    }
}

/// Evaluates candidate batches against the frameworks of a loaded
/// [`RuleCatalog`].
#[derive(Clone, Debug)]
pub struct ComplianceRuleEngine {
    catalog: RuleCatalog,
}

impl ComplianceRuleEngine {
    pub fn new(catalog: RuleCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Resolves the requested frameworks before any budget is reserved.
    /// Fails with `UnknownFramework` on the first name not loaded.
    pub fn select<'a>(
        &self,
        frameworks: impl IntoIterator<Item = &'a Framework>,
    ) -> Result<RuleSets, ComplianceError> {
        self.catalog.select(frameworks)
    }

    /// Evaluates `records` against every selected rule set. Rules form an
    /// unordered conjunction and records are checked independently, in
    /// parallel.
    pub fn evaluate(records: &[Record], rule_sets: &RuleSets) -> BTreeMap<Framework, ComplianceVerdict> {
        rule_sets
            .iter()
            .map(|(framework, rules)| (framework.clone(), evaluate_framework(records, framework, rules)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::FieldPredicate;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn records(values: Vec<serde_json::Value>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect()
    }

    fn ssn_only() -> RuleSets {
        BTreeMap::from([(
            Framework::new("HIPAA"),
            vec![Rule::field_absent("hipaa.ssn", "ssn").with_remediation("drop ssn")],
        )])
    }

    #[test]
    fn field_absent_violation_references_record() {
        let batch = records(vec![json!({"age": 40}), json!({"ssn": "123-45-6789"})]);
        let verdicts = ComplianceRuleEngine::evaluate(&batch, &ssn_only());
        let hipaa = &verdicts[&Framework::new("HIPAA")];
        assert!(!hipaa.passed);
        assert_eq!(hipaa.violations.len(), 1);
        assert_eq!(hipaa.violations[0].record_index, 1);
        assert_eq!(hipaa.risk_score, 0.5);
        assert_eq!(hipaa.recommendations, vec!["drop ssn".to_string()]);

        let cleaned = records(vec![json!({"age": 40}), json!({"age": 51})]);
        assert!(ComplianceRuleEngine::evaluate(&cleaned, &ssn_only())[&Framework::new("HIPAA")].passed);
    }

    #[test]
    fn violations_sort_by_record_then_rule() {
        let rules = BTreeMap::from([(
            Framework::new("INTERNAL"),
            vec![
                Rule::field_absent("z.email", "email"),
                Rule::cross_field("a.pair", &["lat", "lon"], FieldPredicate::AllOrNone),
            ],
        )]);
        let batch: Vec<Record> = (0..64)
            .map(|i| {
                serde_json::from_value(json!({"email": format!("u{i}@x.org"), "lat": i})).unwrap()
            })
            .collect();
        let verdicts = ComplianceRuleEngine::evaluate(&batch, &rules);
        let verdict = &verdicts[&Framework::new("INTERNAL")];
        assert_eq!(verdict.violations.len(), 128);
        let order: Vec<(usize, &str)> = verdict
            .violations
            .iter()
            .take(4)
            .map(|v| (v.record_index, v.rule_id.as_str()))
            .collect();
        assert_eq!(order, vec![(0, "a.pair"), (0, "z.email"), (1, "a.pair"), (1, "z.email")]);
        assert_eq!(verdict.risk_score, 1.0);
    }

    #[test]
    fn engine_rejects_unknown_frameworks() {
        let engine = ComplianceRuleEngine::new(RuleCatalog::builtin().unwrap());
        let unknown = [Framework::new("FERPA")];
        assert_eq!(
            engine.select(&unknown).unwrap_err(),
            ComplianceError::UnknownFramework("FERPA".into())
        );
        let selected = engine.select(&[Framework::new("SOX")]).unwrap();
        let verdicts = ComplianceRuleEngine::evaluate(&[], &selected);
        assert!(verdicts[&Framework::new("SOX")].passed);
    }

    #[test]
    fn summary_lists_failed_rules_once() {
        let batch = records(vec![json!({"ssn": "1"}), json!({"ssn": "2"})]);
        let verdicts = ComplianceRuleEngine::evaluate(&batch, &ssn_only());
        let verdict = &verdicts[&Framework::new("HIPAA")];
        let summary = verdict.summary(true);
        assert_eq!(summary.violation_count, 2);
        assert_eq!(summary.failed_rules, vec!["hipaa.ssn".to_string()]);
        assert!(summary.blocking);
    }
}
