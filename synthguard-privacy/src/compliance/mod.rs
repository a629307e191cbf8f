//! Declarative regulatory compliance checks over candidate records.

mod builtin;
mod engine;
mod rules;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::config::ComplianceConfig;

pub use engine::{ComplianceRuleEngine, ComplianceVerdict};
pub use rules::{FieldPredicate, Framework, Rule, RuleDefinition, RuleKind, RuleViolation};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComplianceError {
    #[error("invalid rule {rule_id} in framework {framework}: {reason}")]
    InvalidRuleDefinition {
        framework: String,
        rule_id: String,
        reason: String,
    },
    #[error("framework name must not be empty")]
    EmptyFrameworkName,
    #[error("unknown compliance framework {0}")]
    UnknownFramework(String),
}

/// Rule sets chosen for one evaluation, keyed by framework.
pub type RuleSets = BTreeMap<Framework, Vec<Rule>>;

/// Compiled rule sets keyed by framework. Built once at startup; lookups
/// are read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct RuleCatalog {
    frameworks: RuleSets,
}

impl RuleCatalog {
    /// HIPAA Safe Harbor, PCI DSS, GDPR and SOX rule sets.
    pub fn builtin() -> Result<Self, ComplianceError> {
        let mut catalog = Self::default();
        for (framework, definitions) in builtin::rule_sets() {
            catalog.define(framework, &definitions)?;
        }
        Ok(catalog)
    }

    /// Built-ins (when enabled) overlaid with the configured rule sets. A
    /// configured framework replaces a built-in one of the same name.
    pub fn from_config(config: &ComplianceConfig) -> Result<Self, ComplianceError> {
        let mut catalog = if config.include_builtin {
            Self::builtin()?
        } else {
            Self::default()
        };
        for set in &config.frameworks {
            catalog.define(&set.framework, &set.rules)?;
        }
        Ok(catalog)
    }

    pub fn define(&mut self, framework: &str, definitions: &[RuleDefinition]) -> Result<(), ComplianceError> {
        if framework.trim().is_empty() {
            return Err(ComplianceError::EmptyFrameworkName);
        }
        let framework = Framework::new(framework);
        let mut rules: Vec<Rule> = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if rules.iter().any(|rule| rule.id == definition.id) {
                return Err(ComplianceError::InvalidRuleDefinition {
                    framework: framework.to_string(),
                    rule_id: definition.id.clone(),
                    reason: "duplicate rule id".into(),
                });
            }
            rules.push(definition.compile(&framework)?);
        }
        debug!(%framework, rules = rules.len(), "compliance rule set loaded");
        self.frameworks.insert(framework, rules);
        Ok(())
    }

    pub fn rules(&self, framework: &Framework) -> Option<&[Rule]> {
        self.frameworks.get(framework).map(Vec::as_slice)
    }

    pub fn frameworks(&self) -> impl Iterator<Item = &Framework> {
        self.frameworks.keys()
    }

    pub fn contains(&self, framework: &Framework) -> bool {
        self.frameworks.contains_key(framework)
    }

    pub fn len(&self) -> usize {
        self.frameworks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frameworks.is_empty()
    }

    /// Rule sets for the named frameworks; fails on the first unknown name.
    pub fn select<'a, I>(&self, names: I) -> Result<RuleSets, ComplianceError>
    where
        I: IntoIterator<Item = &'a Framework>,
    {
        names
            .into_iter()
            .map(|framework| {
                self.frameworks
                    .get(framework)
                    .map(|rules| (framework.clone(), rules.clone()))
                    .ok_or_else(|| ComplianceError::UnknownFramework(framework.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameworkRules;

    fn absent(id: &str, field: &str) -> RuleDefinition {
        RuleDefinition {
            id: id.into(),
            kind: "field-absent".into(),
            field: Some(field.into()),
            ..RuleDefinition::default()
        }
    }

    #[test]
    fn configured_sets_override_builtins() {
        let config = ComplianceConfig {
            include_builtin: true,
            frameworks: vec![FrameworkRules {
                framework: "hipaa".into(),
                rules: vec![absent("local.mrn", "mrn")],
            }],
        };
        let catalog = RuleCatalog::from_config(&config).unwrap();
        let hipaa = catalog.rules(&Framework::new("HIPAA")).unwrap();
        assert_eq!(hipaa.len(), 1);
        assert_eq!(hipaa[0].id, "local.mrn");
        assert!(catalog.contains(&Framework::new("SOX")));
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let mut catalog = RuleCatalog::default();
        let err = catalog
            .define("internal", &[absent("x", "a"), absent("x", "b")])
            .unwrap_err();
        assert!(matches!(err, ComplianceError::InvalidRuleDefinition { reason, .. } if reason == "duplicate rule id"));
        assert_eq!(catalog.define(" ", &[]), Err(ComplianceError::EmptyFrameworkName));
    }

    #[test]
    fn selecting_unknown_framework_fails() {
        let catalog = RuleCatalog::builtin().unwrap();
        let names = [Framework::new("HIPAA"), Framework::new("FERPA")];
        assert_eq!(
            catalog.select(&names).unwrap_err(),
            ComplianceError::UnknownFramework("FERPA".into())
        );
        assert_eq!(catalog.select(&names[..1]).unwrap().len(), 1);
    }
}
