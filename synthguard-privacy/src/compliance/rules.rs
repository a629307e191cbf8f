use std::{collections::BTreeSet, fmt};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ComplianceError;
use crate::record::{field_text, is_present, Record};

/// Regulatory framework name, normalized to upper case with `_` separators
/// (`pci-dss` and `PCI_DSS` name the same framework).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Framework(String);

impl Framework {
    pub const HIPAA: &'static str = "HIPAA";
    pub const PCI_DSS: &'static str = "PCI_DSS";
    pub const GDPR: &'static str = "GDPR";
    pub const SOX: &'static str = "SOX";

    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_uppercase().replace(['-', ' '], "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Framework {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Multi-field predicates available to cross-field rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldPredicate {
    /// Every present field holds a bare four-digit year.
    YearOnly,
    /// Every present field is masked except for at most `visible` trailing
    /// digits.
    MaskedExceptLast { visible: usize },
    /// Either all fields are present or none is.
    AllOrNone,
    /// When the first field is present, every other field must be too.
    RequiresWhenPresent,
    /// Present fields hold pairwise different values.
    Distinct,
}

impl FieldPredicate {
    fn min_fields(self) -> usize {
        match self {
            Self::YearOnly | Self::MaskedExceptLast { .. } => 1,
            Self::AllOrNone | Self::RequiresWhenPresent | Self::Distinct => 2,
        }
    }

    /// First offending field and why, if the record breaks the predicate.
    fn check(self, record: &Record, fields: &[String]) -> Option<(String, String)> {
        match self {
            Self::YearOnly => fields.iter().find_map(|field| {
                let text = field_text(record, field)?;
                let year_only = text.len() == 4 && text.chars().all(|c| c.is_ascii_digit());
                (!year_only).then(|| (field.clone(), format!("{field} must be generalized to a year")))
            }),
            Self::MaskedExceptLast { visible } => fields.iter().find_map(|field| {
                let text = field_text(record, field)?;
                (!is_masked(&text, visible)).then(|| {
                    (
                        field.clone(),
                        format!("{field} must be masked except for the last {visible} digits"),
                    )
                })
            }),
            Self::AllOrNone => {
                let present = fields.iter().filter(|f| is_present(record, f)).count();
                if present == 0 || present == fields.len() {
                    return None;
                }
                fields.iter().find(|f| !is_present(record, f)).map(|missing| {
                    (
                        missing.clone(),
                        format!("{} must appear together", fields.join(", ")),
                    )
                })
            }
            Self::RequiresWhenPresent => {
                let (head, rest) = fields.split_first()?;
                if !is_present(record, head) {
                    return None;
                }
                rest.iter().find(|f| !is_present(record, f)).map(|missing| {
                    (missing.clone(), format!("{missing} is required when {head} is present"))
                })
            }
            Self::Distinct => {
                let mut seen: Vec<(String, &String)> = Vec::new();
                for field in fields {
                    let Some(text) = field_text(record, field) else {
                        continue;
                    };
                    if let Some((_, earlier)) = seen.iter().find(|(value, _)| *value == text) {
                        return Some((field.clone(), format!("{field} must differ from {earlier}")));
                    }
                    seen.push((text.into_owned(), field));
                }
                None
            }
        }
    }
}

fn is_masked(text: &str, visible: usize) -> bool {
    let compact: String = text.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
    let tail = compact.trim_start_matches(['*', 'X', 'x', '#']);
    tail.chars().all(|c| c.is_ascii_digit()) && tail.len() <= visible
}

#[derive(Clone, Debug)]
pub enum RuleKind {
    FieldAbsent {
        field: String,
    },
    /// Checked only when the field is present.
    FieldMatchesPattern {
        field: String,
        pattern: Regex,
        must_match: bool,
    },
    CrossFieldConstraint {
        fields: Vec<String>,
        predicate: FieldPredicate,
    },
    ValueSetMembership {
        field: String,
        allowed: BTreeSet<String>,
        /// Absence is a violation too.
        required: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleViolation {
    pub record_index: usize,
    pub rule_id: String,
    pub field: String,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub id: String,
    pub kind: RuleKind,
    pub remediation: Option<String>,
}

impl Rule {
    pub fn field_absent(id: &str, field: &str) -> Self {
        Self::new(
            id,
            RuleKind::FieldAbsent {
                field: field.to_owned(),
            },
        )
    }

    pub fn pattern(id: &str, field: &str, pattern: &str, must_match: bool) -> Result<Self, regex::Error> {
        Ok(Self::new(
            id,
            RuleKind::FieldMatchesPattern {
                field: field.to_owned(),
                pattern: Regex::new(pattern)?,
                must_match,
            },
        ))
    }

    pub fn cross_field(id: &str, fields: &[&str], predicate: FieldPredicate) -> Self {
        Self::new(
            id,
            RuleKind::CrossFieldConstraint {
                fields: fields.iter().map(|f| f.to_string()).collect(),
                predicate,
            },
        )
    }

    pub fn value_set(id: &str, field: &str, allowed: &[&str], required: bool) -> Self {
        Self::new(
            id,
            RuleKind::ValueSetMembership {
                field: field.to_owned(),
                allowed: allowed.iter().map(|v| v.to_string()).collect(),
                required,
            },
        )
    }

    fn new(id: &str, kind: RuleKind) -> Self {
        Self {
            id: id.to_owned(),
            kind,
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, remediation: &str) -> Self {
        self.remediation = Some(remediation.to_owned());
        self
    }

    /// Violation of this rule by one record, if any.
    pub fn check(&self, record_index: usize, record: &Record) -> Option<RuleViolation> {
        let (field, message) = match &self.kind {
            RuleKind::FieldAbsent { field } => {
                if !record.contains_key(field) {
                    return None;
                }
                (field.clone(), format!("{field} must not be present"))
            }
            RuleKind::FieldMatchesPattern {
                field,
                pattern,
                must_match,
            } => {
                let text = field_text(record, field)?;
                if pattern.is_match(&text) == *must_match {
                    return None;
                }
                let expectation = if *must_match { "must match" } else { "must not match" };
                (field.clone(), format!("{field} {expectation} /{pattern}/"))
            }
            RuleKind::CrossFieldConstraint { fields, predicate } => predicate.check(record, fields)?,
            RuleKind::ValueSetMembership {
                field,
                allowed,
                required,
            } => match field_text(record, field) {
                Some(text) if allowed.contains(&*text) => return None,
                Some(text) => (field.clone(), format!("{field} value `{text}` is not allowed")),
                None if *required => (field.clone(), format!("{field} is required")),
                None => return None,
            },
        };
        Some(RuleViolation {
            record_index,
            rule_id: self.id.clone(),
            field,
            message,
        })
    }
}

/// Declarative rule as written in configuration. Compiled into a [`Rule`]
/// at load time; anything malformed is refused there.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RuleDefinition {
    pub id: String,
    /// `field-absent`, `field-matches-pattern`, `cross-field` or `value-set`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_match: Option<bool>,
    /// `year-only`, `masked-except-last`, `all-or-none`,
    /// `requires-when-present` or `distinct`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl RuleDefinition {
    pub fn compile(&self, framework: &Framework) -> Result<Rule, ComplianceError> {
        let invalid = |reason: String| ComplianceError::InvalidRuleDefinition {
            framework: framework.to_string(),
            rule_id: self.id.clone(),
            reason,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("rule id must not be empty".into()));
        }
        let field = || {
            self.field
                .as_deref()
                .filter(|f| !f.trim().is_empty())
                .ok_or_else(|| invalid(format!("`{}` rules need a `field`", self.kind)))
        };

        let kind = match self.kind.as_str() {
            "field-absent" => RuleKind::FieldAbsent {
                field: field()?.to_owned(),
            },
            "field-matches-pattern" => {
                let field = field()?.to_owned();
                let source = self
                    .pattern
                    .as_deref()
                    .ok_or_else(|| invalid("`field-matches-pattern` rules need a `pattern`".into()))?;
                let pattern = Regex::new(source)
                    .map_err(|err| invalid(format!("bad pattern: {err}")))?;
                RuleKind::FieldMatchesPattern {
                    field,
                    pattern,
                    must_match: self.must_match.unwrap_or(true),
                }
            }
            "cross-field" => {
                let predicate = match self.predicate.as_deref() {
                    Some("year-only") => FieldPredicate::YearOnly,
                    Some("masked-except-last") => FieldPredicate::MaskedExceptLast {
                        visible: self
                            .visible
                            .ok_or_else(|| invalid("`masked-except-last` needs `visible`".into()))?,
                    },
                    Some("all-or-none") => FieldPredicate::AllOrNone,
                    Some("requires-when-present") => FieldPredicate::RequiresWhenPresent,
                    Some("distinct") => FieldPredicate::Distinct,
                    Some(other) => return Err(invalid(format!("unknown predicate `{other}`"))),
                    None => return Err(invalid("`cross-field` rules need a `predicate`".into())),
                };
                if self.fields.iter().any(|f| f.trim().is_empty()) {
                    return Err(invalid("field names must not be empty".into()));
                }
                if self.fields.len() < predicate.min_fields() {
                    return Err(invalid(format!(
                        "predicate needs at least {} fields, got {}",
                        predicate.min_fields(),
                        self.fields.len()
                    )));
                }
                RuleKind::CrossFieldConstraint {
                    fields: self.fields.clone(),
                    predicate,
                }
            }
            "value-set" => {
                let field = field()?.to_owned();
                if self.allowed.is_empty() {
                    return Err(invalid("`value-set` rules need at least one allowed value".into()));
                }
                RuleKind::ValueSetMembership {
                    field,
                    allowed: self.allowed.iter().cloned().collect(),
                    required: self.required,
                }
            }
            other => return Err(invalid(format!("unknown rule kind `{other}`"))),
        };
        Ok(Rule {
            id: self.id.clone(),
            kind,
            remediation: self.remediation.clone(),
        })
    }
}
