use super::RuleDefinition;

fn absent(id: &str, field: &str, remediation: &str) -> RuleDefinition {
    RuleDefinition {
        id: id.into(),
        kind: "field-absent".into(),
        field: Some(field.into()),
        remediation: Some(remediation.into()),
        ..RuleDefinition::default()
    }
}

fn pattern(id: &str, field: &str, pattern: &str, must_match: bool, remediation: &str) -> RuleDefinition {
    RuleDefinition {
        id: id.into(),
        kind: "field-matches-pattern".into(),
        field: Some(field.into()),
        pattern: Some(pattern.into()),
        must_match: Some(must_match),
        remediation: Some(remediation.into()),
        ..RuleDefinition::default()
    }
}

fn cross(id: &str, predicate: &str, fields: &[&str], remediation: &str) -> RuleDefinition {
    RuleDefinition {
        id: id.into(),
        kind: "cross-field".into(),
        fields: fields.iter().map(|f| f.to_string()).collect(),
        predicate: Some(predicate.into()),
        remediation: Some(remediation.into()),
        ..RuleDefinition::default()
    }
}

fn value_set(id: &str, field: &str, allowed: &[&str], required: bool, remediation: &str) -> RuleDefinition {
    RuleDefinition {
        id: id.into(),
        kind: "value-set".into(),
        field: Some(field.into()),
        allowed: allowed.iter().map(|v| v.to_string()).collect(),
        required,
        remediation: Some(remediation.into()),
        ..RuleDefinition::default()
    }
}

const SSN: &str = r"\b\d{3}-\d{2}-\d{4}\b";
const EMAIL: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";
const PAN: &str = r"\b(?:\d[ -]?){13,19}\b";

fn hipaa() -> Vec<RuleDefinition> {
    const DROP: &str = "remove direct identifiers (Safe Harbor 164.514(b)(2))";
    let mut rules: Vec<RuleDefinition> = [
        ("hipaa.name", "name"),
        ("hipaa.patient-name", "patient_name"),
        ("hipaa.first-name", "first_name"),
        ("hipaa.last-name", "last_name"),
        ("hipaa.ssn", "ssn"),
        ("hipaa.email", "email"),
        ("hipaa.phone", "phone"),
        ("hipaa.fax", "fax"),
        ("hipaa.address", "address"),
        ("hipaa.street-address", "street_address"),
        ("hipaa.mrn", "medical_record_number"),
        ("hipaa.health-plan-id", "health_plan_id"),
        ("hipaa.account-number", "account_number"),
        ("hipaa.license-number", "license_number"),
        ("hipaa.vehicle-id", "vehicle_id"),
        ("hipaa.device-id", "device_id"),
        ("hipaa.url", "url"),
        ("hipaa.ip-address", "ip_address"),
        ("hipaa.biometric-id", "biometric_id"),
        ("hipaa.photo", "photo"),
    ]
    .into_iter()
    .map(|(id, field)| absent(id, field, DROP))
    .collect();
    rules.extend([
        cross(
            "hipaa.dates-year-only",
            "year-only",
            &["date_of_birth", "birth_date", "admission_date", "discharge_date", "death_date"],
            "generalize dates related to an individual to the year",
        ),
        pattern(
            "hipaa.zip-3-digit",
            "zip_code",
            r"^\d{3}$",
            true,
            "truncate ZIP codes to the first three digits",
        ),
        pattern(
            "hipaa.age-over-89",
            "age",
            r"^(?:\d|[1-8]\d|90\+)$",
            true,
            "aggregate ages over 89 into a single 90+ category",
        ),
        pattern(
            "hipaa.notes-ssn",
            "notes",
            SSN,
            false,
            "scrub identifiers from free-text notes",
        ),
    ]);
    rules
}

fn pci_dss() -> Vec<RuleDefinition> {
    const NEVER_STORE: &str = "never store sensitive authentication data after authorization (PCI DSS 3.2)";
    vec![
        absent("pci.cvv", "cvv", NEVER_STORE),
        absent("pci.cvv2", "cvv2", NEVER_STORE),
        absent("pci.cvc", "cvc", NEVER_STORE),
        absent("pci.pin", "pin", NEVER_STORE),
        absent("pci.pin-block", "pin_block", NEVER_STORE),
        absent("pci.track-data", "track_data", NEVER_STORE),
        cross(
            "pci.pan-masked",
            "masked-except-last",
            &["card_number", "masked_card", "pan"],
            "mask the primary account number, showing at most the last four digits (PCI DSS 3.3)",
        )
        .with_visible(4),
        pattern(
            "pci.description-pan",
            "description",
            PAN,
            false,
            "remove card numbers from free-text fields",
        ),
    ]
}

fn gdpr() -> Vec<RuleDefinition> {
    const MINIMIZE: &str = "drop direct identifiers or pseudonymize them (GDPR art. 5(1)(c))";
    vec![
        absent("gdpr.name", "name", MINIMIZE),
        absent("gdpr.email", "email", MINIMIZE),
        absent("gdpr.phone", "phone", MINIMIZE),
        absent("gdpr.address", "address", MINIMIZE),
        absent("gdpr.national-id", "national_id", MINIMIZE),
        absent("gdpr.passport-number", "passport_number", MINIMIZE),
        absent("gdpr.ip-address", "ip_address", MINIMIZE),
        pattern(
            "gdpr.comment-email",
            "comments",
            EMAIL,
            false,
            "scrub email addresses from free-text fields",
        ),
        value_set(
            "gdpr.consent",
            "consent_given",
            &["true"],
            true,
            "record a lawful basis: every record needs consent_given = true (GDPR art. 6)",
        ),
    ]
}

fn sox() -> Vec<RuleDefinition> {
    vec![
        cross(
            "sox.transaction-controls",
            "requires-when-present",
            &["transaction_id", "audit_trail", "approval_required"],
            "attach audit trail and approval flags to every financial transaction (SOX 404)",
        ),
        value_set(
            "sox.audit-trail",
            "audit_trail",
            &["true"],
            false,
            "enable audit trails on financial transactions",
        ),
        cross(
            "sox.segregation-of-duties",
            "distinct",
            &["initiated_by", "approved_by"],
            "transactions must be approved by someone other than the initiator",
        ),
    ]
}

pub(super) fn rule_sets() -> Vec<(&'static str, Vec<RuleDefinition>)> {
    vec![
        ("HIPAA", hipaa()),
        ("PCI_DSS", pci_dss()),
        ("GDPR", gdpr()),
        ("SOX", sox()),
    ]
}

impl RuleDefinition {
    fn with_visible(mut self, visible: usize) -> Self {
        self.visible = Some(visible);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Framework, RuleCatalog};
    use crate::record::Record;
    use serde_json::json;

    fn failures(framework: &str, value: serde_json::Value) -> Vec<String> {
        let catalog = RuleCatalog::builtin().unwrap();
        let record: Record = serde_json::from_value(value).unwrap();
        catalog
            .rules(&Framework::new(framework))
            .unwrap()
            .iter()
            .filter_map(|rule| rule.check(0, &record))
            .map(|violation| violation.rule_id)
            .collect()
    }

    #[test]
    fn builtins_compile() {
        let catalog = RuleCatalog::builtin().unwrap();
        let names: Vec<&str> = catalog.frameworks().map(|f| f.as_str()).collect();
        assert_eq!(names, vec!["GDPR", "HIPAA", "PCI_DSS", "SOX"]);
    }

    #[test]
    fn hipaa_safe_harbor() {
        let clean = json!({"patient_id": "P001", "age_group": "30-39", "gender": "F",
                           "zip_code": "123", "diagnosis": "diabetes", "date_of_birth": "1984"});
        assert!(failures("HIPAA", clean).is_empty());
        let leaky = json!({"patient_name": "John Smith", "ssn": "123-45-6789", "age": 93,
                           "date_of_birth": "1931-04-02", "diagnosis": "diabetes"});
        assert_eq!(
            failures("HIPAA", leaky),
            vec!["hipaa.patient-name", "hipaa.ssn", "hipaa.dates-year-only", "hipaa.age-over-89"]
        );
    }

    #[test]
    fn pci_masking_and_authentication_data() {
        let clean = json!({"transaction_id": "TXN001", "masked_card": "****1234", "amount": 100.5});
        assert!(failures("PCI_DSS", clean).is_empty());
        let leaky = json!({"card_number": "4111111111111111", "cvv": "123", "amount": 100.5});
        assert_eq!(failures("PCI_DSS", leaky), vec!["pci.cvv", "pci.pan-masked"]);
    }

    #[test]
    fn gdpr_requires_consent() {
        let clean = json!({"user_id": "U001", "age": 30, "country": "Germany", "consent_given": true});
        assert!(failures("GDPR", clean).is_empty());
        assert_eq!(failures("GDPR", json!({"user_id": "U002"})), vec!["gdpr.consent"]);
    }

    #[test]
    fn sox_transaction_controls() {
        let clean = json!({"transaction_id": "TXN001", "amount": 1_000_000,
                           "audit_trail": true, "approval_required": true});
        assert!(failures("SOX", clean).is_empty());
        let weak = json!({"transaction_id": "TXN002", "audit_trail": false,
                          "initiated_by": "kim", "approved_by": "kim"});
        assert_eq!(
            failures("SOX", weak),
            vec!["sox.transaction-controls", "sox.audit-trail", "sox.segregation-of-duties"]
        );
    }
}
