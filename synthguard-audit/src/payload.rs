use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a reservation was released instead of committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCause {
    /// A blocking disclosure or compliance check failed.
    Rejected,
    SourceUnavailable,
    SourceTimeout,
    Expired,
    Cancelled,
    /// Commits are halted after an audit chain break.
    CommitsHalted,
    /// The evaluation bailed out on an internal error before a decision.
    Aborted,
    /// Explicit release by the caller through the ledger API.
    Requested,
}

/// Bounded summary of a disclosure report. Full reports are never logged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisclosureSummary {
    pub rows: u64,
    pub class_count: u64,
    pub k_threshold: u64,
    /// Smallest class size as released: noised when below the minimum
    /// reportable count.
    pub k_min_released: f64,
    pub k_min_noised: bool,
    pub passed: bool,
    pub violations: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameworkSummary {
    pub framework: String,
    pub passed: bool,
    pub blocking: bool,
    pub violation_count: u64,
    /// Distinct failing rule ids, sorted.
    pub failed_rules: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditPayload {
    /// Carries the dataset totals so the ledger can be rebuilt from the log.
    Reserved {
        dataset_id: String,
        reservation_id: String,
        epsilon: f64,
        delta: f64,
        epsilon_total: f64,
        delta_total: f64,
        expires_at: DateTime<Utc>,
    },
    Committed {
        dataset_id: String,
        reservation_id: String,
        epsilon: f64,
        delta: f64,
        epsilon_spent: f64,
        delta_spent: f64,
    },
    Released {
        dataset_id: String,
        reservation_id: String,
        epsilon: f64,
        delta: f64,
        cause: ReleaseCause,
    },
    DisclosureChecked {
        dataset_id: String,
        reservation_id: String,
        summary: DisclosureSummary,
    },
    ComplianceChecked {
        dataset_id: String,
        reservation_id: String,
        frameworks: Vec<FrameworkSummary>,
    },
}

impl AuditPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditPayload::Reserved { .. } => "reserved",
            AuditPayload::Committed { .. } => "committed",
            AuditPayload::Released { .. } => "released",
            AuditPayload::DisclosureChecked { .. } => "disclosure_checked",
            AuditPayload::ComplianceChecked { .. } => "compliance_checked",
        }
    }

    pub fn dataset_id(&self) -> &str {
        match self {
            AuditPayload::Reserved { dataset_id, .. }
            | AuditPayload::Committed { dataset_id, .. }
            | AuditPayload::Released { dataset_id, .. }
            | AuditPayload::DisclosureChecked { dataset_id, .. }
            | AuditPayload::ComplianceChecked { dataset_id, .. } => dataset_id,
        }
    }

    pub fn reservation_id(&self) -> &str {
        match self {
            AuditPayload::Reserved { reservation_id, .. }
            | AuditPayload::Committed { reservation_id, .. }
            | AuditPayload::Released { reservation_id, .. }
            | AuditPayload::DisclosureChecked { reservation_id, .. }
            | AuditPayload::ComplianceChecked { reservation_id, .. } => reservation_id,
        }
    }
}
