//! SynthGuard privacy engine: gates release of synthetic record batches on a
//! per-dataset differential-privacy budget, disclosure-control checks and
//! regulatory rule sets. Budget is reserved before generation, then either
//! committed once a batch passes every check or released in full, with each
//! step appended to a hash-chained audit trail.

pub mod budget;
pub mod compliance;
pub mod config;
pub mod disclosure;
pub mod errors;
pub mod levels;
pub mod noise;
pub mod orchestrator;
pub mod record;
pub mod replay;
pub mod risk;
pub mod source;

pub use budget::{
    basic_composition, BudgetError, BudgetLedger, BudgetRemaining, BudgetSnapshot, DatasetId,
    PrivacyBudget, Reservation, ReservationId, Settlement,
};
pub use compliance::{
    ComplianceError, ComplianceRuleEngine, ComplianceVerdict, FieldPredicate, Framework, Rule,
    RuleCatalog, RuleDefinition, RuleKind, RuleSets, RuleViolation,
};
pub use config::{
    load_config, parse_config, BudgetConfig, ComplianceConfig, ConfigError, ConfigFormat,
    DatasetPolicy, DisclosureConfig, EngineConfig,
};
pub use disclosure::{
    DisclosureAnalyzer, DisclosureError, DisclosureReport, DisclosureViolation, ReportedCount,
};
pub use errors::{PrivacyError, PrivacyResult};
pub use levels::PrivacyLevel;
pub use noise::{calibrate, NoiseError, NoiseMechanism, NoiseParameters, NoiseSampler};
pub use orchestrator::{
    Acceptance, Decision, EvaluationRequest, EvaluationState, FrameworkSelection,
    PrivacyOrchestrator, Rejection, RejectionReason,
};
pub use record::Record;
pub use replay::{replay_ledger, LedgerReplay, OrphanedReservation};
pub use risk::{assess_risk, RiskAssessment, RiskLevel};
pub use source::{GenerationRequest, RecordSource, SourceError, StaticRecordSource};
