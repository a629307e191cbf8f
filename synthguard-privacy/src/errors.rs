use synthguard_audit::AuditError;
use thiserror::Error;

use crate::{
    budget::BudgetError, compliance::ComplianceError, config::ConfigError,
    disclosure::DisclosureError, noise::NoiseError,
};

pub type PrivacyResult<T> = Result<T, PrivacyError>;

#[derive(Debug, Error)]
pub enum PrivacyError {
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    Disclosure(#[from] DisclosureError),
    #[error(transparent)]
    Compliance(#[from] ComplianceError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("audit append task failed: {0}")]
    AuditTask(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid evaluation request: {0}")]
    InvalidRequest(String),
}
