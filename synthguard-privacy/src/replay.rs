//! Rebuilds ledger spend from a persisted audit trail, so a restarted
//! engine never grants budget that an earlier process already committed.

use std::collections::BTreeMap;

use synthguard_audit::{AuditEntry, AuditPayload};
use tracing::{debug, warn};

use crate::{
    budget::{BudgetError, BudgetLedger, DatasetId, PrivacyBudget, ReservationId},
    config::{BudgetConfig, DatasetPolicy},
};

/// A reservation the log shows as granted but never committed or released.
#[derive(Clone, Debug, PartialEq)]
pub struct OrphanedReservation {
    pub dataset_id: DatasetId,
    pub reservation_id: ReservationId,
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug)]
pub struct LedgerReplay {
    pub ledger: BudgetLedger,
    /// Left behind by a process that stopped mid-evaluation. They hold no
    /// budget in the rebuilt ledger.
    pub orphaned: Vec<OrphanedReservation>,
}

struct ReplayedDataset {
    totals: DatasetPolicy,
    epsilon_spent: f64,
    delta_spent: f64,
}

fn dataset<'a>(
    datasets: &'a mut BTreeMap<DatasetId, ReplayedDataset>,
    dataset_id: &str,
    config: &BudgetConfig,
) -> &'a mut ReplayedDataset {
    datasets
        .entry(DatasetId::new(dataset_id))
        .or_insert_with(|| ReplayedDataset {
            totals: config.policy_for(dataset_id),
            epsilon_spent: 0.0,
            delta_spent: 0.0,
        })
}

/// Replays `entries` in storage order. Totals come from the latest
/// `Reserved` entry of each dataset, falling back to `config`; spend is the
/// highest cumulative spend any `Committed` entry reports.
pub fn replay_ledger(entries: &[AuditEntry], config: &BudgetConfig) -> Result<LedgerReplay, BudgetError> {
    let mut datasets: BTreeMap<DatasetId, ReplayedDataset> = BTreeMap::new();
    let mut open: BTreeMap<ReservationId, OrphanedReservation> = BTreeMap::new();

    for entry in entries {
        match &entry.payload {
            AuditPayload::Reserved {
                dataset_id,
                reservation_id,
                epsilon,
                delta,
                epsilon_total,
                delta_total,
                ..
            } => {
                dataset(&mut datasets, dataset_id, config).totals = DatasetPolicy {
                    epsilon_total: *epsilon_total,
                    delta_total: *delta_total,
                };
                let reservation_id = ReservationId::from(reservation_id.as_str());
                open.insert(
                    reservation_id.clone(),
                    OrphanedReservation {
                        dataset_id: DatasetId::new(dataset_id.as_str()),
                        reservation_id,
                        epsilon: *epsilon,
                        delta: *delta,
                    },
                );
            }
            AuditPayload::Committed {
                dataset_id,
                reservation_id,
                epsilon_spent,
                delta_spent,
                ..
            } => {
                let state = dataset(&mut datasets, dataset_id, config);
                state.epsilon_spent = state.epsilon_spent.max(*epsilon_spent);
                state.delta_spent = state.delta_spent.max(*delta_spent);
                open.remove(&ReservationId::from(reservation_id.as_str()));
            }
            AuditPayload::Released { reservation_id, .. } => {
                open.remove(&ReservationId::from(reservation_id.as_str()));
            }
            AuditPayload::DisclosureChecked { .. } | AuditPayload::ComplianceChecked { .. } => {}
        }
    }

    let budgets = datasets
        .into_iter()
        .map(|(dataset_id, state)| {
            debug!(
                %dataset_id,
                epsilon_spent = state.epsilon_spent,
                delta_spent = state.delta_spent,
                "replayed dataset budget"
            );
            PrivacyBudget {
                dataset_id,
                epsilon_total: state.totals.epsilon_total,
                delta_total: state.totals.delta_total,
                epsilon_spent: state.epsilon_spent,
                delta_spent: state.delta_spent,
                reservations: BTreeMap::new(),
                resolved: BTreeMap::new(),
            }
        })
        .collect();
    let ledger = BudgetLedger::restore(budgets)?;
    let orphaned: Vec<OrphanedReservation> = open.into_values().collect();
    if !orphaned.is_empty() {
        warn!(count = orphaned.len(), "audit log holds reservations that were never resolved");
    }
    Ok(LedgerReplay { ledger, orphaned })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use synthguard_audit::{AuditTrail, ReleaseCause};

    fn reserved(dataset_id: &str, reservation_id: &str, epsilon: f64, epsilon_total: f64) -> AuditPayload {
        AuditPayload::Reserved {
            dataset_id: dataset_id.into(),
            reservation_id: reservation_id.into(),
            epsilon,
            delta: 0.0,
            epsilon_total,
            delta_total: 1e-5,
            expires_at: Utc::now(),
        }
    }

    fn committed(dataset_id: &str, reservation_id: &str, epsilon: f64, epsilon_spent: f64) -> AuditPayload {
        AuditPayload::Committed {
            dataset_id: dataset_id.into(),
            reservation_id: reservation_id.into(),
            epsilon,
            delta: 0.0,
            epsilon_spent,
            delta_spent: 0.0,
        }
    }

    fn log(payloads: Vec<AuditPayload>) -> Vec<AuditEntry> {
        let trail = AuditTrail::in_memory();
        for payload in payloads {
            trail.append(payload).unwrap();
        }
        trail.entries(0, u64::MAX).unwrap()
    }

    #[test]
    fn committed_spend_and_logged_totals_survive() {
        let entries = log(vec![
            reserved("patients_v1", "rsv-1", 0.4, 1.0),
            committed("patients_v1", "rsv-1", 0.4, 0.4),
            reserved("patients_v1", "rsv-2", 0.3, 1.0),
            AuditPayload::Released {
                dataset_id: "patients_v1".into(),
                reservation_id: "rsv-2".into(),
                epsilon: 0.3,
                delta: 0.0,
                cause: ReleaseCause::Rejected,
            },
            reserved("census", "rsv-3", 2.0, 8.0),
            committed("census", "rsv-3", 2.0, 2.0),
            reserved("census", "rsv-4", 1.0, 8.0),
        ]);
        let replay = replay_ledger(&entries, &BudgetConfig::default()).unwrap();

        let patients = replay.ledger.snapshot(&DatasetId::new("patients_v1")).unwrap();
        assert_eq!(patients.epsilon_spent, 0.4);
        assert_eq!(patients.pending_reservations, 0);
        let census = replay.ledger.snapshot(&DatasetId::new("census")).unwrap();
        assert_eq!(census.epsilon_total, 8.0);
        assert_eq!(census.remaining.epsilon, 6.0);
        assert_eq!(
            replay.orphaned,
            vec![OrphanedReservation {
                dataset_id: DatasetId::new("census"),
                reservation_id: ReservationId::from("rsv-4"),
                epsilon: 1.0,
                delta: 0.0,
            }]
        );
    }

    #[test]
    fn repeated_commit_lines_never_lower_spend() {
        let entries = log(vec![
            committed("patients_v1", "rsv-1", 0.4, 0.4),
            committed("patients_v1", "rsv-2", 0.3, 0.7),
            committed("patients_v1", "rsv-1", 0.4, 0.4),
        ]);
        let replay = replay_ledger(&entries, &BudgetConfig::default()).unwrap();
        let remaining = replay.ledger.remaining(&DatasetId::new("patients_v1")).unwrap();
        assert!((remaining.epsilon - 0.3).abs() < 1e-12);
    }

    #[test]
    fn empty_log_gives_an_empty_ledger() {
        let replay = replay_ledger(&[], &BudgetConfig::default()).unwrap();
        assert!(replay.ledger.export().is_empty());
        assert!(replay.orphaned.is_empty());
    }
}
