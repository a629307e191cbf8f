//! Randomized reserve/commit/release interleavings against the ledger.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use synthguard_privacy::{BudgetError, BudgetLedger, DatasetId, ReservationId};

const EPSILON_TOTAL: f64 = 1.0;
const DELTA_TOTAL: f64 = 1e-5;
const TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug)]
enum Op {
    Reserve { epsilon: f64, delta: f64 },
    Commit(usize),
    Release(usize),
    Advance(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0.0f64..0.4, 0.0f64..4e-6).prop_map(|(epsilon, delta)| Op::Reserve { epsilon, delta }),
        3 => (0usize..32).prop_map(Op::Commit),
        2 => (0usize..32).prop_map(Op::Release),
        1 => (1i64..90).prop_map(Op::Advance),
    ]
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

proptest! {
    #[test]
    fn spent_plus_pending_never_exceeds_total(ops in prop::collection::vec(op(), 1..80)) {
        let ledger = BudgetLedger::new();
        let dataset = DatasetId::new("patients_v1");
        let mut now = start();
        let mut issued: Vec<ReservationId> = Vec::new();
        let mut committed_epsilon = 0.0;
        let mut last_spent = 0.0;

        for op in ops {
            match op {
                Op::Reserve { epsilon, delta } => {
                    match ledger.reserve_at(
                        &dataset,
                        EPSILON_TOTAL,
                        DELTA_TOTAL,
                        epsilon,
                        delta,
                        Duration::seconds(60),
                        now,
                    ) {
                        Ok(reservation) => issued.push(reservation.reservation_id),
                        Err(BudgetError::InsufficientBudget { remaining_epsilon, remaining_delta, .. }) => {
                            prop_assert!(
                                epsilon > remaining_epsilon - TOLERANCE
                                    || delta > remaining_delta - TOLERANCE
                            );
                        }
                        Err(other) => prop_assert!(false, "unexpected reserve error: {other}"),
                    }
                }
                Op::Commit(index) if !issued.is_empty() => {
                    let id = &issued[index % issued.len()];
                    match ledger.commit_at(id, now) {
                        Ok(settlement) => {
                            if !settlement.repeated {
                                committed_epsilon += settlement.epsilon;
                            }
                            prop_assert!((settlement.epsilon_spent - committed_epsilon).abs() < TOLERANCE);
                        }
                        Err(BudgetError::UnknownReservation(_) | BudgetError::ReservationExpired(_)) => {}
                        Err(other) => prop_assert!(false, "unexpected commit error: {other}"),
                    }
                }
                Op::Release(index) if !issued.is_empty() => {
                    let id = &issued[index % issued.len()];
                    match ledger.release_at(id, now) {
                        Ok(settlement) => {
                            prop_assert!((settlement.epsilon_spent - committed_epsilon).abs() < TOLERANCE);
                        }
                        Err(BudgetError::UnknownReservation(_)) => {}
                        Err(other) => prop_assert!(false, "unexpected release error: {other}"),
                    }
                }
                Op::Advance(seconds) => now += Duration::seconds(seconds),
                Op::Commit(_) | Op::Release(_) => {}
            }

            if let Ok(snapshot) = ledger.snapshot_at(&dataset, now) {
                prop_assert!(snapshot.epsilon_spent + snapshot.epsilon_pending <= EPSILON_TOTAL + TOLERANCE);
                prop_assert!(snapshot.delta_spent + snapshot.delta_pending <= DELTA_TOTAL + TOLERANCE);
                prop_assert!(snapshot.remaining.epsilon >= -TOLERANCE);
                prop_assert!(snapshot.epsilon_spent >= last_spent - TOLERANCE);
                prop_assert!((snapshot.epsilon_spent - committed_epsilon).abs() < TOLERANCE);
                last_spent = snapshot.epsilon_spent;
            }
        }
    }

    #[test]
    fn commit_is_idempotent_and_final(epsilon in 0.01f64..0.9, retries in 1usize..4) {
        let ledger = BudgetLedger::new();
        let dataset = DatasetId::new("claims");
        let now = start();
        let reservation = ledger
            .reserve_at(&dataset, EPSILON_TOTAL, 0.0, epsilon, 0.0, Duration::minutes(5), now)
            .unwrap();
        let first = ledger.commit_at(&reservation.reservation_id, now).unwrap();
        prop_assert!(!first.repeated);
        for _ in 0..retries {
            let again = ledger.commit_at(&reservation.reservation_id, now).unwrap();
            prop_assert!(again.repeated);
            prop_assert_eq!(again.epsilon_spent, first.epsilon_spent);
        }
        prop_assert_eq!(
            ledger.release_at(&reservation.reservation_id, now),
            Err(BudgetError::UnknownReservation(reservation.reservation_id.clone()))
        );
        let remaining = ledger.remaining_at(&dataset, now).unwrap();
        prop_assert!((remaining.epsilon - (EPSILON_TOTAL - epsilon)).abs() < TOLERANCE);
    }

    #[test]
    fn export_restore_preserves_accounting(epsilons in prop::collection::vec(0.01f64..0.2, 1..5)) {
        let ledger = BudgetLedger::new();
        let dataset = DatasetId::new("census");
        let now = start();
        for (index, epsilon) in epsilons.iter().enumerate() {
            let reservation = ledger
                .reserve_at(&dataset, EPSILON_TOTAL, 0.0, *epsilon, 0.0, Duration::minutes(5), now)
                .unwrap();
            if index % 2 == 0 {
                ledger.commit_at(&reservation.reservation_id, now).unwrap();
            }
        }
        let before = ledger.snapshot_at(&dataset, now).unwrap();
        let restored = BudgetLedger::restore(ledger.export()).unwrap();
        prop_assert_eq!(restored.snapshot_at(&dataset, now).unwrap(), before);
    }
}
