use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use blake3::Hasher;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Slack for float accumulation when comparing spend against totals.
const BUDGET_TOLERANCE: f64 = 1e-12;
/// How long resolved reservations are remembered when no retention is set.
const DEFAULT_RETENTION_SECS: i64 = 3_600;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(pub String);

impl DatasetId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub String);

impl ReservationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReservationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BudgetError {
    #[error(
        "insufficient privacy budget for dataset {dataset_id}: requested epsilon {requested_epsilon}, \
         delta {requested_delta}; remaining epsilon {remaining_epsilon}, delta {remaining_delta}"
    )]
    InsufficientBudget {
        dataset_id: DatasetId,
        requested_epsilon: f64,
        requested_delta: f64,
        remaining_epsilon: f64,
        remaining_delta: f64,
    },
    #[error(
        "dataset {dataset_id} is registered with totals epsilon {epsilon_total}, delta {delta_total}; \
         request supplied epsilon {supplied_epsilon}, delta {supplied_delta}"
    )]
    BudgetMismatch {
        dataset_id: DatasetId,
        epsilon_total: f64,
        delta_total: f64,
        supplied_epsilon: f64,
        supplied_delta: f64,
    },
    #[error("unknown or already resolved reservation {0}")]
    UnknownReservation(ReservationId),
    #[error("reservation {0} expired before it was committed")]
    ReservationExpired(ReservationId),
    #[error("no budget has been opened for dataset {0}")]
    UnknownDataset(DatasetId),
    #[error("invalid budget parameters: {0}")]
    InvalidParameters(String),
    #[error("commits are halted: {reason}")]
    CommitsHalted { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingReservation {
    pub reservation_id: ReservationId,
    pub epsilon: f64,
    pub delta: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingReservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Committed,
    Released,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedReservation {
    pub resolution: Resolution,
    pub epsilon: f64,
    pub delta: f64,
    pub resolved_at: DateTime<Utc>,
}

/// Spend state of one dataset. `epsilon_spent + pending <= epsilon_total`
/// (and the same for delta) holds after every ledger operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    pub dataset_id: DatasetId,
    pub epsilon_total: f64,
    pub delta_total: f64,
    pub epsilon_spent: f64,
    pub delta_spent: f64,
    pub reservations: BTreeMap<ReservationId, PendingReservation>,
    /// Outcome of every reservation that left the pending set, so retries of
    /// commit and release can be answered without double counting.
    #[serde(default)]
    pub resolved: BTreeMap<ReservationId, ResolvedReservation>,
}

impl PrivacyBudget {
    fn open(dataset_id: DatasetId, epsilon_total: f64, delta_total: f64) -> Self {
        Self {
            dataset_id,
            epsilon_total,
            delta_total,
            epsilon_spent: 0.0,
            delta_spent: 0.0,
            reservations: BTreeMap::new(),
            resolved: BTreeMap::new(),
        }
    }

    pub fn epsilon_pending(&self) -> f64 {
        basic_composition(self.reservations.values().map(|r| r.epsilon))
    }

    pub fn delta_pending(&self) -> f64 {
        basic_composition(self.reservations.values().map(|r| r.delta))
    }

    pub fn remaining(&self) -> BudgetRemaining {
        BudgetRemaining {
            epsilon: (self.epsilon_total - self.epsilon_spent - self.epsilon_pending()).max(0.0),
            delta: (self.delta_total - self.delta_spent - self.delta_pending()).max(0.0),
        }
    }

    pub fn within_limits(&self) -> bool {
        self.epsilon_spent + self.epsilon_pending() <= self.epsilon_total + BUDGET_TOLERANCE
            && self.delta_spent + self.delta_pending() <= self.delta_total + BUDGET_TOLERANCE
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<PendingReservation> {
        let expired: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.reservation_id.clone())
            .collect();
        let mut swept = Vec::with_capacity(expired.len());
        for reservation_id in &expired {
            swept.extend(self.resolve(reservation_id, Resolution::Expired, now));
            warn!(
                dataset_id = %self.dataset_id,
                reservation_id = %reservation_id,
                "reservation expired without commit; released"
            );
        }
        swept
    }

    /// Forgets outcomes resolved before `cutoff`.
    fn prune_resolved(&mut self, cutoff: DateTime<Utc>) -> Vec<ReservationId> {
        let mut pruned = Vec::new();
        self.resolved.retain(|reservation_id, done| {
            let keep = done.resolved_at >= cutoff;
            if !keep {
                pruned.push(reservation_id.clone());
            }
            keep
        });
        pruned
    }

    fn resolve(
        &mut self,
        reservation_id: &ReservationId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Option<PendingReservation> {
        let pending = self.reservations.remove(reservation_id)?;
        if resolution == Resolution::Committed {
            self.epsilon_spent += pending.epsilon;
            self.delta_spent += pending.delta;
        }
        self.resolved.insert(
            reservation_id.clone(),
            ResolvedReservation {
                resolution,
                epsilon: pending.epsilon,
                delta: pending.delta,
                resolved_at: now,
            },
        );
        Some(pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetRemaining {
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub dataset_id: DatasetId,
    pub epsilon_total: f64,
    pub delta_total: f64,
    pub epsilon_spent: f64,
    pub delta_spent: f64,
    pub epsilon_pending: f64,
    pub delta_pending: f64,
    pub pending_reservations: usize,
    pub remaining: BudgetRemaining,
}

/// Granted reservation, handed back to the caller of `reserve`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub dataset_id: DatasetId,
    pub epsilon: f64,
    pub delta: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a commit or release. `repeated` marks an idempotent retry that
/// changed nothing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub dataset_id: DatasetId,
    pub reservation_id: ReservationId,
    pub epsilon: f64,
    pub delta: f64,
    pub epsilon_spent: f64,
    pub delta_spent: f64,
    pub repeated: bool,
}

/// Per-dataset privacy budget accounting with reserve-then-commit semantics.
///
/// Each dataset lives behind its own lock, so operations on one dataset
/// serialize while different datasets proceed in parallel.
///
/// Outcomes of resolved reservations are kept for the retention window so
/// retried commits and releases stay idempotent; after that a retry sees
/// `UnknownReservation`.
pub struct BudgetLedger {
    budgets: DashMap<DatasetId, Arc<Mutex<PrivacyBudget>>>,
    /// Owning dataset of every pending or retained reservation.
    owners: DashMap<ReservationId, DatasetId>,
    halted: RwLock<Option<String>>,
    issued: AtomicU64,
    retention: Duration,
    /// Expiries not yet handed to `take_expired`.
    expired: Mutex<Vec<Settlement>>,
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self {
            budgets: DashMap::new(),
            owners: DashMap::new(),
            halted: RwLock::new(None),
            issued: AtomicU64::new(0),
            retention: Duration::seconds(DEFAULT_RETENTION_SECS),
            expired: Mutex::new(Vec::new()),
        }
    }

    /// Sets how long resolved reservations are remembered.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn reserve(
        &self,
        dataset_id: &DatasetId,
        epsilon_total: f64,
        delta_total: f64,
        epsilon_request: f64,
        delta_request: f64,
        ttl: Duration,
    ) -> Result<Reservation, BudgetError> {
        self.reserve_at(
            dataset_id,
            epsilon_total,
            delta_total,
            epsilon_request,
            delta_request,
            ttl,
            Utc::now(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reserve_at(
        &self,
        dataset_id: &DatasetId,
        epsilon_total: f64,
        delta_total: f64,
        epsilon_request: f64,
        delta_request: f64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation, BudgetError> {
        validate_totals(epsilon_total, delta_total)?;
        if !(epsilon_request.is_finite() && epsilon_request >= 0.0) {
            return Err(BudgetError::InvalidParameters(format!(
                "epsilon request {epsilon_request} must be a finite non-negative number"
            )));
        }
        if !(0.0..1.0).contains(&delta_request) {
            return Err(BudgetError::InvalidParameters(format!(
                "delta request {delta_request} must be within [0, 1)"
            )));
        }
        if ttl <= Duration::zero() {
            return Err(BudgetError::InvalidParameters(
                "reservation ttl must be positive".into(),
            ));
        }

        let cell = self
            .budgets
            .entry(dataset_id.clone())
            .or_insert_with(|| {
                debug!(%dataset_id, epsilon_total, delta_total, "opening privacy budget");
                Arc::new(Mutex::new(PrivacyBudget::open(
                    dataset_id.clone(),
                    epsilon_total,
                    delta_total,
                )))
            })
            .clone();
        let mut budget = cell.lock();

        if !same_total(budget.epsilon_total, epsilon_total)
            || !same_total(budget.delta_total, delta_total)
        {
            return Err(BudgetError::BudgetMismatch {
                dataset_id: dataset_id.clone(),
                epsilon_total: budget.epsilon_total,
                delta_total: budget.delta_total,
                supplied_epsilon: epsilon_total,
                supplied_delta: delta_total,
            });
        }

        self.sweep_budget(&mut budget, now);

        let epsilon_committed = budget.epsilon_spent + budget.epsilon_pending();
        let delta_committed = budget.delta_spent + budget.delta_pending();
        if epsilon_committed + epsilon_request > budget.epsilon_total + BUDGET_TOLERANCE
            || delta_committed + delta_request > budget.delta_total + BUDGET_TOLERANCE
        {
            let remaining = budget.remaining();
            return Err(BudgetError::InsufficientBudget {
                dataset_id: dataset_id.clone(),
                requested_epsilon: epsilon_request,
                requested_delta: delta_request,
                remaining_epsilon: remaining.epsilon,
                remaining_delta: remaining.delta,
            });
        }

        let reservation_id = self.next_reservation_id(dataset_id, now);
        let pending = PendingReservation {
            reservation_id: reservation_id.clone(),
            epsilon: epsilon_request,
            delta: delta_request,
            created_at: now,
            expires_at: now + ttl,
        };
        budget
            .reservations
            .insert(reservation_id.clone(), pending.clone());
        self.owners
            .insert(reservation_id.clone(), dataset_id.clone());
        debug!(
            %dataset_id,
            %reservation_id,
            epsilon = epsilon_request,
            delta = delta_request,
            "budget reserved"
        );
        Ok(Reservation {
            reservation_id,
            dataset_id: dataset_id.clone(),
            epsilon: pending.epsilon,
            delta: pending.delta,
            created_at: pending.created_at,
            expires_at: pending.expires_at,
        })
    }

    pub fn commit(&self, reservation_id: &ReservationId) -> Result<Settlement, BudgetError> {
        self.commit_at(reservation_id, Utc::now())
    }

    /// Moves a reservation into spent. Repeating a successful commit is a
    /// no-op; committing a released reservation fails with
    /// `UnknownReservation`.
    pub fn commit_at(
        &self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Settlement, BudgetError> {
        let cell = self.cell_for(reservation_id)?;
        let mut budget = cell.lock();

        if let Some(pending) = budget.reservations.get(reservation_id) {
            if pending.is_expired(now) {
                if let Some(pending) = budget.resolve(reservation_id, Resolution::Expired, now) {
                    self.expired.lock().push(settlement(
                        &budget,
                        reservation_id,
                        pending.epsilon,
                        pending.delta,
                        false,
                    ));
                }
                warn!(
                    dataset_id = %budget.dataset_id,
                    %reservation_id,
                    "commit arrived after reservation expiry; released"
                );
                return Err(BudgetError::ReservationExpired(reservation_id.clone()));
            }
            if let Some(reason) = self.halted.read().clone() {
                return Err(BudgetError::CommitsHalted { reason });
            }
            let pending = budget
                .resolve(reservation_id, Resolution::Committed, now)
                .ok_or_else(|| BudgetError::UnknownReservation(reservation_id.clone()))?;
            info!(
                dataset_id = %budget.dataset_id,
                %reservation_id,
                epsilon = pending.epsilon,
                epsilon_spent = budget.epsilon_spent,
                "budget committed"
            );
            return Ok(settlement(&budget, reservation_id, pending.epsilon, pending.delta, false));
        }

        match budget.resolved.get(reservation_id) {
            Some(done) if done.resolution == Resolution::Committed => {
                let (epsilon, delta) = (done.epsilon, done.delta);
                Ok(settlement(&budget, reservation_id, epsilon, delta, true))
            }
            Some(done) if done.resolution == Resolution::Expired => {
                Err(BudgetError::ReservationExpired(reservation_id.clone()))
            }
            _ => Err(BudgetError::UnknownReservation(reservation_id.clone())),
        }
    }

    pub fn release(&self, reservation_id: &ReservationId) -> Result<Settlement, BudgetError> {
        self.release_at(reservation_id, Utc::now())
    }

    /// Drops a reservation without spending it. Releasing an already
    /// released or expired reservation is a no-op; releasing a committed one
    /// fails with `UnknownReservation`. Works while commits are halted.
    pub fn release_at(
        &self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Settlement, BudgetError> {
        let cell = self.cell_for(reservation_id)?;
        let mut budget = cell.lock();

        if let Some(pending) = budget.resolve(reservation_id, Resolution::Released, now) {
            debug!(
                dataset_id = %budget.dataset_id,
                %reservation_id,
                epsilon = pending.epsilon,
                "budget released"
            );
            return Ok(settlement(&budget, reservation_id, pending.epsilon, pending.delta, false));
        }

        match budget.resolved.get(reservation_id) {
            Some(done) if done.resolution != Resolution::Committed => {
                let (epsilon, delta) = (done.epsilon, done.delta);
                Ok(settlement(&budget, reservation_id, epsilon, delta, true))
            }
            _ => Err(BudgetError::UnknownReservation(reservation_id.clone())),
        }
    }

    pub fn remaining(&self, dataset_id: &DatasetId) -> Result<BudgetRemaining, BudgetError> {
        self.remaining_at(dataset_id, Utc::now())
    }

    /// Unspent, unreserved budget. Sweeps expired reservations first.
    pub fn remaining_at(
        &self,
        dataset_id: &DatasetId,
        now: DateTime<Utc>,
    ) -> Result<BudgetRemaining, BudgetError> {
        let cell = self.dataset_cell(dataset_id)?;
        let mut budget = cell.lock();
        self.sweep_budget(&mut budget, now);
        Ok(budget.remaining())
    }

    pub fn snapshot(&self, dataset_id: &DatasetId) -> Result<BudgetSnapshot, BudgetError> {
        self.snapshot_at(dataset_id, Utc::now())
    }

    pub fn snapshot_at(
        &self,
        dataset_id: &DatasetId,
        now: DateTime<Utc>,
    ) -> Result<BudgetSnapshot, BudgetError> {
        let cell = self.dataset_cell(dataset_id)?;
        let mut budget = cell.lock();
        self.sweep_budget(&mut budget, now);
        Ok(BudgetSnapshot {
            dataset_id: budget.dataset_id.clone(),
            epsilon_total: budget.epsilon_total,
            delta_total: budget.delta_total,
            epsilon_spent: budget.epsilon_spent,
            delta_spent: budget.delta_spent,
            epsilon_pending: budget.epsilon_pending(),
            delta_pending: budget.delta_pending(),
            pending_reservations: budget.reservations.len(),
            remaining: budget.remaining(),
        })
    }

    /// Copies of every budget, ordered by dataset id, for the persistence
    /// layer to checkpoint.
    pub fn export(&self) -> Vec<PrivacyBudget> {
        let cells: Vec<Arc<Mutex<PrivacyBudget>>> =
            self.budgets.iter().map(|entry| entry.value().clone()).collect();
        let mut budgets: Vec<PrivacyBudget> = cells.iter().map(|cell| cell.lock().clone()).collect();
        budgets.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
        budgets
    }

    /// Rebuilds a ledger from exported budgets. Budgets that violate their
    /// own limits or list the same reservation twice are refused.
    pub fn restore(budgets: Vec<PrivacyBudget>) -> Result<Self, BudgetError> {
        let ledger = Self::new();
        for budget in budgets {
            validate_totals(budget.epsilon_total, budget.delta_total)?;
            if budget.epsilon_spent < 0.0 || budget.delta_spent < 0.0 || !budget.within_limits() {
                return Err(BudgetError::InvalidParameters(format!(
                    "restored budget for {} exceeds its totals",
                    budget.dataset_id
                )));
            }
            if ledger.budgets.contains_key(&budget.dataset_id) {
                return Err(BudgetError::InvalidParameters(format!(
                    "dataset {} restored twice",
                    budget.dataset_id
                )));
            }
            for reservation_id in budget.reservations.keys().chain(budget.resolved.keys()) {
                if ledger
                    .owners
                    .insert(reservation_id.clone(), budget.dataset_id.clone())
                    .is_some()
                {
                    return Err(BudgetError::InvalidParameters(format!(
                        "reservation {reservation_id} appears more than once"
                    )));
                }
            }
            ledger
                .budgets
                .insert(budget.dataset_id.clone(), Arc::new(Mutex::new(budget)));
        }
        Ok(ledger)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Expires overdue reservations of every dataset and returns how many
    /// expired.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let cells: Vec<Arc<Mutex<PrivacyBudget>>> =
            self.budgets.iter().map(|entry| entry.value().clone()).collect();
        cells
            .iter()
            .map(|cell| self.sweep_budget(&mut cell.lock(), now))
            .sum()
    }

    /// Settlements of reservations that expired since the last call.
    pub fn take_expired(&self) -> Vec<Settlement> {
        std::mem::take(&mut *self.expired.lock())
    }

    /// Reservations the ledger still answers for, pending or retained.
    pub fn tracked_reservations(&self) -> usize {
        self.owners.len()
    }

    /// Blocks new commits until `resume_commits`. Releases keep working.
    pub fn halt_commits(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "budget commits halted");
        *self.halted.write() = Some(reason);
    }

    pub fn resume_commits(&self) {
        if self.halted.write().take().is_some() {
            info!("budget commits resumed");
        }
    }

    pub fn commits_halted(&self) -> Option<String> {
        self.halted.read().clone()
    }

    fn sweep_budget(&self, budget: &mut PrivacyBudget, now: DateTime<Utc>) -> usize {
        let swept = budget.sweep_expired(now);
        if !swept.is_empty() {
            let mut expired = self.expired.lock();
            for pending in &swept {
                expired.push(settlement(
                    budget,
                    &pending.reservation_id,
                    pending.epsilon,
                    pending.delta,
                    false,
                ));
            }
        }
        let pruned = budget.prune_resolved(now - self.retention);
        for reservation_id in &pruned {
            self.owners.remove(reservation_id);
        }
        if !pruned.is_empty() {
            debug!(dataset_id = %budget.dataset_id, pruned = pruned.len(), "forgot resolved reservations");
        }
        swept.len()
    }

    fn cell_for(
        &self,
        reservation_id: &ReservationId,
    ) -> Result<Arc<Mutex<PrivacyBudget>>, BudgetError> {
        let dataset_id = self
            .owners
            .get(reservation_id)
            .map(|owner| owner.value().clone())
            .ok_or_else(|| BudgetError::UnknownReservation(reservation_id.clone()))?;
        self.dataset_cell(&dataset_id)
            .map_err(|_| BudgetError::UnknownReservation(reservation_id.clone()))
    }

    fn dataset_cell(&self, dataset_id: &DatasetId) -> Result<Arc<Mutex<PrivacyBudget>>, BudgetError> {
        self.budgets
            .get(dataset_id)
            .map(|cell| cell.value().clone())
            .ok_or_else(|| BudgetError::UnknownDataset(dataset_id.clone()))
    }

    fn next_reservation_id(&self, dataset_id: &DatasetId, now: DateTime<Utc>) -> ReservationId {
        let serial = self.issued.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Hasher::new();
        hasher.update(dataset_id.as_str().as_bytes());
        hasher.update(&serial.to_le_bytes());
        hasher.update(&now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        let digest = hasher.finalize();
        ReservationId(format!("rsv-{serial:06}-{}", hex::encode(&digest.as_bytes()[..6])))
    }
}

impl fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("datasets", &self.budgets.len())
            .field("reservations", &self.owners.len())
            .field("halted", &self.halted.read().is_some())
            .finish()
    }
}

/// Basic (additive) composition of per-release privacy costs.
pub fn basic_composition(costs: impl IntoIterator<Item = f64>) -> f64 {
    costs.into_iter().sum()
}

fn settlement(
    budget: &PrivacyBudget,
    reservation_id: &ReservationId,
    epsilon: f64,
    delta: f64,
    repeated: bool,
) -> Settlement {
    Settlement {
        dataset_id: budget.dataset_id.clone(),
        reservation_id: reservation_id.clone(),
        epsilon,
        delta,
        epsilon_spent: budget.epsilon_spent,
        delta_spent: budget.delta_spent,
        repeated,
    }
}

fn validate_totals(epsilon_total: f64, delta_total: f64) -> Result<(), BudgetError> {
    if !(epsilon_total.is_finite() && epsilon_total > 0.0) {
        return Err(BudgetError::InvalidParameters(format!(
            "epsilon total {epsilon_total} must be a positive number"
        )));
    }
    if !(0.0..1.0).contains(&delta_total) {
        return Err(BudgetError::InvalidParameters(format!(
            "delta total {delta_total} must be within [0, 1)"
        )));
    }
    Ok(())
}

fn same_total(registered: f64, supplied: f64) -> bool {
    (registered - supplied).abs() <= BUDGET_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn patients() -> DatasetId {
        DatasetId::new("patients_v1")
    }

    fn reserve(ledger: &BudgetLedger, epsilon: f64, now: DateTime<Utc>) -> Result<Reservation, BudgetError> {
        ledger.reserve_at(&patients(), 1.0, 1e-5, epsilon, 0.0, Duration::minutes(5), now)
    }

    #[test]
    fn commit_moves_reservation_into_spent() {
        let ledger = BudgetLedger::new();
        let reservation = reserve(&ledger, 0.4, t0()).unwrap();
        assert_eq!(ledger.remaining_at(&patients(), t0()).unwrap().epsilon, 0.6);

        let settled = ledger.commit_at(&reservation.reservation_id, t0()).unwrap();
        assert_eq!(settled.epsilon_spent, 0.4);
        assert!(!settled.repeated);

        let snapshot = ledger.snapshot_at(&patients(), t0()).unwrap();
        assert_eq!(snapshot.pending_reservations, 0);
        assert!((snapshot.remaining.epsilon - 0.6).abs() < 1e-12);
    }

    #[test]
    fn pending_reservations_count_against_the_limit() {
        let ledger = BudgetLedger::new();
        reserve(&ledger, 0.6, t0()).unwrap();
        let err = reserve(&ledger, 0.5, t0()).unwrap_err();
        assert!(matches!(err, BudgetError::InsufficientBudget { remaining_epsilon, .. } if (remaining_epsilon - 0.4).abs() < 1e-12));
    }

    #[test]
    fn exact_fit_is_granted() {
        let ledger = BudgetLedger::new();
        for _ in 0..10 {
            let reservation = reserve(&ledger, 0.1, t0()).unwrap();
            ledger.commit_at(&reservation.reservation_id, t0()).unwrap();
        }
        assert!(ledger.remaining_at(&patients(), t0()).unwrap().epsilon < 1e-9);
        assert!(reserve(&ledger, 0.01, t0()).is_err());
    }

    #[test]
    fn totals_are_fixed_on_first_use() {
        let ledger = BudgetLedger::new();
        reserve(&ledger, 0.1, t0()).unwrap();
        let err = ledger
            .reserve_at(&patients(), 2.0, 1e-5, 0.1, 0.0, Duration::minutes(5), t0())
            .unwrap_err();
        assert!(matches!(err, BudgetError::BudgetMismatch { epsilon_total, .. } if epsilon_total == 1.0));
    }

    #[test]
    fn invalid_parameters_are_refused() {
        let ledger = BudgetLedger::new();
        let ttl = Duration::minutes(5);
        for (eps_total, delta_total, eps, delta) in [
            (0.0, 0.0, 0.1, 0.0),
            (1.0, 1.0, 0.1, 0.0),
            (1.0, 0.0, -0.1, 0.0),
            (1.0, 0.0, f64::NAN, 0.0),
            (f64::INFINITY, 0.0, 0.1, 0.0),
        ] {
            let err = ledger
                .reserve_at(&patients(), eps_total, delta_total, eps, delta, ttl, t0())
                .unwrap_err();
            assert!(matches!(err, BudgetError::InvalidParameters(_)), "{err}");
        }
        let err = ledger
            .reserve_at(&patients(), 1.0, 0.0, 0.1, 0.0, Duration::zero(), t0())
            .unwrap_err();
        assert!(matches!(err, BudgetError::InvalidParameters(_)));
        assert!(matches!(
            ledger.remaining(&patients()),
            Err(BudgetError::UnknownDataset(_))
        ));
    }

    #[test]
    fn commit_and_release_are_idempotent() {
        let ledger = BudgetLedger::new();
        let committed = reserve(&ledger, 0.3, t0()).unwrap().reservation_id;
        let released = reserve(&ledger, 0.3, t0()).unwrap().reservation_id;

        ledger.commit_at(&committed, t0()).unwrap();
        let again = ledger.commit_at(&committed, t0()).unwrap();
        assert!(again.repeated);
        assert_eq!(again.epsilon_spent, 0.3);

        ledger.release_at(&released, t0()).unwrap();
        assert!(ledger.release_at(&released, t0()).unwrap().repeated);

        assert!((ledger.remaining_at(&patients(), t0()).unwrap().epsilon - 0.7).abs() < 1e-12);
        assert_eq!(
            ledger.commit_at(&released, t0()),
            Err(BudgetError::UnknownReservation(released.clone()))
        );
        assert_eq!(
            ledger.release_at(&committed, t0()),
            Err(BudgetError::UnknownReservation(committed.clone()))
        );
        assert!(matches!(
            ledger.commit(&ReservationId::from("rsv-missing")),
            Err(BudgetError::UnknownReservation(_))
        ));
    }

    #[test]
    fn expired_reservations_are_swept_lazily() {
        let ledger = BudgetLedger::new();
        let stale = reserve(&ledger, 0.9, t0()).unwrap();
        let later = t0() + Duration::minutes(6);

        assert_eq!(ledger.remaining_at(&patients(), later).unwrap().epsilon, 1.0);
        assert_eq!(
            ledger.commit_at(&stale.reservation_id, later),
            Err(BudgetError::ReservationExpired(stale.reservation_id.clone()))
        );
        assert!(ledger.release_at(&stale.reservation_id, later).unwrap().repeated);
    }

    #[test]
    fn late_commit_releases_the_reservation() {
        let ledger = BudgetLedger::new();
        let reservation = reserve(&ledger, 0.5, t0()).unwrap();
        let err = ledger
            .commit_at(&reservation.reservation_id, reservation.expires_at)
            .unwrap_err();
        assert!(matches!(err, BudgetError::ReservationExpired(_)));
        let snapshot = ledger.snapshot_at(&patients(), reservation.expires_at).unwrap();
        assert_eq!(snapshot.epsilon_spent, 0.0);
        assert_eq!(snapshot.pending_reservations, 0);
    }

    #[test]
    fn halted_ledger_refuses_commits_but_releases() {
        let ledger = BudgetLedger::new();
        let first = reserve(&ledger, 0.2, t0()).unwrap().reservation_id;
        let second = reserve(&ledger, 0.2, t0()).unwrap().reservation_id;
        ledger.halt_commits("audit chain broken at sequence 3");

        assert!(matches!(
            ledger.commit_at(&first, t0()),
            Err(BudgetError::CommitsHalted { reason }) if reason.contains("sequence 3")
        ));
        ledger.release_at(&second, t0()).unwrap();

        ledger.resume_commits();
        assert_eq!(ledger.commits_halted(), None);
        ledger.commit_at(&first, t0()).unwrap();
    }

    #[test]
    fn export_and_restore_preserve_state() {
        let ledger = BudgetLedger::new();
        let committed = reserve(&ledger, 0.4, t0()).unwrap().reservation_id;
        ledger.commit_at(&committed, t0()).unwrap();
        let pending = reserve(&ledger, 0.2, t0()).unwrap().reservation_id;
        ledger
            .reserve_at(&DatasetId::new("claims"), 2.0, 0.0, 1.0, 0.0, Duration::minutes(1), t0())
            .unwrap();

        let exported = ledger.export();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].dataset_id, DatasetId::new("claims"));

        let json = serde_json::to_string(&exported).unwrap();
        let restored = BudgetLedger::restore(serde_json::from_str(&json).unwrap()).unwrap();
        assert!(restored.commit_at(&committed, t0()).unwrap().repeated);
        restored.commit_at(&pending, t0()).unwrap();
        assert!((restored.remaining_at(&patients(), t0()).unwrap().epsilon - 0.4).abs() < 1e-12);
    }

    #[test]
    fn restore_refuses_overspent_budgets() {
        let mut budget = PrivacyBudget::open(patients(), 1.0, 0.0);
        budget.epsilon_spent = 1.5;
        assert!(matches!(
            BudgetLedger::restore(vec![budget]),
            Err(BudgetError::InvalidParameters(_))
        ));
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let ledger = BudgetLedger::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        if let Ok(reservation) = reserve(&ledger, 0.01, t0()) {
                            ledger.commit_at(&reservation.reservation_id, t0()).unwrap();
                        }
                    }
                });
            }
        });
        let snapshot = ledger.snapshot_at(&patients(), t0()).unwrap();
        assert!(snapshot.epsilon_spent <= 1.0 + BUDGET_TOLERANCE);
        assert!(snapshot.epsilon_spent >= 0.99 - 1e-9);
    }

    #[test]
    fn resolved_reservations_are_forgotten_after_retention() {
        let ledger = BudgetLedger::new().with_retention(Duration::minutes(10));
        let committed = reserve(&ledger, 0.3, t0()).unwrap().reservation_id;
        ledger.commit_at(&committed, t0()).unwrap();
        let released = reserve(&ledger, 0.2, t0()).unwrap().reservation_id;
        ledger.release_at(&released, t0()).unwrap();
        let pending = reserve(&ledger, 0.1, t0() + Duration::minutes(8)).unwrap().reservation_id;
        assert_eq!(ledger.tracked_reservations(), 3);

        let later = t0() + Duration::minutes(11);
        assert_eq!(ledger.sweep_at(later), 0);
        assert_eq!(ledger.tracked_reservations(), 1);
        assert!(ledger.export()[0].resolved.is_empty());
        assert_eq!(
            ledger.commit_at(&committed, later),
            Err(BudgetError::UnknownReservation(committed.clone()))
        );
        assert!((ledger.remaining_at(&patients(), later).unwrap().epsilon - 0.6).abs() < 1e-12);
        ledger.commit_at(&pending, later).unwrap();
    }

    #[test]
    fn expiries_are_handed_out_once() {
        let ledger = BudgetLedger::new();
        let swept = reserve(&ledger, 0.2, t0()).unwrap().reservation_id;
        let late = ledger
            .reserve_at(&patients(), 1.0, 1e-5, 0.3, 0.0, Duration::minutes(20), t0())
            .unwrap();
        assert_eq!(ledger.sweep_at(t0() + Duration::minutes(6)), 1);
        assert!(matches!(
            ledger.commit_at(&late.reservation_id, late.expires_at),
            Err(BudgetError::ReservationExpired(_))
        ));

        let expired = ledger.take_expired();
        let ids: Vec<&ReservationId> = expired.iter().map(|s| &s.reservation_id).collect();
        assert_eq!(ids, vec![&swept, &late.reservation_id]);
        assert!(expired.iter().all(|s| !s.repeated && s.epsilon_spent == 0.0));
        assert!(ledger.take_expired().is_empty());
        assert!(ledger.release_at(&swept, late.expires_at).unwrap().repeated);
    }

    #[test]
    fn basic_composition_adds_costs() {
        assert!((basic_composition([0.1, 0.2, 0.3]) - 0.6).abs() < 1e-12);
        assert_eq!(basic_composition(Vec::<f64>::new()), 0.0);
    }
}
