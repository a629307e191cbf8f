//! Sequences one generation request through the engine:
//! reserve budget, await candidates, run disclosure and compliance checks,
//! then commit or release and record every step in the audit trail.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration as StdDuration, Instant},
};

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use synthguard_audit::{AuditError, AuditPayload, AuditTrail, JsonLinesAuditStore, ReleaseCause};
use synthguard_telemetry::TelemetryHandle;
use tracing::{debug, info, warn};

use crate::{
    budget::{BudgetError, BudgetLedger, DatasetId, Reservation, ReservationId, Settlement},
    compliance::{
        ComplianceRuleEngine, ComplianceVerdict, Framework, RuleCatalog, RuleSets, RuleViolation,
    },
    config::{BudgetConfig, DatasetPolicy, EngineConfig},
    disclosure::{DisclosureAnalyzer, DisclosureReport, DisclosureViolation},
    errors::{PrivacyError, PrivacyResult},
    levels::PrivacyLevel,
    noise::{calibrate, NoiseMechanism, NoiseParameters},
    record::Record,
    replay::replay_ledger,
    risk::{assess_risk, RiskAssessment},
    source::{GenerationRequest, RecordSource, SourceError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationState {
    Idle,
    BudgetReserved,
    AwaitingCandidates,
    Checked,
    Resolved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameworkSelection {
    pub framework: Framework,
    /// Advisory frameworks are evaluated and logged but never block release.
    pub blocking: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct NoiseRequest {
    pub mechanism: NoiseMechanism,
    pub sensitivity: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvaluationRequest {
    pub dataset_id: DatasetId,
    pub epsilon: f64,
    pub delta: f64,
    /// Overrides the configured totals for a dataset seen for the first time.
    pub totals: Option<DatasetPolicy>,
    pub quasi_identifiers: BTreeSet<String>,
    pub sensitive_columns: BTreeSet<String>,
    pub k_threshold: u64,
    pub frameworks: Vec<FrameworkSelection>,
    pub schema: serde_json::Value,
    pub hint: Option<String>,
    pub batch_size: usize,
    pub noise: Option<NoiseRequest>,
    /// Reservation lifetime; the configured default applies when unset.
    pub ttl: Option<StdDuration>,
}

impl EvaluationRequest {
    pub fn new(dataset_id: impl Into<String>, epsilon: f64) -> Self {
        Self {
            dataset_id: DatasetId::new(dataset_id),
            epsilon,
            delta: 0.0,
            totals: None,
            quasi_identifiers: BTreeSet::new(),
            sensitive_columns: BTreeSet::new(),
            k_threshold: 1,
            frameworks: Vec::new(),
            schema: serde_json::Value::Null,
            hint: None,
            batch_size: 100,
            noise: None,
            ttl: None,
        }
    }

    pub fn at_level(dataset_id: impl Into<String>, level: PrivacyLevel) -> Self {
        Self::new(dataset_id, level.epsilon())
    }

    pub fn delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    pub fn totals(mut self, epsilon_total: f64, delta_total: f64) -> Self {
        self.totals = Some(DatasetPolicy {
            epsilon_total,
            delta_total,
        });
        self
    }

    pub fn quasi_identifiers<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.quasi_identifiers = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn sensitive_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn k_threshold(mut self, k: u64) -> Self {
        self.k_threshold = k;
        self
    }

    pub fn framework(mut self, name: &str) -> Self {
        self.frameworks.push(FrameworkSelection {
            framework: Framework::new(name),
            blocking: true,
        });
        self
    }

    pub fn advisory_framework(mut self, name: &str) -> Self {
        self.frameworks.push(FrameworkSelection {
            framework: Framework::new(name),
            blocking: false,
        });
        self
    }

    pub fn schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn noise(mut self, mechanism: NoiseMechanism, sensitivity: f64) -> Self {
        self.noise = Some(NoiseRequest {
            mechanism,
            sensitivity,
        });
        self
    }

    pub fn ttl(mut self, ttl: StdDuration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    Disclosure { violation: DisclosureViolation },
    /// The smallest class is at or below the hard floor; compliance was
    /// skipped.
    BelowKFloor { k_min: u64, k_floor: u64 },
    Compliance {
        framework: Framework,
        violation: RuleViolation,
    },
    SourceUnavailable { message: String },
    SourceTimeout,
    ReservationExpired,
    Cancelled,
    CommitsHalted { reason: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disclosure { violation } => write!(f, "{violation}"),
            Self::BelowKFloor { k_min, k_floor } => {
                write!(f, "smallest class has {k_min} rows, at or below the floor of {k_floor}")
            }
            Self::Compliance {
                framework,
                violation,
            } => write!(
                f,
                "{framework} rule {} failed on record {} ({}): {}",
                violation.rule_id, violation.record_index, violation.field, violation.message
            ),
            Self::SourceUnavailable { message } => write!(f, "record source unavailable: {message}"),
            Self::SourceTimeout => f.write_str("record source timed out"),
            Self::ReservationExpired => f.write_str("reservation expired before checks completed"),
            Self::Cancelled => f.write_str("evaluation cancelled"),
            Self::CommitsHalted { reason } => write!(f, "commits halted: {reason}"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Acceptance {
    pub reservation_id: ReservationId,
    pub rows: Vec<Record>,
    pub disclosure: DisclosureReport,
    pub compliance: BTreeMap<Framework, ComplianceVerdict>,
    pub risk: RiskAssessment,
    pub settlement: Settlement,
    pub noise: Option<NoiseParameters>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Rejection {
    pub reservation_id: Option<ReservationId>,
    /// Furthest state reached before the rejection.
    pub reached: EvaluationState,
    pub reasons: Vec<RejectionReason>,
    pub disclosure: Option<DisclosureReport>,
    pub compliance: BTreeMap<Framework, ComplianceVerdict>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Accepted(Acceptance),
    Rejected(Rejection),
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn reasons(&self) -> &[RejectionReason] {
        match self {
            Self::Accepted(_) => &[],
            Self::Rejected(rejection) => &rejection.reasons,
        }
    }

    pub fn reservation_id(&self) -> Option<&ReservationId> {
        match self {
            Self::Accepted(acceptance) => Some(&acceptance.reservation_id),
            Self::Rejected(rejection) => rejection.reservation_id.as_ref(),
        }
    }
}

/// Where an in-flight evaluation stands; read back when it is cancelled.
#[derive(Debug)]
struct Progress {
    reservation_id: Option<ReservationId>,
    state: EvaluationState,
}

impl Progress {
    fn new() -> Mutex<Self> {
        Mutex::new(Self {
            reservation_id: None,
            state: EvaluationState::Idle,
        })
    }
}

fn advance(progress: &Mutex<Progress>, state: EvaluationState) {
    progress.lock().state = state;
    debug!(?state, "evaluation state");
}

enum Verdict {
    Release {
        cause: ReleaseCause,
        reasons: Vec<RejectionReason>,
        disclosure: Option<DisclosureReport>,
        compliance: BTreeMap<Framework, ComplianceVerdict>,
    },
    Commit {
        rows: Vec<Record>,
        disclosure: DisclosureReport,
        compliance: BTreeMap<Framework, ComplianceVerdict>,
    },
}

impl Verdict {
    fn release(cause: ReleaseCause, reason: RejectionReason) -> Self {
        Self::Release {
            cause,
            reasons: vec![reason],
            disclosure: None,
            compliance: BTreeMap::new(),
        }
    }
}

/// Releases its reservation when dropped while still armed, which covers
/// the caller dropping an in-flight `evaluate` future.
struct ReservationGuard<'a> {
    orchestrator: &'a PrivacyOrchestrator,
    reservation: Reservation,
    armed: bool,
}

impl<'a> ReservationGuard<'a> {
    fn commit(&mut self) -> Result<Settlement, BudgetError> {
        let settlement = self
            .orchestrator
            .ledger
            .commit(&self.reservation.reservation_id)?;
        self.armed = false;
        Ok(settlement)
    }

    async fn release(mut self, cause: ReleaseCause) -> PrivacyResult<()> {
        self.armed = false;
        let orchestrator = self.orchestrator;
        match orchestrator.settle_release(&self.reservation, cause)? {
            Some(payload) => orchestrator.append(payload).await,
            None => Ok(()),
        }
    }
}

impl Drop for ReservationGuard<'_> {
    /// Drop cannot await, so the audit append runs inline.
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let released = self
            .orchestrator
            .settle_release(&self.reservation, ReleaseCause::Cancelled)
            .and_then(|payload| match payload {
                Some(payload) => Ok(self.orchestrator.audit.append(payload).map(drop)?),
                None => Ok(()),
            });
        if let Err(err) = released {
            warn!(
                reservation_id = %self.reservation.reservation_id,
                error = %err,
                "failed to release reservation of a dropped evaluation"
            );
        }
    }
}

pub struct PrivacyOrchestrator {
    ledger: Arc<BudgetLedger>,
    audit: Arc<AuditTrail>,
    disclosure: DisclosureAnalyzer,
    compliance: ComplianceRuleEngine,
    source: Arc<dyn RecordSource>,
    telemetry: TelemetryHandle,
    budget: BudgetConfig,
}

impl PrivacyOrchestrator {
    /// Builds the engine from configuration: compiles rule sets and opens
    /// the audit log. An existing log resumes its chain and rebuilds the
    /// ledger from the spend it records; a log that fails verification
    /// leaves commits halted.
    pub fn from_config(config: &EngineConfig, source: Arc<dyn RecordSource>) -> PrivacyResult<Self> {
        config.validate()?;
        let catalog = RuleCatalog::from_config(&config.compliance)?;
        let retention = Duration::milliseconds(config.budget.reservation_ttl_ms as i64);
        let Some(path) = &config.audit.log_path else {
            return Ok(Self::with_parts(
                config,
                Arc::new(BudgetLedger::new().with_retention(retention)),
                Arc::new(AuditTrail::in_memory()),
                catalog,
                source,
            ));
        };

        let audit = AuditTrail::open(JsonLinesAuditStore::open(path).map_err(AuditError::from)?)?;
        let entries = match audit.stored() {
            0 => Vec::new(),
            stored => audit.entries(0, stored - 1)?,
        };
        let replay = replay_ledger(&entries, &config.budget)?;
        let orchestrator = Self::with_parts(
            config,
            Arc::new(replay.ledger.with_retention(retention)),
            Arc::new(audit),
            catalog,
            source,
        );
        match orchestrator.verify_audit_all() {
            Ok(()) => {}
            Err(PrivacyError::Audit(AuditError::Chain(err))) => {
                warn!(path = %path.display(), error = %err, "audit log failed verification");
            }
            Err(err) => return Err(err),
        }
        for orphan in replay.orphaned {
            orchestrator.audit.append(AuditPayload::Released {
                dataset_id: orphan.dataset_id.to_string(),
                reservation_id: orphan.reservation_id.to_string(),
                epsilon: orphan.epsilon,
                delta: orphan.delta,
                cause: ReleaseCause::Expired,
            })?;
        }
        info!(
            path = %path.display(),
            entries = entries.len(),
            datasets = orchestrator.ledger.export().len(),
            "ledger rebuilt from audit log"
        );
        Ok(orchestrator)
    }

    pub fn with_parts(
        config: &EngineConfig,
        ledger: Arc<BudgetLedger>,
        audit: Arc<AuditTrail>,
        catalog: RuleCatalog,
        source: Arc<dyn RecordSource>,
    ) -> Self {
        Self {
            ledger,
            audit,
            disclosure: DisclosureAnalyzer::new(config.disclosure.clone()),
            compliance: ComplianceRuleEngine::new(catalog),
            source,
            telemetry: TelemetryHandle::from_config(config.telemetry.clone()),
            budget: config.budget.clone(),
        }
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    pub async fn evaluate(&self, request: EvaluationRequest) -> PrivacyResult<Decision> {
        let progress = Progress::new();
        self.instrumented(request, &progress).await
    }

    /// Like [`evaluate`](Self::evaluate), but gives up as soon as `cancel`
    /// completes before the batch is checked. A cancelled evaluation always
    /// releases its reservation.
    pub async fn evaluate_with_cancellation<C>(
        &self,
        request: EvaluationRequest,
        cancel: C,
    ) -> PrivacyResult<Decision>
    where
        C: Future<Output = ()> + Send,
    {
        let progress = Progress::new();
        let finished = tokio::select! {
            biased;
            decision = self.instrumented(request, &progress) => Some(decision),
            _ = cancel => None,
        };
        if let Some(decision) = finished {
            return decision;
        }
        let Progress {
            reservation_id,
            state,
        } = progress.into_inner();
        info!(?reservation_id, ?state, "evaluation cancelled");
        self.count("evaluations.cancelled");
        Ok(Decision::Rejected(Rejection {
            reservation_id,
            reached: state,
            reasons: vec![RejectionReason::Cancelled],
            disclosure: None,
            compliance: BTreeMap::new(),
        }))
    }

    /// Verifies `from..=to` of the audit chain. A broken chain halts budget
    /// commits until an operator calls `resume_commits` on the ledger.
    pub fn verify_audit(&self, from: u64, to: u64) -> PrivacyResult<()> {
        self.audit.verify_chain(from, to).map_err(|err| self.on_verify_error(err))
    }

    pub fn verify_audit_all(&self) -> PrivacyResult<()> {
        self.audit.verify_all().map_err(|err| self.on_verify_error(err))
    }

    fn on_verify_error(&self, err: AuditError) -> PrivacyError {
        if let AuditError::Chain(chain) = &err {
            self.ledger.halt_commits(chain.to_string());
            self.count("audit.chain_broken");
        }
        err.into()
    }

    async fn instrumented(
        &self,
        request: EvaluationRequest,
        progress: &Mutex<Progress>,
    ) -> PrivacyResult<Decision> {
        let started = Instant::now();
        let dataset_id = request.dataset_id.clone();
        let outcome = self.run(request, progress).await;
        self.telemetry
            .record_latency_ms("evaluate", started.elapsed().as_millis() as u64);
        match &outcome {
            Ok(Decision::Accepted(_)) => self.count("evaluations.accepted"),
            Ok(Decision::Rejected(_)) => self.count("evaluations.rejected"),
            Err(PrivacyError::Budget(BudgetError::InsufficientBudget { .. })) => {
                self.count("evaluations.insufficient_budget")
            }
            Err(_) => self.count("evaluations.failed"),
        }
        if let Ok(remaining) = self.ledger.remaining(&dataset_id) {
            let gauge = format!("budget.epsilon_remaining.{dataset_id}");
            if let Err(err) = self.telemetry.set_gauge(&gauge, remaining.epsilon) {
                warn!(error = %err, "failed to record budget gauge");
            }
        }
        self.record_expired().await;
        if let Some(snapshot) = self.telemetry.flush_due() {
            info!(
                counters = ?snapshot.counters,
                gauges = ?snapshot.gauges,
                latency_samples = snapshot.latencies_ms.values().map(Vec::len).sum::<usize>(),
                "telemetry snapshot"
            );
        }
        outcome
    }

    /// Writes a release entry for every reservation the ledger expired.
    async fn record_expired(&self) {
        self.ledger.sweep();
        for settlement in self.ledger.take_expired() {
            self.count("reservations.expired");
            let appended = self
                .append(AuditPayload::Released {
                    dataset_id: settlement.dataset_id.to_string(),
                    reservation_id: settlement.reservation_id.to_string(),
                    epsilon: settlement.epsilon,
                    delta: settlement.delta,
                    cause: ReleaseCause::Expired,
                })
                .await;
            if let Err(err) = appended {
                warn!(reservation_id = %settlement.reservation_id, error = %err, "failed to record expiry");
            }
        }
    }

    async fn run(
        &self,
        request: EvaluationRequest,
        progress: &Mutex<Progress>,
    ) -> PrivacyResult<Decision> {
        let (noise, rule_sets) = self.validate(&request)?;
        let totals = request
            .totals
            .unwrap_or_else(|| self.budget.policy_for(request.dataset_id.as_str()));
        let ttl = match request.ttl {
            Some(ttl) => Duration::from_std(ttl)
                .map_err(|_| PrivacyError::InvalidRequest("reservation ttl out of range".into()))?,
            None => Duration::milliseconds(self.budget.reservation_ttl_ms as i64),
        };

        let reservation = self
            .ledger
            .reserve(
                &request.dataset_id,
                totals.epsilon_total,
                totals.delta_total,
                request.epsilon,
                request.delta,
                ttl,
            )
            .inspect_err(|err| {
                info!(dataset_id = %request.dataset_id, error = %err, "reservation refused");
            })?;
        progress.lock().reservation_id = Some(reservation.reservation_id.clone());
        advance(progress, EvaluationState::BudgetReserved);

        let mut guard = ReservationGuard {
            orchestrator: self,
            reservation,
            armed: true,
        };
        let verdict = match self
            .check(&guard.reservation, &request, noise, &rule_sets, progress)
            .await
        {
            Ok(verdict) => verdict,
            Err(err) => {
                if let Err(release_err) = guard.release(ReleaseCause::Aborted).await {
                    warn!(error = %release_err, "failed to release reservation after error");
                }
                return Err(err);
            }
        };

        let reservation_id = guard.reservation.reservation_id.clone();
        let (reached, cause, reasons, disclosure, compliance) = match verdict {
            Verdict::Commit {
                rows,
                disclosure,
                compliance,
            } => match guard.commit() {
                Ok(settlement) => {
                    advance(progress, EvaluationState::Resolved);
                    self.append(AuditPayload::Committed {
                        dataset_id: settlement.dataset_id.to_string(),
                        reservation_id: reservation_id.to_string(),
                        epsilon: settlement.epsilon,
                        delta: settlement.delta,
                        epsilon_spent: settlement.epsilon_spent,
                        delta_spent: settlement.delta_spent,
                    })
                    .await
                    .inspect_err(|err| {
                        warn!(%reservation_id, error = %err, "budget committed but audit append failed");
                    })?;
                    info!(
                        dataset_id = %request.dataset_id,
                        %reservation_id,
                        epsilon_spent = settlement.epsilon_spent,
                        "batch accepted"
                    );
                    let risk = assess_risk(&disclosure);
                    return Ok(Decision::Accepted(Acceptance {
                        reservation_id,
                        rows,
                        disclosure,
                        compliance,
                        risk,
                        settlement,
                        noise,
                    }));
                }
                Err(BudgetError::CommitsHalted { reason }) => (
                    EvaluationState::Checked,
                    ReleaseCause::CommitsHalted,
                    vec![RejectionReason::CommitsHalted { reason }],
                    Some(disclosure),
                    compliance,
                ),
                Err(BudgetError::ReservationExpired(_)) => (
                    EvaluationState::Checked,
                    ReleaseCause::Expired,
                    vec![RejectionReason::ReservationExpired],
                    Some(disclosure),
                    compliance,
                ),
                Err(err) => {
                    if let Err(release_err) = guard.release(ReleaseCause::Aborted).await {
                        warn!(error = %release_err, "failed to release reservation after commit error");
                    }
                    return Err(err.into());
                }
            },
            Verdict::Release {
                cause,
                reasons,
                disclosure,
                compliance,
            } => (progress.lock().state, cause, reasons, disclosure, compliance),
        };

        guard.release(cause).await?;
        advance(progress, EvaluationState::Resolved);
        info!(
            dataset_id = %request.dataset_id,
            %reservation_id,
            reasons = reasons.len(),
            "batch rejected; budget released"
        );
        Ok(Decision::Rejected(Rejection {
            reservation_id: Some(reservation_id),
            reached,
            reasons,
            disclosure,
            compliance,
        }))
    }

    /// Everything that can be refused without touching the budget.
    fn validate(
        &self,
        request: &EvaluationRequest,
    ) -> PrivacyResult<(Option<NoiseParameters>, RuleSets)> {
        if request.k_threshold == 0 {
            return Err(PrivacyError::InvalidRequest("k threshold must be at least 1".into()));
        }
        let rule_sets = self
            .compliance
            .select(request.frameworks.iter().map(|s| &s.framework))?;
        DisclosureAnalyzer::check_columns(&request.quasi_identifiers, &request.sensitive_columns)?;
        let noise = request
            .noise
            .map(|noise| calibrate(noise.mechanism, noise.sensitivity, request.epsilon, request.delta))
            .transpose()?;
        Ok((noise, rule_sets))
    }

    /// Runs the request from `BudgetReserved` up to a commit-or-release
    /// verdict.
    async fn check(
        &self,
        reservation: &Reservation,
        request: &EvaluationRequest,
        noise: Option<NoiseParameters>,
        rule_sets: &RuleSets,
        progress: &Mutex<Progress>,
    ) -> PrivacyResult<Verdict> {
        let dataset_id = request.dataset_id.to_string();
        let reservation_id = reservation.reservation_id.to_string();
        let totals = self.ledger.snapshot(&request.dataset_id)?;
        self.append(AuditPayload::Reserved {
            dataset_id: dataset_id.clone(),
            reservation_id: reservation_id.clone(),
            epsilon: reservation.epsilon,
            delta: reservation.delta,
            epsilon_total: totals.epsilon_total,
            delta_total: totals.delta_total,
            expires_at: reservation.expires_at,
        })
        .await?;

        advance(progress, EvaluationState::AwaitingCandidates);
        let generation = GenerationRequest {
            dataset_id: request.dataset_id.clone(),
            schema: request.schema.clone(),
            hint: request.hint.clone(),
            batch_size: request.batch_size,
            noise,
        };
        let time_left = (reservation.expires_at - Utc::now())
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        let rows = match tokio::time::timeout(time_left, self.source.generate(&generation)).await {
            Err(_) => {
                warn!(%dataset_id, %reservation_id, "reservation expired while awaiting candidates");
                return Ok(Verdict::release(
                    ReleaseCause::Expired,
                    RejectionReason::ReservationExpired,
                ));
            }
            Ok(Err(SourceError::SourceUnavailable(message))) => {
                warn!(%dataset_id, %reservation_id, %message, "record source unavailable");
                return Ok(Verdict::release(
                    ReleaseCause::SourceUnavailable,
                    RejectionReason::SourceUnavailable { message },
                ));
            }
            Ok(Err(SourceError::SourceTimeout(after))) => {
                warn!(%dataset_id, %reservation_id, ?after, "record source timed out");
                return Ok(Verdict::release(
                    ReleaseCause::SourceTimeout,
                    RejectionReason::SourceTimeout,
                ));
            }
            Ok(Ok(rows)) => rows,
        };

        let disclosure = self.disclosure.analyze(
            &rows,
            &request.quasi_identifiers,
            &request.sensitive_columns,
            request.k_threshold,
        )?;
        self.append(AuditPayload::DisclosureChecked {
            dataset_id: dataset_id.clone(),
            reservation_id: reservation_id.clone(),
            summary: disclosure.summary(),
        })
        .await?;
        let mut reasons: Vec<RejectionReason> = disclosure
            .violations
            .iter()
            .cloned()
            .map(|violation| RejectionReason::Disclosure { violation })
            .collect();

        let k_floor = self.disclosure.config().k_floor;
        if disclosure.below_floor(k_floor) {
            advance(progress, EvaluationState::Checked);
            reasons.insert(
                0,
                RejectionReason::BelowKFloor {
                    k_min: disclosure.k_min,
                    k_floor,
                },
            );
            return Ok(Verdict::Release {
                cause: ReleaseCause::Rejected,
                reasons,
                disclosure: Some(disclosure),
                compliance: BTreeMap::new(),
            });
        }

        let compliance = ComplianceRuleEngine::evaluate(&rows, rule_sets);
        self.append(AuditPayload::ComplianceChecked {
            dataset_id,
            reservation_id,
            frameworks: request
                .frameworks
                .iter()
                .filter_map(|s| compliance.get(&s.framework).map(|v| v.summary(s.blocking)))
                .collect(),
        })
        .await?;
        advance(progress, EvaluationState::Checked);

        for selection in request.frameworks.iter().filter(|s| s.blocking) {
            if let Some(verdict) = compliance.get(&selection.framework) {
                reasons.extend(verdict.violations.iter().map(|violation| {
                    RejectionReason::Compliance {
                        framework: selection.framework.clone(),
                        violation: violation.clone(),
                    }
                }));
            }
        }

        if reasons.is_empty() {
            Ok(Verdict::Commit {
                rows,
                disclosure,
                compliance,
            })
        } else {
            Ok(Verdict::Release {
                cause: ReleaseCause::Rejected,
                reasons,
                disclosure: Some(disclosure),
                compliance,
            })
        }
    }

    /// Releases the reservation in the ledger and returns the audit entry
    /// to write. A reservation the ledger already expired gets its entry
    /// from `record_expired` instead.
    fn settle_release(
        &self,
        reservation: &Reservation,
        cause: ReleaseCause,
    ) -> PrivacyResult<Option<AuditPayload>> {
        let settlement = self.ledger.release(&reservation.reservation_id)?;
        debug!(
            reservation_id = %reservation.reservation_id,
            ?cause,
            repeated = settlement.repeated,
            "reservation released"
        );
        if settlement.repeated {
            return Ok(None);
        }
        self.count("reservations.released");
        Ok(Some(AuditPayload::Released {
            dataset_id: settlement.dataset_id.to_string(),
            reservation_id: settlement.reservation_id.to_string(),
            epsilon: settlement.epsilon,
            delta: settlement.delta,
            cause,
        }))
    }

    /// Appends on the blocking pool so the store's sync never stalls a
    /// runtime worker.
    async fn append(&self, payload: AuditPayload) -> PrivacyResult<()> {
        let audit = Arc::clone(&self.audit);
        tokio::task::spawn_blocking(move || audit.append(payload)).await??;
        Ok(())
    }

    fn count(&self, name: &str) {
        if let Err(err) = self.telemetry.record_counter(name, 1) {
            warn!(metric = name, error = %err, "failed to record counter");
        }
    }
}

impl fmt::Debug for PrivacyOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivacyOrchestrator")
            .field("ledger", &self.ledger)
            .field("audit", &self.audit)
            .field("frameworks", &self.compliance.catalog().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticRecordSource;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn orchestrator(rows: Vec<serde_json::Value>) -> PrivacyOrchestrator {
        let rows = rows
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        PrivacyOrchestrator::from_config(
            &EngineConfig::default(),
            Arc::new(StaticRecordSource::new(rows)),
        )
        .unwrap()
    }

    #[test]
    fn builder_collects_columns_and_frameworks() {
        let request = EvaluationRequest::at_level("patients_v1", PrivacyLevel::High)
            .quasi_identifiers(["zip", "age_group"])
            .sensitive_columns(vec!["diagnosis".to_string()])
            .framework("hipaa")
            .advisory_framework("gdpr");
        assert_eq!(request.epsilon, 0.1);
        assert_eq!(request.quasi_identifiers.len(), 2);
        assert_eq!(
            request.frameworks,
            vec![
                FrameworkSelection {
                    framework: Framework::new("HIPAA"),
                    blocking: true
                },
                FrameworkSelection {
                    framework: Framework::new("GDPR"),
                    blocking: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn invalid_requests_never_reserve() {
        let engine = orchestrator(vec![json!({"zip": "1"})]);
        let unknown = EvaluationRequest::new("d", 0.1)
            .quasi_identifiers(["zip"])
            .framework("FERPA");
        assert!(matches!(
            engine.evaluate(unknown).await,
            Err(PrivacyError::Compliance(_))
        ));
        let no_columns = EvaluationRequest::new("d", 0.1);
        assert!(matches!(
            engine.evaluate(no_columns).await,
            Err(PrivacyError::Disclosure(_))
        ));
        let bad_noise = EvaluationRequest::new("d", 0.1)
            .quasi_identifiers(["zip"])
            .delta(1e-6)
            .noise(NoiseMechanism::Laplace, 1.0);
        assert!(matches!(
            engine.evaluate(bad_noise).await,
            Err(PrivacyError::Noise(_))
        ));
        assert!(engine.audit().is_empty());
        assert!(matches!(
            engine.ledger().remaining(&DatasetId::new("d")),
            Err(BudgetError::UnknownDataset(_))
        ));
    }

    #[tokio::test]
    async fn empty_batch_short_circuits_compliance() {
        let engine = orchestrator(Vec::new());
        let decision = engine
            .evaluate(
                EvaluationRequest::new("d", 0.1)
                    .quasi_identifiers(["zip"])
                    .framework("HIPAA"),
            )
            .await
            .unwrap();
        let Decision::Rejected(rejection) = decision else {
            panic!("empty batch must be rejected");
        };
        assert_eq!(
            rejection.reasons,
            vec![
                RejectionReason::BelowKFloor { k_min: 0, k_floor: 0 },
                RejectionReason::Disclosure {
                    violation: DisclosureViolation::EmptyBatch
                },
            ]
        );
        assert!(rejection.compliance.is_empty());
        assert_eq!(rejection.reached, EvaluationState::Checked);
        // reserved, disclosure checked, released
        assert_eq!(engine.audit().next_sequence_no(), 3);
        assert_eq!(engine.ledger().remaining(&DatasetId::new("d")).unwrap().epsilon, 1.0);
    }

    #[tokio::test]
    async fn accepted_batch_carries_calibrated_noise() {
        let rows: Vec<serde_json::Value> = (0..10)
            .map(|i| json!({"zip": "100", "diagnosis": if i % 2 == 0 { "flu" } else { "cold" }}))
            .collect();
        let engine = orchestrator(rows);
        let decision = engine
            .evaluate(
                EvaluationRequest::new("d", 0.5)
                    .delta(1e-6)
                    .quasi_identifiers(["zip"])
                    .sensitive_columns(["diagnosis"])
                    .k_threshold(5)
                    .noise(NoiseMechanism::Gaussian, 1.0),
            )
            .await
            .unwrap();
        let Decision::Accepted(acceptance) = decision else {
            panic!("expected acceptance: {decision:?}");
        };
        assert_eq!(acceptance.rows.len(), 10);
        assert_eq!(acceptance.noise.unwrap().mechanism, NoiseMechanism::Gaussian);
        assert_eq!(acceptance.settlement.epsilon_spent, 0.5);
        assert_eq!(engine.telemetry().counter("evaluations.accepted"), 1);
        engine.verify_audit_all().unwrap();
    }

    #[test]
    fn rejection_reasons_serialize_with_their_fields() {
        let reason = RejectionReason::CommitsHalted {
            reason: "audit chain broken".into(),
        };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value, json!({"kind": "commits_halted", "reason": "audit chain broken"}));
        let back: RejectionReason = serde_json::from_value(value).unwrap();
        assert_eq!(back, reason);
    }

    #[tokio::test]
    async fn expired_reservations_are_logged_once() {
        let engine = orchestrator(Vec::new());
        let stale = engine
            .ledger()
            .reserve_at(
                &DatasetId::new("stale"),
                1.0,
                0.0,
                0.4,
                0.0,
                Duration::minutes(1),
                Utc::now() - Duration::minutes(10),
            )
            .unwrap();
        let request = || EvaluationRequest::new("d", 0.1).quasi_identifiers(["zip"]);
        engine.evaluate(request()).await.unwrap();
        engine.evaluate(request()).await.unwrap();

        let expiries: Vec<AuditPayload> = engine
            .audit()
            .entries(0, engine.audit().stored() - 1)
            .unwrap()
            .into_iter()
            .map(|entry| entry.payload)
            .filter(|payload| {
                matches!(
                    payload,
                    AuditPayload::Released { reservation_id, cause: ReleaseCause::Expired, .. }
                        if *reservation_id == stale.reservation_id.to_string()
                )
            })
            .collect();
        assert_eq!(expiries.len(), 1);
        assert_eq!(engine.telemetry().counter("reservations.expired"), 1);
        engine.verify_audit_all().unwrap();
    }
}
