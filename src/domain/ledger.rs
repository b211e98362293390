//! Ledger events and the projection folded from them.
//!
//! The ledger never rewrites history: every run or attempt transition is a
//! new [`LedgerEntry`], and the current state of a run or attempt is simply
//! its latest transition. Both storage backends share [`LedgerProjection`]
//! so the transition rules are enforced identically at the point of append.

use super::attempt::{AttemptStatus, IdempotencyKey, PaymentAttempt};
use super::money::Balance;
use super::run::{PayrollRun, PlanKey, RunId, RunStatus};
use crate::error::{PayrollError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A committed run; implicitly creates one Pending attempt per snapshot payee.
    RunPlanned { run: PayrollRun },
    RunStatusChanged {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    CancelRequested { run_id: RunId },
    AttemptRecorded { attempt: PaymentAttempt },
}

impl LedgerEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            LedgerEvent::RunPlanned { run } => run.run_id,
            LedgerEvent::RunStatusChanged { run_id, .. } => *run_id,
            LedgerEvent::CancelRequested { run_id } => *run_id,
            LedgerEvent::AttemptRecorded { attempt } => attempt.run_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct LedgerEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: LedgerEvent,
}

/// Current state of every run and attempt, rebuilt by folding entries.
#[derive(Debug, Default, Clone)]
pub struct LedgerProjection {
    runs: HashMap<RunId, PayrollRun>,
    run_order: Vec<RunId>,
    attempts: HashMap<IdempotencyKey, PaymentAttempt>,
    by_plan_key: HashMap<PlanKey, RunId>,
}

fn illegal(msg: String) -> PayrollError {
    PayrollError::IllegalTransition(msg)
}

impl LedgerProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects events that would break a run or attempt invariant.
    pub fn validate(&self, event: &LedgerEvent) -> Result<()> {
        match event {
            LedgerEvent::RunPlanned { run } => {
                if self.runs.contains_key(&run.run_id) {
                    return Err(illegal(format!("run {} already recorded", run.run_id)));
                }
                if run.status != RunStatus::Planned || run.cancel_requested {
                    return Err(illegal(format!("run {} must start Planned", run.run_id)));
                }
                if let Some(open) = self.runs.values().find(|r| !r.status.is_terminal()) {
                    return Err(PayrollError::ConcurrentRunConflict(format!(
                        "run {} is still open",
                        open.run_id
                    )));
                }
                if let Some(existing) = self.run_by_plan_key(&run.plan_key)
                    && existing.status != RunStatus::Cancelled
                {
                    return Err(PayrollError::ConcurrentRunConflict(format!(
                        "run {} already covers this pay date and due set",
                        existing.run_id
                    )));
                }
                if run.payee_snapshot.is_empty() {
                    return Err(illegal(format!("run {} has no payees", run.run_id)));
                }
                let mut seen = HashSet::new();
                if !run.payee_snapshot.iter().all(|p| seen.insert(&p.id)) {
                    return Err(illegal(format!("run {} repeats a payee", run.run_id)));
                }
                let total = Balance::checked_sum(run.payee_snapshot.iter().map(|p| p.amount))
                    .map_err(|err| illegal(format!("run {}: {err}", run.run_id)))?;
                if total != run.total_required {
                    return Err(illegal(format!(
                        "run {} total {} does not match snapshot {}",
                        run.run_id, run.total_required, total
                    )));
                }
                Ok(())
            }
            LedgerEvent::RunStatusChanged { run_id, from, to } => {
                let run = self.require_run(*run_id)?;
                if run.status != *from || !from.can_transition_to(*to) {
                    return Err(illegal(format!(
                        "run {run_id} cannot move from {} to {to}",
                        run.status
                    )));
                }
                if to.is_terminal() {
                    let settled = RunStatus::settle(&self.attempts(*run_id), run.cancel_requested);
                    if settled != Some(*to) {
                        return Err(illegal(format!(
                            "run {run_id} cannot close as {to} while attempts settle to {settled:?}"
                        )));
                    }
                }
                Ok(())
            }
            LedgerEvent::CancelRequested { run_id } => {
                let run = self.require_run(*run_id)?;
                if run.status.is_terminal() {
                    return Err(PayrollError::RunNotActive(*run_id));
                }
                Ok(())
            }
            LedgerEvent::AttemptRecorded { attempt } => {
                let run = self.require_run(attempt.run_id)?;
                if run.status.is_terminal() {
                    return Err(PayrollError::RunNotActive(attempt.run_id));
                }
                let key = attempt.key();
                let previous = self
                    .attempts
                    .get(&key)
                    .ok_or_else(|| illegal(format!("attempt {key} is not part of its run")))?;
                if previous.payee_id != attempt.payee_id
                    || previous.amount != attempt.amount
                    || previous.destination_ref != attempt.destination_ref
                {
                    return Err(illegal(format!("attempt {key} diverges from the snapshot")));
                }
                if !previous.status.can_transition_to(&attempt.status) {
                    return Err(illegal(format!(
                        "attempt {key} cannot move from {} to {}",
                        previous.status.label(),
                        attempt.status.label()
                    )));
                }
                if attempt.attempt_count < previous.attempt_count {
                    return Err(illegal(format!("attempt {key} count went backwards")));
                }
                if run.cancel_requested && attempt.attempt_count > previous.attempt_count {
                    return Err(illegal(format!(
                        "attempt {key} cannot be submitted after run {} was cancelled",
                        run.run_id
                    )));
                }
                if matches!(attempt.status, AttemptStatus::Confirmed { .. }) {
                    let confirmed = self.confirmed_total(attempt.run_id);
                    let after = confirmed.checked_add(attempt.amount.into());
                    if after.is_none_or(|after| after > run.total_required) {
                        return Err(illegal(format!(
                            "confirming {key} would exceed run total {}",
                            run.total_required
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Applies an already validated (or replayed) event.
    pub fn apply(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::RunPlanned { run } => {
                for attempt in run.initial_attempts() {
                    self.attempts.insert(attempt.key(), attempt);
                }
                self.by_plan_key.insert(run.plan_key.clone(), run.run_id);
                self.run_order.push(run.run_id);
                self.runs.insert(run.run_id, run.clone());
            }
            LedgerEvent::RunStatusChanged { run_id, to, .. } => {
                if let Some(run) = self.runs.get_mut(run_id) {
                    run.status = *to;
                }
            }
            LedgerEvent::CancelRequested { run_id } => {
                if let Some(run) = self.runs.get_mut(run_id) {
                    run.cancel_requested = true;
                }
            }
            LedgerEvent::AttemptRecorded { attempt } => {
                self.attempts.insert(attempt.key(), attempt.clone());
            }
        }
    }

    pub fn apply_checked(&mut self, event: &LedgerEvent) -> Result<()> {
        self.validate(event)?;
        self.apply(event);
        Ok(())
    }

    fn require_run(&self, run_id: RunId) -> Result<&PayrollRun> {
        self.runs
            .get(&run_id)
            .ok_or(PayrollError::RunNotFound(run_id))
    }

    pub fn run(&self, run_id: RunId) -> Option<&PayrollRun> {
        self.runs.get(&run_id)
    }

    pub fn run_by_plan_key(&self, key: &PlanKey) -> Option<&PayrollRun> {
        self.by_plan_key.get(key).and_then(|id| self.runs.get(id))
    }

    /// All runs in creation order.
    pub fn runs(&self) -> Vec<PayrollRun> {
        self.run_order
            .iter()
            .filter_map(|id| self.runs.get(id))
            .cloned()
            .collect()
    }

    /// Attempts of a run in snapshot order.
    pub fn attempts(&self, run_id: RunId) -> Vec<PaymentAttempt> {
        let Some(run) = self.runs.get(&run_id) else {
            return Vec::new();
        };
        run.payee_snapshot
            .iter()
            .filter_map(|p| self.attempts.get(&IdempotencyKey::derive(run_id, &p.id)))
            .cloned()
            .collect()
    }

    pub fn attempt(&self, key: &IdempotencyKey) -> Option<&PaymentAttempt> {
        self.attempts.get(key)
    }

    pub fn non_terminal_runs(&self) -> Vec<PayrollRun> {
        self.runs()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect()
    }

    pub fn non_terminal_attempts(&self) -> Vec<PaymentAttempt> {
        self.run_order
            .iter()
            .flat_map(|id| self.attempts(*id))
            .filter(|a| !a.status.is_terminal())
            .collect()
    }

    pub fn confirmed_total(&self, run_id: RunId) -> Balance {
        self.attempts(run_id)
            .into_iter()
            .filter(|a| matches!(a.status, AttemptStatus::Confirmed { .. }))
            .map(|a| a.amount)
            .sum()
    }
}
