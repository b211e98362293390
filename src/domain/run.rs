use super::attempt::{AttemptStatus, PaymentAttempt};
use super::money::Balance;
use super::payee::{Payee, PayeeId};
use crate::error::PayrollError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Deterministic fingerprint of a pay date and its due set.
///
/// Two plans for the same date covering the same payees share a key, which
/// is how the planner recognises a duplicate run request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanKey(pub String);

impl PlanKey {
    pub fn derive(pay_date: NaiveDate, due: &[Payee]) -> Self {
        let mut ids: Vec<&PayeeId> = due.iter().map(|p| &p.id).collect();
        ids.sort();

        let mut hasher = Sha256::new();
        hasher.update(pay_date.to_string().as_bytes());
        for id in ids {
            hasher.update([0u8]);
            hasher.update(id.0.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum RunStatus {
    Planned,
    Active,
    Completed,
    PartiallyCompleted,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::PartiallyCompleted | RunStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Planned, Active)
                | (Planned, Cancelled)
                | (Active, Completed)
                | (Active, PartiallyCompleted)
                | (Active, Cancelled)
        )
    }

    /// Terminal status for a run whose attempts are all terminal, or `None`
    /// while any attempt is still open.
    pub fn settle(attempts: &[PaymentAttempt], cancel_requested: bool) -> Option<RunStatus> {
        if attempts.iter().any(|a| !a.status.is_terminal()) {
            return None;
        }
        if cancel_requested {
            Some(RunStatus::Cancelled)
        } else if attempts
            .iter()
            .all(|a| matches!(a.status, AttemptStatus::Confirmed { .. }))
        {
            Some(RunStatus::Completed)
        } else {
            Some(RunStatus::PartiallyCompleted)
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One payroll cycle over an immutable snapshot of due payees.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct PayrollRun {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub pay_date: NaiveDate,
    pub plan_key: PlanKey,
    pub payee_snapshot: Vec<Payee>,
    /// Sum of snapshot amounts; the upper bound on what the run may confirm.
    pub total_required: Balance,
    /// Treasury balance observed when the run was committed.
    pub verified_balance: Balance,
    pub status: RunStatus,
    pub cancel_requested: bool,
}

impl PayrollRun {
    /// Builds a Planned run over `due`. Fails when the snapshot total does
    /// not fit in a decimal.
    pub fn plan(
        pay_date: NaiveDate,
        due: Vec<Payee>,
        verified_balance: Balance,
        created_at: DateTime<Utc>,
    ) -> Result<Self, PayrollError> {
        let total_required = Balance::checked_sum(due.iter().map(|p| p.amount))?;
        let plan_key = PlanKey::derive(pay_date, &due);
        Ok(Self {
            run_id: RunId::new(),
            created_at,
            pay_date,
            plan_key,
            payee_snapshot: due,
            total_required,
            verified_balance,
            status: RunStatus::Planned,
            cancel_requested: false,
        })
    }

    pub fn snapshot_payee(&self, payee_id: &PayeeId) -> Option<&Payee> {
        self.payee_snapshot.iter().find(|p| &p.id == payee_id)
    }

    /// Fresh Pending attempts, one per snapshot payee.
    pub fn initial_attempts(&self) -> Vec<PaymentAttempt> {
        self.payee_snapshot
            .iter()
            .map(|payee| PaymentAttempt::pending(self.run_id, payee))
            .collect()
    }
}
