use super::money::Amount;
use super::payee::{Payee, PayeeId};
use super::run::RunId;
use crate::error::PayrollError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key handed to the settlement network so a resubmission of the same
/// payment is recognised instead of paid twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn derive(run_id: RunId, payee_id: &PayeeId) -> Self {
        Self(format!("{run_id}:{payee_id}"))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub enum FailureCause {
    /// Settlement refused the payment outright.
    Rejected(String),
    /// Transient errors persisted past the retry budget; holds the last one.
    RetriesExhausted(String),
    /// The run was cancelled before this payment was submitted.
    Cancelled,
    /// Confirming this payment would exceed the run's verified total.
    BudgetExceeded,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Rejected(reason) => write!(f, "rejected: {reason}"),
            FailureCause::RetriesExhausted(last) => write!(f, "retries exhausted: {last}"),
            FailureCause::Cancelled => f.write_str("run cancelled"),
            FailureCause::BudgetExceeded => f.write_str("run budget exceeded"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Submitted,
    Confirmed { settlement_ref: String },
    Failed { cause: FailureCause },
    /// Outcome unresolved after a timeout; only a settlement query may close it.
    Unknown,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Confirmed { .. } | AttemptStatus::Failed { .. }
        )
    }

    pub fn can_transition_to(&self, next: &AttemptStatus) -> bool {
        use AttemptStatus::*;
        match (self, next) {
            (Pending, Submitted) => true,
            (
                Pending,
                Failed {
                    cause: FailureCause::Cancelled | FailureCause::BudgetExceeded,
                },
            ) => true,
            (Submitted | Unknown, Submitted | Confirmed { .. } | Failed { .. } | Unknown) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::Confirmed { .. } => "confirmed",
            AttemptStatus::Failed { .. } => "failed",
            AttemptStatus::Unknown => "unknown",
        }
    }
}

/// One payee's payment within a run.
///
/// `Submitted` with a `next_attempt_at` means the previous submission failed
/// transiently and a retry is scheduled; `Submitted` without one means a
/// call is (or was, before a crash) in flight and its outcome is in doubt.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct PaymentAttempt {
    pub run_id: RunId,
    pub payee_id: PayeeId,
    pub destination_ref: String,
    pub amount: Amount,
    pub status: AttemptStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PaymentAttempt {
    pub fn pending(run_id: RunId, payee: &Payee) -> Self {
        Self {
            run_id,
            payee_id: payee.id.clone(),
            destination_ref: payee.destination_ref.clone(),
            amount: payee.amount,
            status: AttemptStatus::Pending,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(self.run_id, &self.payee_id)
    }

    pub fn settlement_ref(&self) -> Option<&str> {
        match &self.status {
            AttemptStatus::Confirmed { settlement_ref } => Some(settlement_ref),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        match &self.status {
            AttemptStatus::Failed { cause } => Some(cause),
            _ => None,
        }
    }

    /// Ready to be (re)submitted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            AttemptStatus::Pending => true,
            AttemptStatus::Submitted => self.next_attempt_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    pub fn is_retry_scheduled(&self) -> bool {
        self.status == AttemptStatus::Submitted && self.next_attempt_at.is_some()
    }

    /// Settlement may or may not have the payment; it must be queried before
    /// anything else happens to this attempt.
    pub fn is_in_doubt(&self) -> bool {
        match self.status {
            AttemptStatus::Unknown => true,
            AttemptStatus::Submitted => self.next_attempt_at.is_none(),
            _ => false,
        }
    }

    fn transition(&mut self, next: AttemptStatus) -> Result<(), PayrollError> {
        if !self.status.can_transition_to(&next) {
            return Err(PayrollError::IllegalTransition(format!(
                "attempt {} cannot move from {} to {}",
                self.key(),
                self.status.label(),
                next.label()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Write-ahead state recorded before calling settlement.
    pub fn begin_submission(&mut self) -> Result<(), PayrollError> {
        self.transition(AttemptStatus::Submitted)?;
        self.attempt_count += 1;
        self.next_attempt_at = None;
        Ok(())
    }

    pub fn confirm(&mut self, settlement_ref: String) -> Result<(), PayrollError> {
        self.transition(AttemptStatus::Confirmed { settlement_ref })?;
        self.next_attempt_at = None;
        Ok(())
    }

    pub fn fail(&mut self, cause: FailureCause) -> Result<(), PayrollError> {
        self.transition(AttemptStatus::Failed { cause })?;
        self.next_attempt_at = None;
        Ok(())
    }

    pub fn schedule_retry(
        &mut self,
        at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Result<(), PayrollError> {
        self.transition(AttemptStatus::Submitted)?;
        self.next_attempt_at = Some(at);
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn mark_unknown(&mut self, error: impl Into<String>) -> Result<(), PayrollError> {
        self.transition(AttemptStatus::Unknown)?;
        self.next_attempt_at = None;
        self.last_error = Some(error.into());
        Ok(())
    }
}
