use crate::domain::attempt::{AttemptStatus, FailureCause, PaymentAttempt};
use crate::domain::money::Balance;
use crate::domain::payee::PayeeId;
use crate::domain::ports::Ledger;
use crate::domain::run::{PayrollRun, RunId};
use crate::error::{PayrollError, Result};

/// A payee that will not be paid by this run, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub payee_id: PayeeId,
    pub cause: FailureCause,
}

/// Operator-facing view of a run and every attempt in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run: PayrollRun,
    pub attempts: Vec<PaymentAttempt>,
}

impl RunSummary {
    pub async fn load(ledger: &dyn Ledger, run_id: RunId) -> Result<Self> {
        let run = ledger
            .run(run_id)
            .await?
            .ok_or(PayrollError::RunNotFound(run_id))?;
        let attempts = ledger.attempts(run_id).await?;
        Ok(Self { run, attempts })
    }

    pub fn total_confirmed(&self) -> Balance {
        self.confirmed().map(|a| a.amount).sum()
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &PaymentAttempt> {
        self.attempts
            .iter()
            .filter(|a| matches!(a.status, AttemptStatus::Confirmed { .. }))
    }

    pub fn failures(&self) -> Vec<AttemptFailure> {
        self.attempts
            .iter()
            .filter_map(|a| {
                a.failure().map(|cause| AttemptFailure {
                    payee_id: a.payee_id.clone(),
                    cause: cause.clone(),
                })
            })
            .collect()
    }

    /// Attempts not yet Confirmed or Failed.
    pub fn outstanding(&self) -> Vec<&PaymentAttempt> {
        self.attempts
            .iter()
            .filter(|a| !a.status.is_terminal())
            .collect()
    }

    pub fn attempt(&self, payee_id: &PayeeId) -> Option<&PaymentAttempt> {
        self.attempts.iter().find(|a| &a.payee_id == payee_id)
    }
}
