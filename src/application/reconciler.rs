use super::executor::DisbursementExecutor;
use super::lease::LeaseManager;
use super::summary::RunSummary;
use crate::domain::attempt::{AttemptStatus, FailureCause, PaymentAttempt};
use crate::domain::ledger::LedgerEvent;
use crate::domain::ports::{LedgerRef, SettlementRef, SettlementStatus};
use crate::domain::run::RunId;
use crate::error::{PayrollError, Result};
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

/// What a reconciliation pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// In-doubt attempts queried against settlement.
    pub examined: usize,
    /// Attempts settlement gave a definitive answer for.
    pub resolved: usize,
    /// Attempts still in doubt after querying.
    pub held: usize,
    /// Attempts settlement never saw, scheduled for resubmission.
    pub resubmitted: usize,
    /// Runs another live instance is driving.
    pub skipped_runs: Vec<RunId>,
    pub summaries: Vec<RunSummary>,
}

/// Brings non-terminal runs left by a crash or timeout back to a
/// consistent state, then resumes them.
#[derive(Clone)]
pub struct Reconciler {
    ledger: LedgerRef,
    settlement: SettlementRef,
    leases: LeaseManager,
    executor: DisbursementExecutor,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        ledger: LedgerRef,
        settlement: SettlementRef,
        leases: LeaseManager,
        executor: DisbursementExecutor,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            settlement,
            leases,
            executor,
            call_timeout,
        }
    }

    /// Reconciles every non-terminal run in the ledger.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for run in self.ledger.non_terminal_runs().await? {
            match self.reconcile_into(run.run_id, &mut report).await {
                Ok(()) => {}
                Err(PayrollError::ConcurrentRunConflict(reason)) => {
                    warn!(run_id = %run.run_id, %reason, "run skipped");
                    report.skipped_runs.push(run.run_id);
                }
                Err(err) => return Err(err),
            }
        }
        if report.examined > 0 || !report.summaries.is_empty() {
            info!(
                examined = report.examined,
                resolved = report.resolved,
                held = report.held,
                resubmitted = report.resubmitted,
                runs = report.summaries.len(),
                "reconciliation finished"
            );
        }
        Ok(report)
    }

    pub async fn reconcile_run(&self, run_id: RunId) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.reconcile_into(run_id, &mut report).await?;
        Ok(report)
    }

    async fn reconcile_into(&self, run_id: RunId, report: &mut ReconcileReport) -> Result<()> {
        let run = self
            .ledger
            .run(run_id)
            .await?
            .ok_or(PayrollError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            report
                .summaries
                .push(RunSummary::load(self.ledger.as_ref(), run_id).await?);
            return Ok(());
        }

        self.leases.claim_for_run(run_id).await?;
        if let Err(err) = self.resolve_in_doubt(run_id, report).await {
            if let Err(release_err) = self.leases.release(run_id).await {
                warn!(%run_id, err = %release_err, "could not release lease; it will expire");
            }
            return Err(err);
        }

        report.summaries.push(self.executor.drive(run_id).await?);
        Ok(())
    }

    async fn resolve_in_doubt(&self, run_id: RunId, report: &mut ReconcileReport) -> Result<()> {
        for attempt in self.ledger.attempts(run_id).await? {
            if attempt.is_in_doubt() {
                report.examined += 1;
                self.resolve(attempt, report).await?;
            }
        }
        Ok(())
    }

    /// Asks settlement what became of an in-doubt attempt and records the
    /// answer. Never submits.
    async fn resolve(&self, mut attempt: PaymentAttempt, report: &mut ReconcileReport) -> Result<()> {
        let key = attempt.key();
        let answer = tokio::time::timeout(self.call_timeout, self.settlement.query_status(&key)).await;

        match answer {
            Ok(Ok(SettlementStatus::Confirmed { settlement_ref })) => {
                info!(%key, %settlement_ref, "in-doubt payment found settled");
                attempt.confirm(settlement_ref)?;
                report.resolved += 1;
            }
            Ok(Ok(SettlementStatus::Failed { reason })) => {
                warn!(%key, %reason, "in-doubt payment found rejected");
                attempt.last_error = Some(reason.clone());
                attempt.fail(FailureCause::Rejected(reason))?;
                report.resolved += 1;
            }
            Ok(Ok(SettlementStatus::NotFound)) => {
                info!(%key, "payment never reached settlement, resubmitting");
                attempt.schedule_retry(Utc::now(), "not found at settlement")?;
                report.resubmitted += 1;
            }
            Ok(Ok(SettlementStatus::Unknown)) => {
                report.held += 1;
                return self.hold(attempt, "settlement outcome still unknown").await;
            }
            Ok(Err(err)) => {
                report.held += 1;
                return self.hold(attempt, &err.to_string()).await;
            }
            Err(_) => {
                report.held += 1;
                return self
                    .hold(attempt, &format!("status query timed out after {:?}", self.call_timeout))
                    .await;
            }
        }

        self.leases
            .append(LedgerEvent::AttemptRecorded { attempt })
            .await?;
        Ok(())
    }

    /// Leaves the attempt in doubt, recording `Unknown` the first time.
    async fn hold(&self, mut attempt: PaymentAttempt, reason: &str) -> Result<()> {
        warn!(key = %attempt.key(), reason, "payment still in doubt");
        if attempt.status == AttemptStatus::Unknown {
            return Ok(());
        }
        attempt.mark_unknown(reason)?;
        self.leases
            .append(LedgerEvent::AttemptRecorded { attempt })
            .await?;
        Ok(())
    }
}
