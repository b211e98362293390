use super::lease::LeaseManager;
use super::summary::RunSummary;
use crate::config::RetryPolicy;
use crate::domain::attempt::{AttemptStatus, FailureCause, PaymentAttempt};
use crate::domain::ledger::LedgerEvent;
use crate::domain::money::Balance;
use crate::domain::ports::{LedgerRef, SettlementError, SettlementRef, SettlementRequest};
use crate::domain::run::{PayrollRun, RunId, RunStatus};
use crate::error::{PayrollError, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Drives the attempts of an Active run to terminal states.
///
/// Every state change is appended to the ledger before the next step, and
/// the `Submitted` write-ahead entry is recorded before settlement is called,
/// so a crash at any point leaves enough behind for the reconciler.
#[derive(Clone)]
pub struct DisbursementExecutor {
    ledger: LedgerRef,
    settlement: SettlementRef,
    leases: LeaseManager,
    retry: RetryPolicy,
    workers: usize,
    call_timeout: Duration,
}

impl DisbursementExecutor {
    pub fn new(
        ledger: LedgerRef,
        settlement: SettlementRef,
        leases: LeaseManager,
        retry: RetryPolicy,
        workers: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            settlement,
            leases,
            retry,
            workers: workers.max(1),
            call_timeout,
        }
    }

    /// Submits every due attempt of `run_id` until none is left to submit,
    /// then closes the run if all attempts are terminal.
    ///
    /// Attempts left in doubt (a timed-out call) stay open for the
    /// reconciler; the run is then returned still Active.
    pub async fn drive(&self, run_id: RunId) -> Result<RunSummary> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(%run_id, status = %run.status, "run already closed");
            return RunSummary::load(self.ledger.as_ref(), run_id).await;
        }

        self.leases.claim_for_run(run_id).await?;
        if run.status == RunStatus::Planned {
            self.set_status(run_id, RunStatus::Planned, RunStatus::Active)
                .await?;
        }

        if let Err(err) = self.run_rounds(run_id).await {
            self.release_after_error(run_id).await;
            return Err(err);
        }
        self.finalize(run_id).await
    }

    /// Submits due attempts round by round until nothing is left to submit
    /// or cancellation is observed.
    async fn run_rounds(&self, run_id: RunId) -> Result<()> {
        loop {
            self.leases.claim_for_run(run_id).await?;
            let run = self.load_run(run_id).await?;
            let attempts = self.ledger.attempts(run_id).await?;

            if run.cancel_requested {
                self.cancel_unsubmitted(&attempts).await?;
                break;
            }

            let now = Utc::now();
            let due: Vec<PaymentAttempt> =
                attempts.iter().filter(|a| a.is_due(now)).cloned().collect();
            if due.is_empty() {
                match next_retry_at(&attempts) {
                    Some(at) => {
                        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                        debug!(%run_id, ?wait, "waiting for scheduled retries");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    None => break,
                }
            }

            let admitted = self.apply_budget(&run, &attempts, due).await?;
            let results: Vec<Result<()>> = stream::iter(admitted)
                .map(|attempt| self.process(attempt))
                .buffer_unordered(self.workers)
                .collect()
                .await;
            for result in results {
                result?;
            }
        }

        Ok(())
    }

    /// Gives the lease back after a failed round so another instance need
    /// not wait for it to expire.
    async fn release_after_error(&self, run_id: RunId) {
        if let Err(err) = self.leases.release(run_id).await {
            warn!(%run_id, %err, "could not release lease; it will expire");
        }
    }

    async fn load_run(&self, run_id: RunId) -> Result<PayrollRun> {
        self.ledger
            .run(run_id)
            .await?
            .ok_or(PayrollError::RunNotFound(run_id))
    }

    async fn set_status(&self, run_id: RunId, from: RunStatus, to: RunStatus) -> Result<()> {
        self.leases
            .append(LedgerEvent::RunStatusChanged { run_id, from, to })
            .await?;
        Ok(())
    }

    async fn record(&self, attempt: PaymentAttempt) -> Result<()> {
        self.leases
            .append(LedgerEvent::AttemptRecorded { attempt })
            .await?;
        Ok(())
    }

    /// Fails everything not yet handed to settlement. In-doubt attempts are
    /// left for the reconciler.
    async fn cancel_unsubmitted(&self, attempts: &[PaymentAttempt]) -> Result<()> {
        for attempt in attempts {
            if attempt.status == AttemptStatus::Pending || attempt.is_retry_scheduled() {
                let mut attempt = attempt.clone();
                attempt.fail(FailureCause::Cancelled)?;
                debug!(key = %attempt.key(), "attempt cancelled");
                self.record(attempt).await?;
            }
        }
        Ok(())
    }

    /// Keeps confirmed plus possibly-confirmed amounts within the run total,
    /// failing any due attempt that would overshoot it.
    async fn apply_budget(
        &self,
        run: &PayrollRun,
        attempts: &[PaymentAttempt],
        due: Vec<PaymentAttempt>,
    ) -> Result<Vec<PaymentAttempt>> {
        let committed: Balance = attempts
            .iter()
            .filter(|a| matches!(a.status, AttemptStatus::Confirmed { .. }) || a.is_in_doubt())
            .map(|a| a.amount)
            .sum();
        let mut remaining = run.total_required - committed;

        let mut admitted = Vec::with_capacity(due.len());
        for mut attempt in due {
            let amount = Balance::from(attempt.amount);
            if amount > remaining {
                warn!(
                    key = %attempt.key(),
                    %amount,
                    %remaining,
                    "attempt would exceed run total"
                );
                attempt.fail(FailureCause::BudgetExceeded)?;
                self.record(attempt).await?;
                continue;
            }
            remaining -= amount;
            admitted.push(attempt);
        }
        Ok(admitted)
    }

    /// Fails `attempt` as Cancelled instead of submitting it when the run
    /// was cancelled after the round was queued.
    async fn withdraw_if_cancelled(&self, attempt: &PaymentAttempt) -> Result<bool> {
        if !self.load_run(attempt.run_id).await?.cancel_requested {
            return Ok(false);
        }
        let mut attempt = attempt.clone();
        attempt.fail(FailureCause::Cancelled)?;
        debug!(key = %attempt.key(), "queued attempt cancelled before submission");
        self.record(attempt).await?;
        Ok(true)
    }

    async fn process(&self, queued: PaymentAttempt) -> Result<()> {
        if self.withdraw_if_cancelled(&queued).await? {
            return Ok(());
        }
        let mut attempt = queued.clone();
        attempt.begin_submission()?;
        if let Err(err) = self.record(attempt.clone()).await {
            // The ledger refuses the write-ahead once a cancel has landed.
            if self.withdraw_if_cancelled(&queued).await? {
                return Ok(());
            }
            return Err(err);
        }

        let request = SettlementRequest {
            destination_ref: attempt.destination_ref.clone(),
            amount: attempt.amount,
            idempotency_key: attempt.key(),
        };
        let outcome = tokio::time::timeout(self.call_timeout, self.settlement.submit(&request)).await;

        match outcome {
            Ok(Ok(receipt)) => {
                info!(
                    key = %request.idempotency_key,
                    amount = %attempt.amount,
                    settlement_ref = %receipt.settlement_ref,
                    "payment confirmed"
                );
                attempt.confirm(receipt.settlement_ref)?;
            }
            Ok(Err(SettlementError::Rejected(reason))) => {
                warn!(key = %request.idempotency_key, %reason, "payment rejected");
                attempt.last_error = Some(reason.clone());
                attempt.fail(FailureCause::Rejected(reason))?;
            }
            Ok(Err(SettlementError::Transient(message))) => {
                if self.retry.allows_retry(attempt.attempt_count) {
                    let delay = self.retry.backoff(attempt.attempt_count);
                    warn!(
                        key = %request.idempotency_key,
                        attempt = attempt.attempt_count,
                        ?delay,
                        %message,
                        "transient settlement error, retry scheduled"
                    );
                    attempt.schedule_retry(retry_at(delay), message)?;
                } else {
                    warn!(
                        key = %request.idempotency_key,
                        attempts = attempt.attempt_count,
                        %message,
                        "retries exhausted"
                    );
                    attempt.last_error = Some(message.clone());
                    attempt.fail(FailureCause::RetriesExhausted(message))?;
                }
            }
            Err(_) => {
                warn!(
                    key = %request.idempotency_key,
                    timeout = ?self.call_timeout,
                    "settlement did not answer, outcome unknown"
                );
                attempt.mark_unknown(format!(
                    "no answer within {:?}",
                    self.call_timeout
                ))?;
            }
        }

        self.record(attempt).await
    }

    async fn finalize(&self, run_id: RunId) -> Result<RunSummary> {
        let summary = RunSummary::load(self.ledger.as_ref(), run_id).await?;
        match RunStatus::settle(&summary.attempts, summary.run.cancel_requested) {
            Some(status) => {
                self.set_status(run_id, summary.run.status, status).await?;
                info!(
                    %run_id,
                    %status,
                    confirmed = %summary.total_confirmed(),
                    failed = summary.failures().len(),
                    "payroll run closed"
                );
            }
            None => {
                warn!(
                    %run_id,
                    in_doubt = summary.outstanding().len(),
                    "run left open with attempts in doubt; reconcile to resolve"
                );
            }
        }
        self.leases.release(run_id).await?;
        RunSummary::load(self.ledger.as_ref(), run_id).await
    }
}

fn next_retry_at(attempts: &[PaymentAttempt]) -> Option<DateTime<Utc>> {
    attempts
        .iter()
        .filter(|a| a.is_retry_scheduled())
        .filter_map(|a| a.next_attempt_at)
        .min()
}

fn retry_at(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::attempt::IdempotencyKey;
    use crate::domain::lease::RunLease;
    use crate::domain::ledger::LedgerEntry;
    use crate::domain::money::Amount;
    use crate::domain::payee::{Payee, ScheduleKind};
    use crate::domain::ports::Ledger;
    use crate::domain::run::PlanKey;
    use async_trait::async_trait;
    use crate::infrastructure::in_memory::InMemoryLedger;
    use crate::infrastructure::sandbox::{Fault, SandboxSettlement};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        }
    }

    async fn active_run(ledger: &InMemoryLedger) -> PayrollRun {
        let due = [("alice", dec!(5000)), ("bob", dec!(4500)), ("carol", dec!(5500))]
            .into_iter()
            .map(|(id, amount)| {
                Payee::new(
                    id,
                    format!("wallet-{id}"),
                    Amount::new(amount).unwrap(),
                    ScheduleKind::Monthly,
                )
                .unwrap()
            })
            .collect();
        let run = PayrollRun::plan(
            NaiveDate::from_ymd_opt(2024, 11, 15).unwrap(),
            due,
            Balance::new(dec!(20000)),
            Utc::now(),
        )
        .unwrap();
        ledger
            .append(LedgerEvent::RunPlanned { run: run.clone() })
            .await
            .unwrap();
        run
    }

    fn executor(ledger: &InMemoryLedger, sandbox: &SandboxSettlement) -> DisbursementExecutor {
        let ledger_ref: LedgerRef = Arc::new(ledger.clone());
        DisbursementExecutor::new(
            ledger_ref.clone(),
            Arc::new(sandbox.clone()),
            LeaseManager::new(ledger_ref, "executor-test", chrono::Duration::seconds(60)),
            retry(),
            2,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_drive_confirms_all_and_completes() {
        let ledger = InMemoryLedger::new();
        let sandbox = SandboxSettlement::new();
        let run = active_run(&ledger).await;

        let summary = executor(&ledger, &sandbox).drive(run.run_id).await.unwrap();

        assert_eq!(summary.run.status, RunStatus::Completed);
        assert_eq!(summary.total_confirmed(), Balance::new(dec!(15000)));
        assert_eq!(sandbox.total_submits().await, 3);
        assert!(ledger.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_with_same_key() {
        let ledger = InMemoryLedger::new();
        let sandbox = SandboxSettlement::new();
        sandbox.fail_transiently("wallet-bob", 2).await;
        let run = active_run(&ledger).await;

        let summary = executor(&ledger, &sandbox).drive(run.run_id).await.unwrap();

        let bob = summary.attempt(&"bob".into()).unwrap();
        assert_eq!(bob.attempt_count, 3);
        assert!(bob.settlement_ref().is_some());
        assert_eq!(sandbox.submit_count(&bob.key()).await, 3);
        assert_eq!(summary.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_end_partially_completed() {
        let ledger = InMemoryLedger::new();
        let sandbox = SandboxSettlement::new();
        sandbox.fail_transiently("wallet-bob", 5).await;
        let run = active_run(&ledger).await;

        let summary = executor(&ledger, &sandbox).drive(run.run_id).await.unwrap();

        assert_eq!(summary.run.status, RunStatus::PartiallyCompleted);
        let failures = summary.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].payee_id, "bob".into());
        assert!(matches!(failures[0].cause, FailureCause::RetriesExhausted(_)));
        assert_eq!(summary.total_confirmed(), Balance::new(dec!(10500)));
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let ledger = InMemoryLedger::new();
        let sandbox = SandboxSettlement::new();
        sandbox
            .push_fault("wallet-carol", Fault::Reject("invalid destination".to_string()))
            .await;
        let run = active_run(&ledger).await;

        let summary = executor(&ledger, &sandbox).drive(run.run_id).await.unwrap();

        let carol = summary.attempt(&"carol".into()).unwrap();
        assert_eq!(carol.attempt_count, 1);
        assert_eq!(
            carol.failure(),
            Some(&FailureCause::Rejected("invalid destination".to_string()))
        );
        assert_eq!(summary.run.status, RunStatus::PartiallyCompleted);
    }

    #[tokio::test]
    async fn test_timeout_leaves_attempt_in_doubt_and_run_open() {
        let ledger = InMemoryLedger::new();
        let sandbox = SandboxSettlement::new();
        sandbox
            .push_fault("wallet-alice", Fault::StallAfterAccept(Duration::from_secs(2)))
            .await;
        let run = active_run(&ledger).await;

        let summary = executor(&ledger, &sandbox).drive(run.run_id).await.unwrap();

        assert_eq!(summary.run.status, RunStatus::Active);
        let alice = summary.attempt(&"alice".into()).unwrap();
        assert_eq!(alice.status, AttemptStatus::Unknown);
        assert_eq!(summary.outstanding().len(), 1);
        assert_eq!(summary.confirmed().count(), 2);
    }

    #[tokio::test]
    async fn test_closed_run_is_not_resubmitted() {
        let ledger = InMemoryLedger::new();
        let sandbox = SandboxSettlement::new();
        let run = active_run(&ledger).await;
        let exec = executor(&ledger, &sandbox);

        exec.drive(run.run_id).await.unwrap();
        let again = exec.drive(run.run_id).await.unwrap();

        assert_eq!(again.run.status, RunStatus::Completed);
        assert_eq!(sandbox.total_submits().await, 3);
    }

    #[tokio::test]
    async fn test_cancel_before_drive_fails_pending_attempts() {
        let ledger = InMemoryLedger::new();
        let sandbox = SandboxSettlement::new();
        let run = active_run(&ledger).await;
        ledger
            .append(LedgerEvent::CancelRequested { run_id: run.run_id })
            .await
            .unwrap();

        let summary = executor(&ledger, &sandbox).drive(run.run_id).await.unwrap();

        assert_eq!(summary.run.status, RunStatus::Cancelled);
        assert!(
            summary
                .failures()
                .iter()
                .all(|f| f.cause == FailureCause::Cancelled)
        );
        assert_eq!(sandbox.total_submits().await, 0);
    }

    /// Delegates to an in-memory ledger but refuses to record confirmations.
    struct BrokenConfirmLedger(InMemoryLedger);

    #[async_trait]
    impl Ledger for BrokenConfirmLedger {
        async fn append(&self, event: LedgerEvent) -> Result<LedgerEntry> {
            self.0.append(event).await
        }

        async fn append_as(&self, event: LedgerEvent, owner: &str) -> Result<LedgerEntry> {
            if let LedgerEvent::AttemptRecorded { attempt } = &event
                && matches!(attempt.status, AttemptStatus::Confirmed { .. })
            {
                return Err(PayrollError::InternalError(Box::new(std::io::Error::other(
                    "disk full",
                ))));
            }
            self.0.append_as(event, owner).await
        }

        async fn entries(&self, run_id: RunId) -> Result<Vec<LedgerEntry>> {
            self.0.entries(run_id).await
        }

        async fn run(&self, run_id: RunId) -> Result<Option<PayrollRun>> {
            self.0.run(run_id).await
        }

        async fn run_by_plan_key(&self, key: &PlanKey) -> Result<Option<PayrollRun>> {
            self.0.run_by_plan_key(key).await
        }

        async fn runs(&self) -> Result<Vec<PayrollRun>> {
            self.0.runs().await
        }

        async fn attempts(&self, run_id: RunId) -> Result<Vec<PaymentAttempt>> {
            self.0.attempts(run_id).await
        }

        async fn attempt_by_key(&self, key: &IdempotencyKey) -> Result<Option<PaymentAttempt>> {
            self.0.attempt_by_key(key).await
        }

        async fn non_terminal_runs(&self) -> Result<Vec<PayrollRun>> {
            self.0.non_terminal_runs().await
        }

        async fn non_terminal_attempts(&self) -> Result<Vec<PaymentAttempt>> {
            self.0.non_terminal_attempts().await
        }

        async fn lease(&self) -> Result<Option<RunLease>> {
            self.0.lease().await
        }

        async fn compare_and_set_lease(
            &self,
            expected: Option<&RunLease>,
            next: Option<RunLease>,
        ) -> Result<bool> {
            self.0.compare_and_set_lease(expected, next).await
        }
    }

    #[tokio::test]
    async fn test_ledger_failure_releases_lease() {
        let ledger = InMemoryLedger::new();
        let sandbox = SandboxSettlement::new();
        let run = active_run(&ledger).await;
        let broken: LedgerRef = Arc::new(BrokenConfirmLedger(ledger.clone()));
        let exec = DisbursementExecutor::new(
            broken.clone(),
            Arc::new(sandbox.clone()),
            LeaseManager::new(broken, "executor-test", chrono::Duration::seconds(60)),
            retry(),
            2,
            Duration::from_millis(200),
        );

        assert!(matches!(
            exec.drive(run.run_id).await,
            Err(PayrollError::InternalError(_))
        ));
        assert!(ledger.lease().await.unwrap().is_none());
        let in_doubt = ledger.attempts(run.run_id).await.unwrap();
        assert!(in_doubt.iter().all(|a| a.is_in_doubt()));
    }
}
