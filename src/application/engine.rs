use super::executor::DisbursementExecutor;
use super::lease::LeaseManager;
use super::planner::{FundingPreview, RunPlanner};
use super::reconciler::{ReconcileReport, Reconciler};
use super::summary::RunSummary;
use crate::config::EngineConfig;
use crate::domain::ledger::LedgerEvent;
use crate::domain::ports::{BalanceOracleRef, LedgerRef, PayeeRegistryRef, SettlementRef};
use crate::domain::run::{PayrollRun, RunId};
use crate::error::{PayrollError, Result};
use chrono::NaiveDate;
use tracing::info;

/// The main entry point for payroll processing.
///
/// `PayrollEngine` wires the planner, executor and reconciler to one set of
/// ports. Cloning is cheap; every clone shares the same ledger and lease
/// identity.
#[derive(Clone)]
pub struct PayrollEngine {
    registry: PayeeRegistryRef,
    ledger: LedgerRef,
    planner: RunPlanner,
    executor: DisbursementExecutor,
    reconciler: Reconciler,
}

impl PayrollEngine {
    /// Creates a new `PayrollEngine` instance.
    ///
    /// # Arguments
    ///
    /// * `registry` - Source of payees and their schedules.
    /// * `ledger` - Durable record of runs and attempts; also holds the run lease.
    /// * `oracle` - Treasury balance source consulted before a run is committed.
    /// * `settlement` - The payment network attempts are submitted to.
    /// * `config` - Retry, concurrency, timeout and lease settings.
    pub fn new(
        registry: PayeeRegistryRef,
        ledger: LedgerRef,
        oracle: BalanceOracleRef,
        settlement: SettlementRef,
        config: EngineConfig,
    ) -> Self {
        let leases = LeaseManager::new(
            ledger.clone(),
            config.owner_id.clone(),
            config.lease_ttl_chrono(),
        );
        let planner = RunPlanner::new(
            registry.clone(),
            oracle,
            ledger.clone(),
            leases.clone(),
            config.calendar,
            config.call_timeout,
        );
        let executor = DisbursementExecutor::new(
            ledger.clone(),
            settlement.clone(),
            leases.clone(),
            config.retry,
            config.workers,
            config.call_timeout,
        );
        let reconciler = Reconciler::new(
            ledger.clone(),
            settlement,
            leases,
            executor.clone(),
            config.call_timeout,
        );
        Self {
            registry,
            ledger,
            planner,
            executor,
            reconciler,
        }
    }

    pub fn registry(&self) -> &PayeeRegistryRef {
        &self.registry
    }

    pub fn ledger(&self) -> &LedgerRef {
        &self.ledger
    }

    /// Due payees, required total and current balance for `pay_date`,
    /// without committing anything.
    pub async fn preview(&self, pay_date: NaiveDate) -> Result<FundingPreview> {
        self.planner.preview(pay_date).await
    }

    pub async fn plan(&self, pay_date: NaiveDate) -> Result<PayrollRun> {
        self.planner.plan(pay_date).await
    }

    pub async fn execute(&self, run_id: RunId) -> Result<RunSummary> {
        self.executor.drive(run_id).await
    }

    /// Plans the run for `pay_date` and drives it to completion.
    pub async fn run_payroll(&self, pay_date: NaiveDate) -> Result<RunSummary> {
        let run = self.plan(pay_date).await?;
        self.execute(run.run_id).await
    }

    /// Requests cooperative cancellation. Payments already confirmed stand;
    /// nothing new is submitted once the executor observes the request.
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        let run = self
            .ledger
            .run(run_id)
            .await?
            .ok_or(PayrollError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(PayrollError::RunNotActive(run_id));
        }
        if run.cancel_requested {
            return Ok(());
        }
        self.ledger
            .append(LedgerEvent::CancelRequested { run_id })
            .await?;
        info!(%run_id, "cancellation requested");
        Ok(())
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.reconcile().await
    }

    pub async fn reconcile_run(&self, run_id: RunId) -> Result<ReconcileReport> {
        self.reconciler.reconcile_run(run_id).await
    }

    pub async fn summary(&self, run_id: RunId) -> Result<RunSummary> {
        RunSummary::load(self.ledger.as_ref(), run_id).await
    }

    /// Every run ever committed, oldest first.
    pub async fn history(&self) -> Result<Vec<PayrollRun>> {
        self.ledger.runs().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::domain::money::{Amount, Balance};
    use crate::domain::payee::{Payee, ScheduleKind};
    use crate::domain::ports::PayeeRegistry;
    use crate::domain::run::RunStatus;
    use crate::infrastructure::in_memory::{InMemoryLedger, InMemoryRegistry};
    use crate::infrastructure::sandbox::{FixedBalanceOracle, SandboxSettlement};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    async fn engine(balance: Balance) -> (PayrollEngine, SandboxSettlement) {
        let registry = InMemoryRegistry::new();
        let sandbox = SandboxSettlement::new();
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(5),
                backoff_max: Duration::from_millis(20),
            },
            call_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        };
        let engine = PayrollEngine::new(
            Arc::new(registry),
            Arc::new(InMemoryLedger::new()),
            Arc::new(FixedBalanceOracle::new(balance)),
            Arc::new(sandbox.clone()),
            config,
        );
        for (id, amount) in [("A", dec!(5000)), ("B", dec!(4500)), ("C", dec!(5500))] {
            engine
                .registry()
                .upsert(
                    Payee::new(
                        id,
                        format!("wallet-{id}"),
                        Amount::new(amount).unwrap(),
                        ScheduleKind::Monthly,
                    )
                    .unwrap(),
                )
                .await
                .unwrap();
        }
        (engine, sandbox)
    }

    fn pay_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 11, 15).unwrap()
    }

    #[tokio::test]
    async fn test_run_payroll_completes_and_appears_in_history() {
        let (engine, sandbox) = engine(Balance::new(dec!(20000))).await;

        let summary = engine.run_payroll(pay_date()).await.unwrap();

        assert_eq!(summary.run.status, RunStatus::Completed);
        assert_eq!(sandbox.settled_total().await, Balance::new(dec!(15000)));
        let history = engine.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, summary.run.run_id);
    }

    #[tokio::test]
    async fn test_same_date_is_not_paid_twice() {
        let (engine, sandbox) = engine(Balance::new(dec!(50000))).await;

        engine.run_payroll(pay_date()).await.unwrap();
        assert!(matches!(
            engine.run_payroll(pay_date()).await,
            Err(PayrollError::ConcurrentRunConflict(_))
        ));
        assert_eq!(sandbox.total_submits().await, 3);
    }

    #[tokio::test]
    async fn test_cancel_after_plan() {
        let (engine, sandbox) = engine(Balance::new(dec!(20000))).await;
        let run = engine.plan(pay_date()).await.unwrap();

        engine.cancel(run.run_id).await.unwrap();
        engine.cancel(run.run_id).await.unwrap();
        let summary = engine.execute(run.run_id).await.unwrap();

        assert_eq!(summary.run.status, RunStatus::Cancelled);
        assert_eq!(sandbox.total_submits().await, 0);
        assert!(matches!(
            engine.cancel(run.run_id).await,
            Err(PayrollError::RunNotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_date_can_be_planned_again() {
        let (engine, _) = engine(Balance::new(dec!(20000))).await;
        let first = engine.plan(pay_date()).await.unwrap();
        engine.cancel(first.run_id).await.unwrap();
        engine.execute(first.run_id).await.unwrap();

        let second = engine.run_payroll(pay_date()).await.unwrap();
        assert_ne!(second.run.run_id, first.run_id);
        assert_eq!(second.run.status, RunStatus::Completed);
    }
}
