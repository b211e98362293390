use super::lease::LeaseManager;
use crate::domain::ledger::LedgerEvent;
use crate::domain::money::Balance;
use crate::domain::payee::{PayCalendar, Payee};
use crate::domain::ports::{BalanceOracleRef, BalanceReading, LedgerRef, PayeeRegistryRef};
use crate::domain::run::{PayrollRun, PlanKey, RunStatus};
use crate::error::{PayrollError, Result};
use chrono::{NaiveDate, Utc};
use std::time::Duration;
use tracing::{info, warn};

/// What a run for `pay_date` would need, computed without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingPreview {
    pub pay_date: NaiveDate,
    pub due: Vec<Payee>,
    pub total_required: Balance,
    pub balance: BalanceReading,
}

impl FundingPreview {
    pub fn is_sufficient(&self) -> bool {
        self.balance.amount >= self.total_required
    }

    pub fn shortfall(&self) -> Balance {
        if self.is_sufficient() {
            Balance::ZERO
        } else {
            self.total_required.saturating_sub(self.balance.amount)
        }
    }
}

/// Selects due payees, verifies the treasury covers them and commits a run.
#[derive(Clone)]
pub struct RunPlanner {
    registry: PayeeRegistryRef,
    oracle: BalanceOracleRef,
    ledger: LedgerRef,
    leases: LeaseManager,
    calendar: PayCalendar,
    call_timeout: Duration,
}

impl RunPlanner {
    pub fn new(
        registry: PayeeRegistryRef,
        oracle: BalanceOracleRef,
        ledger: LedgerRef,
        leases: LeaseManager,
        calendar: PayCalendar,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            oracle,
            ledger,
            leases,
            calendar,
            call_timeout,
        }
    }

    pub async fn due_payees(&self, pay_date: NaiveDate) -> Result<Vec<Payee>> {
        Ok(self
            .registry
            .all()
            .await?
            .into_iter()
            .filter(|p| p.is_due(&self.calendar, pay_date))
            .collect())
    }

    async fn read_balance(&self) -> Result<BalanceReading> {
        match tokio::time::timeout(self.call_timeout, self.oracle.balance()).await {
            Ok(Ok(reading)) => Ok(reading),
            Ok(Err(err)) => Err(PayrollError::BalanceUnavailable(err.to_string())),
            Err(_) => Err(PayrollError::BalanceUnavailable(format!(
                "no answer within {:?}",
                self.call_timeout
            ))),
        }
    }

    pub async fn preview(&self, pay_date: NaiveDate) -> Result<FundingPreview> {
        let due = self.due_payees(pay_date).await?;
        let total_required = Balance::checked_sum(due.iter().map(|p| p.amount))?;
        let balance = self.read_balance().await?;
        Ok(FundingPreview {
            pay_date,
            due,
            total_required,
            balance,
        })
    }

    /// Rejects planning while another run is open or this due set was
    /// already planned for the date.
    async fn ensure_no_conflict(&self, plan_key: &PlanKey) -> Result<()> {
        if let Some(existing) = self.ledger.run_by_plan_key(plan_key).await?
            && existing.status != RunStatus::Cancelled
        {
            return Err(PayrollError::ConcurrentRunConflict(format!(
                "run {} already covers this pay date and due set",
                existing.run_id
            )));
        }
        if let Some(open) = self.ledger.non_terminal_runs().await?.first() {
            return Err(PayrollError::ConcurrentRunConflict(format!(
                "run {} is still {}",
                open.run_id, open.status
            )));
        }
        Ok(())
    }

    /// Commits a new Active run for the payees due on `pay_date`.
    ///
    /// Fails with `InsufficientFunds` before anything is written when the
    /// treasury cannot cover the whole due set.
    pub async fn plan(&self, pay_date: NaiveDate) -> Result<PayrollRun> {
        let due = self.due_payees(pay_date).await?;
        if due.is_empty() {
            return Err(PayrollError::NothingDue(pay_date));
        }
        let plan_key = PlanKey::derive(pay_date, &due);
        self.ensure_no_conflict(&plan_key).await?;

        let balance = self.read_balance().await?;
        let mut run = PayrollRun::plan(pay_date, due, balance.amount, Utc::now())?;
        if balance.amount < run.total_required {
            warn!(
                %pay_date,
                required = %run.total_required,
                available = %balance.amount,
                "insufficient funds, run not created"
            );
            return Err(PayrollError::InsufficientFunds {
                required: run.total_required,
                available: balance.amount,
            });
        }

        self.leases.acquire_for_new_run(run.run_id).await?;
        if let Err(err) = self.commit(&run).await {
            self.leases.release(run.run_id).await?;
            return Err(err);
        }
        run.status = RunStatus::Active;

        info!(
            run_id = %run.run_id,
            %pay_date,
            payees = run.payee_snapshot.len(),
            total_required = %run.total_required,
            "payroll run committed"
        );
        Ok(run)
    }

    async fn commit(&self, run: &PayrollRun) -> Result<()> {
        self.leases
            .append(LedgerEvent::RunPlanned { run: run.clone() })
            .await?;
        self.leases
            .append(LedgerEvent::RunStatusChanged {
                run_id: run.run_id,
                from: RunStatus::Planned,
                to: RunStatus::Active,
            })
            .await?;
        Ok(())
    }
}
