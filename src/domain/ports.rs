use super::attempt::{IdempotencyKey, PaymentAttempt};
use super::ledger::{LedgerEntry, LedgerEvent};
use super::lease::RunLease;
use super::money::{Amount, Balance};
use super::payee::{Payee, PayeeId};
use super::run::{PayrollRun, PlanKey, RunId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

#[async_trait]
pub trait PayeeRegistry: Send + Sync {
    async fn upsert(&self, payee: Payee) -> Result<()>;
    async fn get(&self, id: &PayeeId) -> Result<Option<Payee>>;
    async fn all(&self) -> Result<Vec<Payee>>;
    /// Returns `false` when no such payee exists.
    async fn deactivate(&self, id: &PayeeId) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceReading {
    pub amount: Balance,
    pub as_of: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("balance temporarily unavailable: {0}")]
    TransientUnavailable(String),
}

#[async_trait]
pub trait BalanceOracle: Send + Sync {
    async fn balance(&self) -> std::result::Result<BalanceReading, OracleError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    pub destination_ref: String,
    pub amount: Amount,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub settlement_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementStatus {
    Confirmed { settlement_ref: String },
    Failed { reason: String },
    /// Settlement knows the key but cannot tell the outcome yet.
    Unknown,
    /// Settlement has never seen the key.
    NotFound,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transient: {0}")]
    Transient(String),
}

/// The external settlement network.
///
/// Implementations must treat `idempotency_key` as the identity of a
/// payment: submitting the same key twice settles at most once.
#[async_trait]
pub trait Settlement: Send + Sync {
    async fn submit(
        &self,
        request: &SettlementRequest,
    ) -> std::result::Result<SettlementReceipt, SettlementError>;

    async fn query_status(
        &self,
        key: &IdempotencyKey,
    ) -> std::result::Result<SettlementStatus, SettlementError>;
}

/// Durable, append-only record of runs and attempt transitions.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Validates and durably appends one transition.
    async fn append(&self, event: LedgerEvent) -> Result<LedgerEntry>;
    /// Like [`Ledger::append`], but only while `owner` holds the lease for
    /// the event's run, checked atomically with the write.
    async fn append_as(&self, event: LedgerEvent, owner: &str) -> Result<LedgerEntry>;
    async fn entries(&self, run_id: RunId) -> Result<Vec<LedgerEntry>>;
    async fn run(&self, run_id: RunId) -> Result<Option<PayrollRun>>;
    async fn run_by_plan_key(&self, key: &PlanKey) -> Result<Option<PayrollRun>>;
    async fn runs(&self) -> Result<Vec<PayrollRun>>;
    async fn attempts(&self, run_id: RunId) -> Result<Vec<PaymentAttempt>>;
    async fn attempt_by_key(&self, key: &IdempotencyKey) -> Result<Option<PaymentAttempt>>;
    async fn non_terminal_runs(&self) -> Result<Vec<PayrollRun>>;
    async fn non_terminal_attempts(&self) -> Result<Vec<PaymentAttempt>>;
    async fn lease(&self) -> Result<Option<RunLease>>;
    /// Replaces the lease with `next` only if the stored lease equals
    /// `expected`. Returns whether the swap happened.
    async fn compare_and_set_lease(
        &self,
        expected: Option<&RunLease>,
        next: Option<RunLease>,
    ) -> Result<bool>;
}

pub type PayeeRegistryRef = Arc<dyn PayeeRegistry>;
pub type BalanceOracleRef = Arc<dyn BalanceOracle>;
pub type SettlementRef = Arc<dyn Settlement>;
pub type LedgerRef = Arc<dyn Ledger>;
