use crate::domain::attempt::{IdempotencyKey, PaymentAttempt};
use crate::domain::lease::RunLease;
use crate::domain::ledger::{LedgerEntry, LedgerEvent, LedgerProjection};
use crate::domain::payee::{Payee, PayeeId};
use crate::domain::ports::{Ledger, PayeeRegistry};
use crate::domain::run::{PayrollRun, PlanKey, RunId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory payee registry.
///
/// Uses `Arc<RwLock<BTreeMap<PayeeId, Payee>>>` so listings come back in a
/// stable order. Ideal for tests and one-shot CLI runs.
#[derive(Default, Clone)]
pub struct InMemoryRegistry {
    payees: Arc<RwLock<BTreeMap<PayeeId, Payee>>>,
}

impl InMemoryRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayeeRegistry for InMemoryRegistry {
    async fn upsert(&self, payee: Payee) -> Result<()> {
        payee.validate()?;
        let mut payees = self.payees.write().await;
        payees.insert(payee.id.clone(), payee);
        Ok(())
    }

    async fn get(&self, id: &PayeeId) -> Result<Option<Payee>> {
        let payees = self.payees.read().await;
        Ok(payees.get(id).cloned())
    }

    async fn all(&self) -> Result<Vec<Payee>> {
        let payees = self.payees.read().await;
        Ok(payees.values().cloned().collect())
    }

    async fn deactivate(&self, id: &PayeeId) -> Result<bool> {
        let mut payees = self.payees.write().await;
        match payees.get_mut(id) {
            Some(payee) => {
                payee.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    projection: LedgerProjection,
    lease: Option<RunLease>,
}

impl LedgerState {
    fn push(&mut self, event: LedgerEvent) -> Result<LedgerEntry> {
        self.projection.validate(&event)?;
        let entry = LedgerEntry {
            seq: self.entries.len() as u64 + 1,
            recorded_at: Utc::now(),
            event,
        };
        self.projection.apply(&entry.event);
        self.entries.push(entry.clone());
        Ok(entry)
    }
}

/// A thread-safe in-memory ledger.
///
/// Entries and the lease live behind a single `RwLock`, so validation and
/// append (or lease compare-and-set) happen atomically with respect to
/// every other writer sharing the same clone.
#[derive(Default, Clone)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedger {
    /// Creates a new, empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry ever appended, in sequence order.
    pub async fn all_entries(&self) -> Vec<LedgerEntry> {
        self.state.read().await.entries.clone()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn append(&self, event: LedgerEvent) -> Result<LedgerEntry> {
        let mut state = self.state.write().await;
        state.push(event)
    }

    async fn append_as(&self, event: LedgerEvent, owner: &str) -> Result<LedgerEntry> {
        let mut state = self.state.write().await;
        RunLease::check_fence(state.lease.as_ref(), event.run_id(), owner)?;
        state.push(event)
    }

    async fn entries(&self, run_id: RunId) -> Result<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.event.run_id() == run_id)
            .cloned()
            .collect())
    }

    async fn run(&self, run_id: RunId) -> Result<Option<PayrollRun>> {
        let state = self.state.read().await;
        Ok(state.projection.run(run_id).cloned())
    }

    async fn run_by_plan_key(&self, key: &PlanKey) -> Result<Option<PayrollRun>> {
        let state = self.state.read().await;
        Ok(state.projection.run_by_plan_key(key).cloned())
    }

    async fn runs(&self) -> Result<Vec<PayrollRun>> {
        let state = self.state.read().await;
        Ok(state.projection.runs())
    }

    async fn attempts(&self, run_id: RunId) -> Result<Vec<PaymentAttempt>> {
        let state = self.state.read().await;
        Ok(state.projection.attempts(run_id))
    }

    async fn attempt_by_key(&self, key: &IdempotencyKey) -> Result<Option<PaymentAttempt>> {
        let state = self.state.read().await;
        Ok(state.projection.attempt(key).cloned())
    }

    async fn non_terminal_runs(&self) -> Result<Vec<PayrollRun>> {
        let state = self.state.read().await;
        Ok(state.projection.non_terminal_runs())
    }

    async fn non_terminal_attempts(&self) -> Result<Vec<PaymentAttempt>> {
        let state = self.state.read().await;
        Ok(state.projection.non_terminal_attempts())
    }

    async fn lease(&self) -> Result<Option<RunLease>> {
        let state = self.state.read().await;
        Ok(state.lease.clone())
    }

    async fn compare_and_set_lease(
        &self,
        expected: Option<&RunLease>,
        next: Option<RunLease>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.lease.as_ref() != expected {
            return Ok(false);
        }
        state.lease = next;
        Ok(true)
    }
}
