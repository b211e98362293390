use crate::domain::lease::RunLease;
use crate::domain::ledger::{LedgerEntry, LedgerEvent};
use crate::domain::ports::LedgerRef;
use crate::domain::run::RunId;
use crate::error::{PayrollError, Result};
use chrono::Utc;
use tracing::debug;

/// Acquires, renews and releases the ledger's current-run lease on behalf
/// of one engine instance.
#[derive(Clone)]
pub struct LeaseManager {
    ledger: LedgerRef,
    owner: String,
    ttl: chrono::Duration,
}

impl LeaseManager {
    pub fn new(ledger: LedgerRef, owner: impl Into<String>, ttl: chrono::Duration) -> Self {
        Self {
            ledger,
            owner: owner.into(),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether `lease` still blocks others: its run is open, or it was taken
    /// for a run whose plan has not been committed yet and has not expired.
    async fn is_live(&self, lease: &RunLease) -> Result<bool> {
        Ok(match self.ledger.run(lease.run_id).await? {
            Some(run) => !run.status.is_terminal(),
            None => !lease.is_expired(Utc::now()),
        })
    }

    /// Takes the slot for a run that is about to be committed.
    pub async fn acquire_for_new_run(&self, run_id: RunId) -> Result<RunLease> {
        let current = self.ledger.lease().await?;
        if let Some(lease) = &current
            && self.is_live(lease).await?
        {
            return Err(PayrollError::ConcurrentRunConflict(format!(
                "run {} holds the current-run lease",
                lease.run_id
            )));
        }
        self.swap(current, run_id).await
    }

    /// Claims or renews the slot for driving an existing run.
    pub async fn claim_for_run(&self, run_id: RunId) -> Result<RunLease> {
        let current = self.ledger.lease().await?;
        if let Some(lease) = &current {
            if lease.run_id == run_id {
                if !lease.is_held_by(&self.owner) && !lease.is_expired(Utc::now()) {
                    return Err(PayrollError::ConcurrentRunConflict(format!(
                        "run {run_id} is being driven by {}",
                        lease.owner
                    )));
                }
            } else if self.is_live(lease).await? {
                return Err(PayrollError::ConcurrentRunConflict(format!(
                    "run {} holds the current-run lease",
                    lease.run_id
                )));
            }
        }
        self.swap(current, run_id).await
    }

    async fn swap(&self, current: Option<RunLease>, run_id: RunId) -> Result<RunLease> {
        let next = RunLease::new(run_id, self.owner.clone(), Utc::now(), self.ttl);
        if !self
            .ledger
            .compare_and_set_lease(current.as_ref(), Some(next.clone()))
            .await?
        {
            return Err(PayrollError::ConcurrentRunConflict(format!(
                "lost the lease race for run {run_id}"
            )));
        }
        debug!(%run_id, owner = %self.owner, expires_at = %next.expires_at, "lease held");
        Ok(next)
    }

    /// Appends `event` only while this instance holds the lease for its run.
    pub async fn append(&self, event: LedgerEvent) -> Result<LedgerEntry> {
        self.ledger.append_as(event, &self.owner).await
    }

    /// Frees the slot if this instance still holds it for `run_id`.
    pub async fn release(&self, run_id: RunId) -> Result<()> {
        let current = self.ledger.lease().await?;
        if let Some(lease) = current
            .as_ref()
            .filter(|l| l.run_id == run_id && l.is_held_by(&self.owner))
        {
            self.ledger.compare_and_set_lease(Some(lease), None).await?;
            debug!(%run_id, owner = %self.owner, "lease released");
        }
        Ok(())
    }
}
