use super::run::RunId;
use crate::error::PayrollError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The single "current run" slot.
///
/// Whoever holds an unexpired lease is the only engine instance allowed to
/// drive `run_id`. The slot is only ever changed through the ledger's
/// compare-and-set, never through process-local state.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct RunLease {
    pub run_id: RunId,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn new(run_id: RunId, owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            run_id,
            owner: owner.into(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, owner: &str) -> bool {
        self.owner == owner
    }

    pub fn renewed(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self::new(self.run_id, self.owner.clone(), now, ttl)
    }

    /// Fails unless `lease` lets `owner` write transitions for `run_id`.
    ///
    /// An expired lease still counts until another owner replaces it.
    pub fn check_fence(
        lease: Option<&RunLease>,
        run_id: RunId,
        owner: &str,
    ) -> Result<(), PayrollError> {
        match lease {
            Some(lease) if lease.run_id == run_id && lease.is_held_by(owner) => Ok(()),
            Some(lease) => Err(PayrollError::ConcurrentRunConflict(format!(
                "{owner} no longer holds run {run_id}; lease is {} for run {}",
                lease.owner, lease.run_id
            ))),
            None => Err(PayrollError::ConcurrentRunConflict(format!(
                "{owner} no longer holds run {run_id}; lease was released"
            ))),
        }
    }
}
