use crate::domain::attempt::{IdempotencyKey, PaymentAttempt};
use crate::domain::lease::RunLease;
use crate::domain::ledger::{LedgerEntry, LedgerEvent, LedgerProjection};
use crate::domain::payee::{Payee, PayeeId};
use crate::domain::ports::{Ledger, PayeeRegistry};
use crate::domain::run::{PayrollRun, PlanKey, RunId};
use crate::error::{PayrollError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteOptions};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Column Family for payee records, keyed by payee id.
pub const CF_PAYEES: &str = "payees";
/// Column Family for ledger entries, keyed by big-endian sequence number.
pub const CF_ENTRIES: &str = "entries";
/// Column Family for singleton records such as the run lease.
pub const CF_META: &str = "meta";

const LEASE_KEY: &[u8] = b"lease";

struct LedgerState {
    projection: LedgerProjection,
    next_seq: u64,
}

/// A persistent store implementation using RocksDB.
///
/// Serves both the payee registry and the ledger from separate Column
/// Families. Ledger entries are written with `sync` enabled and are never
/// overwritten; the in-process projection is rebuilt by replaying them on
/// open, so the current state of every run survives a restart.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
/// Appends and lease swaps are serialized by one mutex, which is sufficient
/// because RocksDB only lets a single process open the database.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    state: Arc<Mutex<LedgerState>>,
}

fn missing_cf(name: &str) -> PayrollError {
    PayrollError::InternalError(Box::new(std::io::Error::other(format!(
        "{name} column family not found"
    ))))
}

fn synced() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path and replays
    /// the ledger.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_PAYEES, CF_ENTRIES, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let mut projection = LedgerProjection::new();
        let mut next_seq = 1;
        {
            let cf = db.cf_handle(CF_ENTRIES).ok_or_else(|| missing_cf(CF_ENTRIES))?;
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                let (_key, value) = item?;
                let entry: LedgerEntry = serde_json::from_slice(&value)?;
                projection.apply(&entry.event);
                next_seq = entry.seq + 1;
            }
        }
        debug!(replayed = next_seq - 1, "ledger replayed");

        Ok(Self {
            db: Arc::new(db),
            state: Arc::new(Mutex::new(LedgerState {
                projection,
                next_seq,
            })),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| missing_cf(name))
    }

    /// Validates and persists one entry. Callers hold the state mutex.
    fn write_entry(&self, state: &mut LedgerState, event: LedgerEvent) -> Result<LedgerEntry> {
        state.projection.validate(&event)?;

        let entry = LedgerEntry {
            seq: state.next_seq,
            recorded_at: Utc::now(),
            event,
        };
        let cf = self.cf(CF_ENTRIES)?;
        let value = serde_json::to_vec(&entry)?;
        self.db
            .put_cf_opt(cf, entry.seq.to_be_bytes(), value, &synced())?;

        state.projection.apply(&entry.event);
        state.next_seq += 1;
        Ok(entry)
    }

    fn read_lease(&self) -> Result<Option<RunLease>> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, LEASE_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PayeeRegistry for RocksDBStore {
    async fn upsert(&self, payee: Payee) -> Result<()> {
        payee.validate()?;
        let cf = self.cf(CF_PAYEES)?;
        let value = serde_json::to_vec(&payee)?;
        self.db.put_cf(cf, payee.id.0.as_bytes(), value)?;
        Ok(())
    }

    async fn get(&self, id: &PayeeId) -> Result<Option<Payee>> {
        let cf = self.cf(CF_PAYEES)?;
        match self.db.get_cf(cf, id.0.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn all(&self) -> Result<Vec<Payee>> {
        let cf = self.cf(CF_PAYEES)?;
        let mut payees = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            payees.push(serde_json::from_slice(&value)?);
        }
        Ok(payees)
    }

    async fn deactivate(&self, id: &PayeeId) -> Result<bool> {
        match PayeeRegistry::get(self, id).await? {
            Some(mut payee) => {
                payee.active = false;
                PayeeRegistry::upsert(self, payee).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Ledger for RocksDBStore {
    async fn append(&self, event: LedgerEvent) -> Result<LedgerEntry> {
        let mut state = self.state.lock().await;
        self.write_entry(&mut state, event)
    }

    async fn append_as(&self, event: LedgerEvent, owner: &str) -> Result<LedgerEntry> {
        let mut state = self.state.lock().await;
        RunLease::check_fence(self.read_lease()?.as_ref(), event.run_id(), owner)?;
        self.write_entry(&mut state, event)
    }

    async fn entries(&self, run_id: RunId) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let entry: LedgerEntry = serde_json::from_slice(&value)?;
            if entry.event.run_id() == run_id {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn run(&self, run_id: RunId) -> Result<Option<PayrollRun>> {
        let state = self.state.lock().await;
        Ok(state.projection.run(run_id).cloned())
    }

    async fn run_by_plan_key(&self, key: &PlanKey) -> Result<Option<PayrollRun>> {
        let state = self.state.lock().await;
        Ok(state.projection.run_by_plan_key(key).cloned())
    }

    async fn runs(&self) -> Result<Vec<PayrollRun>> {
        let state = self.state.lock().await;
        Ok(state.projection.runs())
    }

    async fn attempts(&self, run_id: RunId) -> Result<Vec<PaymentAttempt>> {
        let state = self.state.lock().await;
        Ok(state.projection.attempts(run_id))
    }

    async fn attempt_by_key(&self, key: &IdempotencyKey) -> Result<Option<PaymentAttempt>> {
        let state = self.state.lock().await;
        Ok(state.projection.attempt(key).cloned())
    }

    async fn non_terminal_runs(&self) -> Result<Vec<PayrollRun>> {
        let state = self.state.lock().await;
        Ok(state.projection.non_terminal_runs())
    }

    async fn non_terminal_attempts(&self) -> Result<Vec<PaymentAttempt>> {
        let state = self.state.lock().await;
        Ok(state.projection.non_terminal_attempts())
    }

    async fn lease(&self) -> Result<Option<RunLease>> {
        let _state = self.state.lock().await;
        self.read_lease()
    }

    async fn compare_and_set_lease(
        &self,
        expected: Option<&RunLease>,
        next: Option<RunLease>,
    ) -> Result<bool> {
        let _state = self.state.lock().await;
        if self.read_lease()?.as_ref() != expected {
            return Ok(false);
        }

        let cf = self.cf(CF_META)?;
        match next {
            Some(lease) => {
                let value = serde_json::to_vec(&lease)?;
                self.db.put_cf_opt(cf, LEASE_KEY, value, &synced())?;
            }
            None => self.db.delete_cf_opt(cf, LEASE_KEY, &synced())?,
        }
        Ok(true)
    }
}
