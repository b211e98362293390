use crate::domain::money::Balance;
use crate::domain::run::RunId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayrollError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Balance, available: Balance },
    #[error("Concurrent run conflict: {0}")]
    ConcurrentRunConflict(String),
    #[error("No active payees are due on {0}")]
    NothingDue(chrono::NaiveDate),
    #[error("Balance oracle unavailable: {0}")]
    BalanceUnavailable(String),
    #[error("Run {0} not found")]
    RunNotFound(RunId),
    #[error("Run {0} is already terminal")]
    RunNotActive(RunId),
    #[error("Illegal transition: {0}")]
    IllegalTransition(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    StorageError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl From<serde_json::Error> for PayrollError {
    fn from(err: serde_json::Error) -> Self {
        PayrollError::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, PayrollError>;
