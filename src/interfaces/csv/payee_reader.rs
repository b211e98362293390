use crate::domain::money::Amount;
use crate::domain::payee::{Payee, PayeeId, ScheduleKind};
use crate::error::{PayrollError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One row of a payee import file: `id,destination,amount,schedule[,active]`.
#[derive(Debug, Deserialize)]
struct PayeeRecord {
    id: String,
    destination: String,
    amount: Decimal,
    schedule: ScheduleKind,
    #[serde(default)]
    active: Option<bool>,
}

impl TryFrom<PayeeRecord> for Payee {
    type Error = PayrollError;

    fn try_from(record: PayeeRecord) -> Result<Self> {
        let payee = Payee {
            id: PayeeId(record.id),
            destination_ref: record.destination,
            amount: Amount::new(record.amount)?,
            schedule: record.schedule,
            active: record.active.unwrap_or(true),
        };
        payee.validate()?;
        Ok(payee)
    }
}

/// Reads payees from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over `Result<Payee>`.
/// It handles whitespace trimming and a missing `active` column automatically.
pub struct PayeeReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> PayeeReader<R> {
    /// Creates a new `PayeeReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and validates payees.
    ///
    /// A malformed row yields an error without stopping the rows after it.
    pub fn payees(self) -> impl Iterator<Item = Result<Payee>> {
        self.reader
            .into_deserialize::<PayeeRecord>()
            .map(|result| result.map_err(PayrollError::from).and_then(Payee::try_from))
    }
}
