use crate::application::planner::FundingPreview;
use crate::application::summary::RunSummary;
use crate::domain::money::{Amount, Balance};
use crate::error::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct AttemptRow<'a> {
    run_id: String,
    pay_date: NaiveDate,
    run_status: String,
    payee: &'a str,
    destination: &'a str,
    amount: Amount,
    status: &'static str,
    attempts: u32,
    settlement_ref: Option<&'a str>,
    error: Option<String>,
}

#[derive(Serialize)]
struct HistoryRow {
    run_id: String,
    pay_date: NaiveDate,
    created_at: DateTime<Utc>,
    status: String,
    payees: usize,
    paid: usize,
    total_required: Balance,
    total_confirmed: Balance,
}

#[derive(Serialize)]
struct PreviewRow {
    pay_date: NaiveDate,
    due_payees: usize,
    total_required: Balance,
    balance: Balance,
    shortfall: Balance,
    status: &'static str,
}

/// Writes operator reports (run detail, run history, funding preview) as CSV.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// One row per attempt of the run.
    pub fn write_summary(&mut self, summary: &RunSummary) -> Result<()> {
        let run_id = summary.run.run_id.to_string();
        let run_status = summary.run.status.to_string();
        for attempt in &summary.attempts {
            self.writer.serialize(AttemptRow {
                run_id: run_id.clone(),
                pay_date: summary.run.pay_date,
                run_status: run_status.clone(),
                payee: &attempt.payee_id.0,
                destination: &attempt.destination_ref,
                amount: attempt.amount,
                status: attempt.status.label(),
                attempts: attempt.attempt_count,
                settlement_ref: attempt.settlement_ref(),
                error: attempt
                    .failure()
                    .map(ToString::to_string)
                    .or_else(|| attempt.last_error.clone()),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// One row per run, oldest first.
    pub fn write_history(&mut self, summaries: &[RunSummary]) -> Result<()> {
        for summary in summaries {
            self.writer.serialize(HistoryRow {
                run_id: summary.run.run_id.to_string(),
                pay_date: summary.run.pay_date,
                created_at: summary.run.created_at,
                status: summary.run.status.to_string(),
                payees: summary.attempts.len(),
                paid: summary.confirmed().count(),
                total_required: summary.run.total_required,
                total_confirmed: summary.total_confirmed(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_preview(&mut self, preview: &FundingPreview) -> Result<()> {
        self.writer.serialize(PreviewRow {
            pay_date: preview.pay_date,
            due_payees: preview.due.len(),
            total_required: preview.total_required,
            balance: preview.balance.amount,
            shortfall: preview.shortfall(),
            status: if preview.is_sufficient() {
                "ready"
            } else {
                "insufficient"
            },
        })?;
        self.writer.flush()?;
        Ok(())
    }
}
