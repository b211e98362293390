use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use payroll_engine::application::engine::PayrollEngine;
use payroll_engine::config::{EngineArgs, EngineConfig};
use payroll_engine::domain::money::Balance;
use payroll_engine::domain::ports::{LedgerRef, PayeeRegistryRef};
use payroll_engine::domain::run::RunId;
use payroll_engine::infrastructure::in_memory::{InMemoryLedger, InMemoryRegistry};
use payroll_engine::infrastructure::sandbox::{FixedBalanceOracle, SandboxSettlement};
use payroll_engine::interfaces::csv::payee_reader::PayeeReader;
use payroll_engine::interfaces::csv::report_writer::ReportWriter;
use rust_decimal::Decimal;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true, env = "PAYROLL_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resume interrupted runs, then plan and execute the run for a pay date
    Run {
        /// Payees CSV file (id,destination,amount,schedule[,active]) to import first
        #[arg(long)]
        payees: Option<PathBuf>,

        /// Treasury balance reported by the sandbox oracle
        #[arg(long)]
        balance: Decimal,

        /// Pay date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Destination the sandbox settlement rejects (repeatable)
        #[arg(long = "reject")]
        rejected: Vec<String>,
    },
    /// Show due payees, required total and balance without committing a run
    Preview {
        #[arg(long)]
        payees: Option<PathBuf>,

        #[arg(long)]
        balance: Decimal,

        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Resolve in-doubt payments and resume every open run
    Reconcile,
    /// List every run with its totals
    History,
    /// Request cancellation of a run
    Cancel {
        run_id: RunId,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

fn open_storage(db_path: Option<PathBuf>) -> Result<(PayeeRegistryRef, LedgerRef)> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            use payroll_engine::infrastructure::rocksdb::RocksDBStore;

            let store = RocksDBStore::open(&path).into_diagnostic()?;
            info!(path = %path.display(), "using RocksDB ledger");
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(path) => {
            warn!(
                path = %path.display(),
                "built without storage-rocksdb; falling back to in-memory ledger"
            );
            Ok((
                Arc::new(InMemoryRegistry::new()),
                Arc::new(InMemoryLedger::new()),
            ))
        }
        None => Ok((
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryLedger::new()),
        )),
    }
}

async fn import_payees(engine: &PayrollEngine, path: &Path) -> Result<()> {
    let file = File::open(path).into_diagnostic()?;
    let mut imported = 0usize;
    for payee in PayeeReader::new(file).payees() {
        match payee {
            Ok(payee) => {
                engine.registry().upsert(payee).await.into_diagnostic()?;
                imported += 1;
            }
            Err(e) => warn!(error = %e, "skipping payee row"),
        }
    }
    info!(imported, "payees imported");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from(cli.engine);
    let (registry, ledger) = open_storage(cli.db_path)?;

    let oracle = FixedBalanceOracle::new(Balance::ZERO);
    let settlement = SandboxSettlement::new();
    let engine = PayrollEngine::new(
        registry,
        ledger,
        Arc::new(oracle.clone()),
        Arc::new(settlement.clone()),
        config,
    );
    let mut writer = ReportWriter::new(io::stdout().lock());

    match cli.command {
        Command::Run {
            payees,
            balance,
            date,
            rejected,
        } => {
            if let Some(path) = payees {
                import_payees(&engine, &path).await?;
            }
            for destination in &rejected {
                settlement
                    .block_destination(destination, "destination rejected by sandbox")
                    .await;
            }
            oracle.set_balance(Balance::new(balance)).await;

            let report = engine.reconcile().await.into_diagnostic()?;
            if !report.skipped_runs.is_empty() {
                warn!(
                    runs = report.skipped_runs.len(),
                    "some open runs are held by another instance"
                );
            }

            let pay_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let summary = engine.run_payroll(pay_date).await.into_diagnostic()?;
            writer.write_summary(&summary).into_diagnostic()?;
        }
        Command::Preview {
            payees,
            balance,
            date,
        } => {
            if let Some(path) = payees {
                import_payees(&engine, &path).await?;
            }
            oracle.set_balance(Balance::new(balance)).await;
            let pay_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let preview = engine.preview(pay_date).await.into_diagnostic()?;
            writer.write_preview(&preview).into_diagnostic()?;
        }
        Command::Reconcile => {
            let report = engine.reconcile().await.into_diagnostic()?;
            for summary in &report.summaries {
                writer.write_summary(summary).into_diagnostic()?;
            }
            info!(
                examined = report.examined,
                resolved = report.resolved,
                held = report.held,
                resubmitted = report.resubmitted,
                skipped = report.skipped_runs.len(),
                "reconcile done"
            );
        }
        Command::History => {
            let mut summaries = Vec::new();
            for run in engine.history().await.into_diagnostic()? {
                summaries.push(engine.summary(run.run_id).await.into_diagnostic()?);
            }
            writer.write_history(&summaries).into_diagnostic()?;
        }
        Command::Cancel { run_id } => {
            engine.cancel(run_id).await.into_diagnostic()?;
        }
    }

    Ok(())
}
