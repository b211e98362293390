//! Application layer orchestrating payroll runs over the domain ports.
//!
//! [`engine::PayrollEngine`] is the entry point. It delegates to the
//! [`planner::RunPlanner`] to commit a funded run, the
//! [`executor::DisbursementExecutor`] to submit its payments and the
//! [`reconciler::Reconciler`] to recover runs interrupted by a crash or
//! timeout. All three coordinate through the ledger's run lease.

pub mod engine;
pub mod executor;
pub mod lease;
pub mod planner;
pub mod reconciler;
pub mod summary;
