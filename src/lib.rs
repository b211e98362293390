//! Payroll disbursement engine.
//!
//! Plans funded payroll runs over a registry of payees, submits each payment
//! exactly once to an external settlement network, and records every state
//! change in an append-only ledger so interrupted runs can be reconciled.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
