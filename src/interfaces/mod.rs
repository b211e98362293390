//! Inbound and outbound adapters for operators: CSV payee import and
//! run reports.

pub mod csv;
