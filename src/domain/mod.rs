//! Domain model: payees, runs, attempts, the ledger projection and the
//! ports through which the engine reaches storage and external services.

pub mod attempt;
pub mod lease;
pub mod ledger;
pub mod money;
pub mod payee;
pub mod ports;
pub mod run;
