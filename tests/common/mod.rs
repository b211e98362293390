#![allow(dead_code)]

use chrono::NaiveDate;
use payroll_engine::application::engine::PayrollEngine;
use payroll_engine::config::{EngineConfig, RetryPolicy};
use payroll_engine::domain::money::{Amount, Balance};
use payroll_engine::domain::payee::{Payee, ScheduleKind};
use payroll_engine::domain::ports::PayeeRegistry;
use payroll_engine::infrastructure::in_memory::{InMemoryLedger, InMemoryRegistry};
use payroll_engine::infrastructure::sandbox::{FixedBalanceOracle, SandboxSettlement};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

/// One engine instance plus handles on its in-memory collaborators.
pub struct Harness {
    pub engine: PayrollEngine,
    pub registry: InMemoryRegistry,
    pub ledger: InMemoryLedger,
    pub settlement: SandboxSettlement,
    pub oracle: FixedBalanceOracle,
}

pub fn pay_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 11, 15).unwrap()
}

pub fn fast_config(owner: &str) -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
        },
        workers: 4,
        call_timeout: Duration::from_millis(300),
        lease_ttl: Duration::from_secs(30),
        owner_id: owner.to_string(),
        ..EngineConfig::default()
    }
}

pub fn payee(id: &str, amount: Decimal) -> Payee {
    Payee::new(
        id,
        format!("0x{id}"),
        Amount::new(amount).unwrap(),
        ScheduleKind::Monthly,
    )
    .unwrap()
}

/// The three monthly payees from the reference scenarios: 15000 in total.
pub fn team() -> Vec<Payee> {
    vec![
        payee("alice", dec!(5000)),
        payee("bob", dec!(4500)),
        payee("carol", dec!(5500)),
    ]
}

pub fn engine_on(
    ledger: &InMemoryLedger,
    registry: &InMemoryRegistry,
    settlement: &SandboxSettlement,
    oracle: &FixedBalanceOracle,
    config: EngineConfig,
) -> PayrollEngine {
    PayrollEngine::new(
        Arc::new(registry.clone()),
        Arc::new(ledger.clone()),
        Arc::new(oracle.clone()),
        Arc::new(settlement.clone()),
        config,
    )
}

pub async fn harness(balance: Decimal, payees: Vec<Payee>) -> Harness {
    harness_with(balance, payees, fast_config("engine-a")).await
}

pub async fn harness_with(balance: Decimal, payees: Vec<Payee>, config: EngineConfig) -> Harness {
    let registry = InMemoryRegistry::new();
    for p in payees {
        registry.upsert(p).await.unwrap();
    }
    let ledger = InMemoryLedger::new();
    let settlement = SandboxSettlement::new();
    let oracle = FixedBalanceOracle::new(Balance::new(balance));
    let engine = engine_on(&ledger, &registry, &settlement, &oracle, config);
    Harness {
        engine,
        registry,
        ledger,
        settlement,
        oracle,
    }
}

impl Harness {
    /// A second engine instance over the same ledger, registry and network.
    pub fn peer(&self, config: EngineConfig) -> PayrollEngine {
        engine_on(
            &self.ledger,
            &self.registry,
            &self.settlement,
            &self.oracle,
            config,
        )
    }
}
