//! In-process stand-ins for the external settlement network and treasury.
//!
//! Used by the CLI when no real network is wired in and by tests to script
//! faults (transient errors, rejections, stalls) per destination.

use crate::domain::attempt::IdempotencyKey;
use crate::domain::money::Balance;
use crate::domain::ports::{
    BalanceOracle, BalanceReading, OracleError, Settlement, SettlementError, SettlementReceipt,
    SettlementRequest, SettlementStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// A scripted misbehaviour consumed by the next submission to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Transient(String),
    Reject(String),
    /// Accept and settle the payment, then stall before answering.
    StallAfterAccept(Duration),
    /// Stall without ever accepting the payment.
    Stall(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPayment {
    pub settlement_ref: String,
    pub destination_ref: String,
    pub amount: Balance,
}

#[derive(Default)]
struct SandboxState {
    settled: HashMap<IdempotencyKey, SandboxPayment>,
    rejected: HashMap<IdempotencyKey, String>,
    faults: HashMap<String, VecDeque<Fault>>,
    blocked_destinations: HashMap<String, String>,
    held_queries: HashSet<IdempotencyKey>,
    submit_calls: HashMap<IdempotencyKey, u32>,
    next_ref: u64,
}

impl SandboxState {
    fn settle(&mut self, request: &SettlementRequest) -> SettlementReceipt {
        self.next_ref += 1;
        let payment = SandboxPayment {
            settlement_ref: format!("sbx-{:06}", self.next_ref),
            destination_ref: request.destination_ref.clone(),
            amount: request.amount.into(),
        };
        let receipt = SettlementReceipt {
            settlement_ref: payment.settlement_ref.clone(),
        };
        self.settled.insert(request.idempotency_key.clone(), payment);
        receipt
    }
}

/// Idempotent in-memory settlement network.
#[derive(Default, Clone)]
pub struct SandboxSettlement {
    state: Arc<Mutex<SandboxState>>,
}

impl SandboxSettlement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a fault for the next submission to `destination_ref`.
    pub async fn push_fault(&self, destination_ref: &str, fault: Fault) {
        let mut state = self.state.lock().await;
        state
            .faults
            .entry(destination_ref.to_string())
            .or_default()
            .push_back(fault);
    }

    /// The next `times` submissions to `destination_ref` fail transiently.
    pub async fn fail_transiently(&self, destination_ref: &str, times: usize) {
        for n in 1..=times {
            self.push_fault(destination_ref, Fault::Transient(format!("network busy ({n})")))
                .await;
        }
    }

    /// Every submission to `destination_ref` is rejected.
    pub async fn block_destination(&self, destination_ref: &str, reason: &str) {
        let mut state = self.state.lock().await;
        state
            .blocked_destinations
            .insert(destination_ref.to_string(), reason.to_string());
    }

    /// Status queries for `key` answer `Unknown` until released.
    pub async fn hold_status(&self, key: &IdempotencyKey) {
        self.state.lock().await.held_queries.insert(key.clone());
    }

    pub async fn release_status(&self, key: &IdempotencyKey) {
        self.state.lock().await.held_queries.remove(key);
    }

    /// Records a payment as settled without a submit call, as if the network
    /// received it from a process that crashed before hearing back.
    pub async fn preload_settled(&self, request: &SettlementRequest) -> SettlementReceipt {
        self.state.lock().await.settle(request)
    }

    pub async fn submit_count(&self, key: &IdempotencyKey) -> u32 {
        let state = self.state.lock().await;
        state.submit_calls.get(key).copied().unwrap_or(0)
    }

    pub async fn total_submits(&self) -> u32 {
        self.state.lock().await.submit_calls.values().sum()
    }

    pub async fn payment(&self, key: &IdempotencyKey) -> Option<SandboxPayment> {
        self.state.lock().await.settled.get(key).cloned()
    }

    pub async fn settled_total(&self) -> Balance {
        let state = self.state.lock().await;
        state
            .settled
            .values()
            .fold(Balance::ZERO, |acc, p| acc + p.amount)
    }
}

#[async_trait]
impl Settlement for SandboxSettlement {
    async fn submit(
        &self,
        request: &SettlementRequest,
    ) -> Result<SettlementReceipt, SettlementError> {
        let key = &request.idempotency_key;
        let (outcome, stall) = {
            let mut state = self.state.lock().await;
            *state.submit_calls.entry(key.clone()).or_insert(0) += 1;

            if let Some(existing) = state.settled.get(key) {
                return Ok(SettlementReceipt {
                    settlement_ref: existing.settlement_ref.clone(),
                });
            }
            if let Some(reason) = state.rejected.get(key) {
                return Err(SettlementError::Rejected(reason.clone()));
            }

            let fault = state
                .faults
                .get_mut(&request.destination_ref)
                .and_then(VecDeque::pop_front);
            match fault {
                Some(Fault::Transient(msg)) => (Err(SettlementError::Transient(msg)), None),
                Some(Fault::Reject(reason)) => {
                    state.rejected.insert(key.clone(), reason.clone());
                    (Err(SettlementError::Rejected(reason)), None)
                }
                Some(Fault::StallAfterAccept(delay)) => (Ok(state.settle(request)), Some(delay)),
                Some(Fault::Stall(delay)) => (
                    Err(SettlementError::Transient("stalled".to_string())),
                    Some(delay),
                ),
                None => match state.blocked_destinations.get(&request.destination_ref) {
                    Some(reason) => {
                        let reason = reason.clone();
                        state.rejected.insert(key.clone(), reason.clone());
                        (Err(SettlementError::Rejected(reason)), None)
                    }
                    None => (Ok(state.settle(request)), None),
                },
            }
        };

        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn query_status(&self, key: &IdempotencyKey) -> Result<SettlementStatus, SettlementError> {
        let state = self.state.lock().await;
        if state.held_queries.contains(key) {
            return Ok(SettlementStatus::Unknown);
        }
        if let Some(payment) = state.settled.get(key) {
            return Ok(SettlementStatus::Confirmed {
                settlement_ref: payment.settlement_ref.clone(),
            });
        }
        if let Some(reason) = state.rejected.get(key) {
            return Ok(SettlementStatus::Failed {
                reason: reason.clone(),
            });
        }
        Ok(SettlementStatus::NotFound)
    }
}

/// Treasury oracle reporting a configurable balance.
#[derive(Clone)]
pub struct FixedBalanceOracle {
    balance: Arc<RwLock<Option<Balance>>>,
}

impl FixedBalanceOracle {
    pub fn new(balance: Balance) -> Self {
        Self {
            balance: Arc::new(RwLock::new(Some(balance))),
        }
    }

    pub async fn set_balance(&self, balance: Balance) {
        *self.balance.write().await = Some(balance);
    }

    /// Subsequent reads fail with `TransientUnavailable` until a balance is set.
    pub async fn set_unavailable(&self) {
        *self.balance.write().await = None;
    }
}

#[async_trait]
impl BalanceOracle for FixedBalanceOracle {
    async fn balance(&self) -> Result<BalanceReading, OracleError> {
        match *self.balance.read().await {
            Some(amount) => Ok(BalanceReading {
                amount,
                as_of: Utc::now(),
            }),
            None => Err(OracleError::TransientUnavailable(
                "treasury offline".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use rust_decimal_macros::dec;

    fn request(key: &str, destination: &str) -> SettlementRequest {
        SettlementRequest {
            destination_ref: destination.to_string(),
            amount: Amount::new(dec!(10)).unwrap(),
            idempotency_key: IdempotencyKey(key.to_string()),
        }
    }

    #[tokio::test]
    async fn test_submit_is_idempotent_per_key() {
        let sandbox = SandboxSettlement::new();
        let req = request("run:alice", "wallet-a");
        let first = sandbox.submit(&req).await.unwrap();
        let second = sandbox.submit(&req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sandbox.submit_count(&req.idempotency_key).await, 2);
        assert_eq!(sandbox.settled_total().await, Balance::new(dec!(10)));
    }

    #[tokio::test]
    async fn test_scripted_faults_are_consumed_in_order() {
        let sandbox = SandboxSettlement::new();
        let req = request("run:bob", "wallet-b");
        sandbox.fail_transiently("wallet-b", 2).await;

        assert!(matches!(
            sandbox.submit(&req).await,
            Err(SettlementError::Transient(_))
        ));
        assert!(matches!(
            sandbox.submit(&req).await,
            Err(SettlementError::Transient(_))
        ));
        assert!(sandbox.submit(&req).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_reports_each_outcome() {
        let sandbox = SandboxSettlement::new();
        let ok = request("run:a", "wallet-a");
        let bad = request("run:b", "wallet-b");
        sandbox.block_destination("wallet-b", "account closed").await;

        sandbox.submit(&ok).await.unwrap();
        assert!(sandbox.submit(&bad).await.is_err());

        assert!(matches!(
            sandbox.query_status(&ok.idempotency_key).await.unwrap(),
            SettlementStatus::Confirmed { .. }
        ));
        assert_eq!(
            sandbox.query_status(&bad.idempotency_key).await.unwrap(),
            SettlementStatus::Failed {
                reason: "account closed".to_string()
            }
        );
        assert_eq!(
            sandbox
                .query_status(&IdempotencyKey("run:c".to_string()))
                .await
                .unwrap(),
            SettlementStatus::NotFound
        );

        sandbox.hold_status(&ok.idempotency_key).await;
        assert_eq!(
            sandbox.query_status(&ok.idempotency_key).await.unwrap(),
            SettlementStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_fixed_oracle_availability() {
        let oracle = FixedBalanceOracle::new(Balance::new(dec!(20000)));
        assert_eq!(
            oracle.balance().await.unwrap().amount,
            Balance::new(dec!(20000))
        );
        oracle.set_unavailable().await;
        assert!(oracle.balance().await.is_err());
        oracle.set_balance(Balance::new(dec!(9000))).await;
        assert_eq!(oracle.balance().await.unwrap().amount, Balance::new(dec!(9000)));
    }
}
