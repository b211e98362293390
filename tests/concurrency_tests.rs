mod common;

use common::{fast_config, harness, harness_with, pay_date, team};
use futures::future::join_all;
use payroll_engine::domain::attempt::FailureCause;
use payroll_engine::domain::ports::Ledger;
use payroll_engine::domain::run::RunStatus;
use payroll_engine::error::PayrollError;
use payroll_engine::infrastructure::sandbox::Fault;
use rust_decimal_macros::dec;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_run_starts_exactly_one_succeeds() {
    let h = harness(dec!(100000), team()).await;
    let engines: Vec<_> = (0..8)
        .map(|n| h.peer(fast_config(&format!("engine-{n}"))))
        .collect();

    let handles = engines
        .into_iter()
        .map(|engine| tokio::spawn(async move { engine.plan(pay_date()).await }));
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let committed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(committed, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, PayrollError::ConcurrentRunConflict(_)))
    );
    assert_eq!(h.ledger.runs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_start_while_active_is_rejected_without_state_change() {
    let h = harness(dec!(100000), team()).await;
    let run = h.engine.plan(pay_date()).await.unwrap();
    let entries_before = h.ledger.all_entries().await.len();

    let other = h.peer(fast_config("engine-b"));
    assert!(matches!(
        other.plan(pay_date()).await,
        Err(PayrollError::ConcurrentRunConflict(_))
    ));
    assert!(matches!(
        other.execute(run.run_id).await,
        Err(PayrollError::ConcurrentRunConflict(_))
    ));
    assert_eq!(h.ledger.all_entries().await.len(), entries_before);
    assert_eq!(h.settlement.total_submits().await, 0);
}

#[tokio::test]
async fn test_cancel_during_retry_wait_stops_new_submissions() {
    let mut config = fast_config("engine-a");
    config.retry.backoff_base = Duration::from_millis(500);
    config.retry.backoff_max = Duration::from_millis(500);
    let h = harness_with(dec!(20000), team(), config).await;
    h.settlement.fail_transiently("0xbob", 1).await;

    let run = h.engine.plan(pay_date()).await.unwrap();
    let engine = h.engine.clone();
    let driver = tokio::spawn(async move { engine.execute(run.run_id).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    h.engine.cancel(run.run_id).await.unwrap();
    let summary = driver.await.unwrap().unwrap();

    assert_eq!(summary.run.status, RunStatus::Cancelled);
    assert_eq!(summary.confirmed().count(), 2);
    let bob = summary.attempt(&"bob".into()).unwrap();
    assert_eq!(bob.failure(), Some(&FailureCause::Cancelled));
    assert_eq!(h.settlement.submit_count(&bob.key()).await, 1);
}

#[tokio::test]
async fn test_cancel_mid_round_withdraws_queued_attempts() {
    let mut config = fast_config("engine-a");
    config.workers = 1;
    config.call_timeout = Duration::from_secs(2);
    let h = harness_with(dec!(20000), team(), config).await;
    h.settlement
        .push_fault("0xalice", Fault::StallAfterAccept(Duration::from_millis(300)))
        .await;

    let run = h.engine.plan(pay_date()).await.unwrap();
    let engine = h.engine.clone();
    let driver = tokio::spawn(async move { engine.execute(run.run_id).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.cancel(run.run_id).await.unwrap();
    let summary = driver.await.unwrap().unwrap();

    assert_eq!(summary.run.status, RunStatus::Cancelled);
    assert_eq!(h.settlement.total_submits().await, 1);
    let alice = summary.attempt(&"alice".into()).unwrap();
    assert!(alice.settlement_ref().is_some());
    for id in ["bob", "carol"] {
        let attempt = summary.attempt(&id.into()).unwrap();
        assert_eq!(attempt.failure(), Some(&FailureCause::Cancelled));
        assert_eq!(attempt.attempt_count, 0);
    }
}

#[tokio::test]
async fn test_workers_bound_does_not_change_outcome() {
    let mut config = fast_config("engine-a");
    config.workers = 1;
    let h = harness_with(dec!(20000), team(), config).await;

    let summary = h.engine.run_payroll(pay_date()).await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Completed);
    assert_eq!(h.settlement.total_submits().await, 3);
}
