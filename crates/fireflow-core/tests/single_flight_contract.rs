//! Contract Test: Single-flight passes and bounded calls
//!
//! Constraints verified:
//! - A pass requested while another is in flight is rejected with
//!   PassInProgress and never mutates remote state
//! - The single-rule path shares the same run-lock
//! - A hung provider or address source is bounded by the call timeout
//! - Each step of a replace is bounded on its own, never the replace as a whole
//! - wait_idle() returns once the in-flight pass completes

mod common;

use common::*;
use fireflow_core::config::FireflowConfig;
use fireflow_core::engine::{EngineEvent, RuleState};
use fireflow_core::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn overlapping_pass_is_rejected() {
    let mut harness = Harness::new().await;
    let rule = harness.add_rule(ssh_rule()).await;
    harness.cloud.set_create_delay(Duration::from_millis(300));

    let engine = Arc::clone(&harness.engine);
    let in_flight = tokio::spawn(async move { engine.run_pass().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.engine.is_running());

    let rejected = harness.engine.run_pass().await;
    assert!(matches!(rejected, Err(Error::PassInProgress)));

    let rejected_single = harness.engine.execute_rule(rule.id).await;
    assert!(matches!(rejected_single, Err(Error::PassInProgress)));

    let report = in_flight.await.unwrap().unwrap();
    assert_eq!(report.outcome(rule.id).unwrap().state, RuleState::Created);

    assert_eq!(harness.cloud.create_calls(), 1);
    assert_eq!(harness.cloud.max_in_flight(), 1);
    assert_eq!(harness.cloud.rules(INSTANCE).len(), 1);

    let rejections = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::PassRejected))
        .count();
    assert_eq!(rejections, 2);
}

#[tokio::test]
async fn concurrent_run_requests_never_overlap() {
    let harness = Harness::new().await;
    harness.add_rule(ssh_rule()).await;
    harness.cloud.set_create_delay(Duration::from_millis(100));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&harness.engine);
        handles.push(tokio::spawn(async move { engine.run_pass().await }));
    }

    let mut ran = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ran += 1,
            Err(Error::PassInProgress) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert!(ran >= 1);
    assert_eq!(ran + rejected, 8);
    assert_eq!(harness.cloud.max_in_flight(), 1);
    assert_eq!(harness.cloud.rules(INSTANCE).len(), 1);
}

#[tokio::test]
async fn wait_idle_drains_in_flight_pass() {
    let harness = Harness::new().await;
    harness.add_rule(ssh_rule()).await;
    harness.cloud.set_create_delay(Duration::from_millis(200));

    let engine = Arc::clone(&harness.engine);
    let in_flight = tokio::spawn(async move { engine.run_pass().await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    harness.engine.wait_idle().await;
    assert!(!harness.engine.is_running());
    assert_eq!(harness.cloud.rules(INSTANCE).len(), 1);
    in_flight.await.unwrap().unwrap();
}

#[tokio::test]
async fn hung_provider_call_times_out_as_transient() {
    let mut config = FireflowConfig::default();
    config.engine.call_timeout_secs = 1;
    let harness = Harness::with_config(config).await;
    let rule = harness.add_rule(ssh_rule()).await;
    harness.cloud.set_create_delay(Duration::from_secs(10));

    let started = Instant::now();
    let report = harness.engine.run_pass().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    let outcome = report.outcome(rule.id).unwrap();
    assert_eq!(outcome.state, RuleState::Failed);
    assert!(outcome.detail.as_deref().unwrap().contains("timed out"));

    // The run-lock is released; the next pass can proceed
    assert!(!harness.engine.is_running());
}

#[tokio::test]
async fn replace_steps_are_bounded_individually() {
    let mut config = FireflowConfig::default();
    config.engine.call_timeout_secs = 1;
    let harness = Harness::with_config(config).await;
    let rule = harness.add_rule(ssh_rule()).await;
    harness.engine.run_pass().await.unwrap();

    // Each step fits the timeout; create plus delete together do not
    harness.cloud.set_create_delay(Duration::from_millis(600));
    harness.cloud.set_delete_delay(Duration::from_millis(600));
    harness.address.set_raw("203.0.113.9");
    let report = harness.engine.run_pass().await.unwrap();

    assert_eq!(report.outcome(rule.id).unwrap().state, RuleState::Replaced);
    let remote = harness.cloud.rules(INSTANCE);
    assert_eq!(remote.len(), 1, "stale rule must be deleted: {:?}", remote);
    assert_eq!(remote[0].cidr, "203.0.113.9/32");
    assert_eq!(
        harness.rule(rule.id).await.remote_handle,
        Some(tcp_handle("22", "203.0.113.9"))
    );
}

#[tokio::test]
async fn hung_stale_delete_keeps_replacement() {
    let mut config = FireflowConfig::default();
    config.engine.call_timeout_secs = 1;
    let harness = Harness::with_config(config).await;
    let rule = harness.add_rule(ssh_rule()).await;
    harness.engine.run_pass().await.unwrap();

    harness.cloud.set_delete_delay(Duration::from_secs(10));
    harness.address.set_raw("203.0.113.9");
    let report = harness.engine.run_pass().await.unwrap();

    let outcome = report.outcome(rule.id).unwrap();
    assert_eq!(outcome.state, RuleState::Replaced);
    assert!(outcome.detail.as_deref().unwrap().contains("left behind"));
    assert_eq!(
        harness.rule(rule.id).await.remote_handle,
        Some(tcp_handle("22", "203.0.113.9"))
    );
}

#[tokio::test]
async fn hung_address_source_times_out_as_unavailable() {
    let mut config = FireflowConfig::default();
    config.engine.call_timeout_secs = 1;
    let harness = Harness::with_config(config).await;
    harness.address.set_delay(Duration::from_secs(10));

    let started = Instant::now();
    let err = harness.engine.run_pass().await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, Error::AddressUnavailable(_)), "got {:?}", err);
    assert!(!harness.engine.is_running());
}
