//! Contract Test: Idempotency
//!
//! Constraints verified:
//! - A second pass with no address change and no remote drift yields MATCHED
//!   for every previously successful rule
//! - MATCHED passes perform no remote mutation beyond list + compare
//! - A restart that loses nothing re-matches instead of re-creating
//! - A restart that loses handles re-creates, then cleans up the old counterpart
//!
//! If this test fails, repeated passes pile up duplicate firewall rules.

mod common;

use common::*;
use fireflow_core::engine::RuleState;
use fireflow_core::model::{CloudCredentials, Protocol, Rule};
use fireflow_core::store::FileRuleRepository;
use fireflow_core::traits::RuleRepository;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn second_pass_without_change_is_all_matched() {
    let harness = Harness::new().await;
    harness.add_rule(ssh_rule()).await;
    harness
        .add_rule(Rule::new(0, PROVIDER, INSTANCE, Protocol::Udp, "51820", "wireguard"))
        .await;
    harness
        .add_rule(Rule::new(0, PROVIDER, INSTANCE, Protocol::All, "", "everything"))
        .await;

    let first = assert_ok!(harness.engine.run_pass().await);
    assert!(first.outcomes.iter().all(|o| o.state == RuleState::Created));

    let creates = harness.cloud.create_calls();
    let deletes = harness.cloud.delete_calls();
    let lists = harness.cloud.list_calls();

    let second = assert_ok!(harness.engine.run_pass().await);
    assert!(
        second.outcomes.iter().all(|o| o.state == RuleState::Matched),
        "{:?}",
        second.outcomes
    );
    assert_eq!(second.touched(), 0);

    // Only list + compare: one list per rule, no mutations
    assert_eq!(harness.cloud.create_calls(), creates);
    assert_eq!(harness.cloud.delete_calls(), deletes);
    assert_eq!(harness.cloud.list_calls(), lists + 3);
    assert_eq!(harness.cloud.rules(INSTANCE).len(), 3);
}

#[tokio::test]
async fn matched_pass_keeps_handles_stable() {
    let harness = Harness::new().await;
    let rule = harness.add_rule(ssh_rule()).await;

    assert_ok!(harness.engine.run_pass().await);
    let after_first = harness.rule(rule.id).await;
    let updates = harness.repo.update_calls();

    assert_ok!(harness.engine.run_pass().await);
    let after_second = harness.rule(rule.id).await;

    assert_eq!(after_first, after_second);
    // Nothing changed locally either, so nothing was written
    assert_eq!(harness.repo.update_calls(), updates);
}

#[tokio::test]
async fn matched_refreshes_last_applied_address() {
    let harness = Harness::new().await;
    let rule = harness.add_rule(ssh_rule()).await;
    assert_ok!(harness.engine.run_pass().await);

    // Local mirror lost the address but the handle still matches remotely
    let mut stored = harness.rule(rule.id).await;
    stored.last_applied_address = None;
    assert_ok!(harness.repo.update_rule(&stored).await);

    let report = assert_ok!(harness.engine.run_pass().await);
    assert_eq!(report.outcome(rule.id).unwrap().state, RuleState::Matched);
    assert_eq!(
        harness.rule(rule.id).await.last_applied_address,
        Some(addr("203.0.113.5"))
    );
}

#[tokio::test]
async fn address_flapping_back_replaces_again() {
    let harness = Harness::new().await;
    let rule = harness.add_rule(ssh_rule()).await;

    assert_ok!(harness.engine.run_pass().await);
    harness.address.set_raw("203.0.113.9");
    assert_ok!(harness.engine.run_pass().await);
    harness.address.set_raw("203.0.113.5");
    let report = assert_ok!(harness.engine.run_pass().await);

    assert_eq!(report.outcome(rule.id).unwrap().state, RuleState::Replaced);
    let remote = harness.cloud.rules(INSTANCE);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].cidr, "203.0.113.5/32");
}

#[tokio::test]
async fn file_backed_rules_match_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    let cloud = FakeCloud::new();
    let address = FakeAddressSource::new("203.0.113.5");

    let rule_id = {
        let repo = Arc::new(assert_ok!(FileRuleRepository::open(&path).await));
        assert_ok!(
            repo.set_default_credentials(CloudCredentials::new(PROVIDER, "AKIDfile000000000", "k"))
                .await
        );
        let rule = assert_ok!(repo.insert_rule(ssh_rule()).await);

        let engine = engine_over(repo.clone(), repo.clone(), &cloud, &address);
        let report = assert_ok!(engine.run_pass().await);
        assert_eq!(report.outcome(rule.id).unwrap().state, RuleState::Created);
        rule.id
    };

    // Restart: a fresh store and engine over the same file and remote
    let reopened = Arc::new(assert_ok!(FileRuleRepository::open(&path).await));
    let reloaded = assert_ok!(reopened.get_rule_by_id(rule_id).await);
    assert_eq!(reloaded.remote_handle, Some(tcp_handle("22", "203.0.113.5")));

    let engine = engine_over(reopened.clone(), reopened.clone(), &cloud, &address);
    let creates = cloud.create_calls();
    let report = assert_ok!(engine.run_pass().await);

    assert_eq!(report.outcome(rule_id).unwrap().state, RuleState::Matched);
    assert_eq!(cloud.create_calls(), creates);
    assert_eq!(cloud.rules(INSTANCE).len(), 1);
    assert_err!(reopened.get_rule_by_id(rule_id + 1).await);
}

#[tokio::test]
async fn lost_handle_creates_then_cleans_up_old_counterpart() {
    let harness = Harness::new().await;
    // Left over from before the local state was lost, for an older address
    harness.cloud.seed(
        INSTANCE,
        fireflow_core::model::ObservedRule {
            handle: tcp_handle("22", "198.51.100.1"),
            protocol: Protocol::Tcp,
            port: "22".to_string(),
            cidr: "198.51.100.1/32".to_string(),
            action: fireflow_core::RuleAction::Accept,
            label: "ssh-admin".to_string(),
        },
    );
    let rule = harness.add_rule(ssh_rule()).await;

    let first = assert_ok!(harness.engine.run_pass().await);
    assert_eq!(first.outcome(rule.id).unwrap().state, RuleState::Created);
    assert_eq!(harness.cloud.rules(INSTANCE).len(), 2);

    let second = assert_ok!(harness.engine.run_pass().await);
    assert_eq!(second.outcome(rule.id).unwrap().state, RuleState::Replaced);
    let remote = harness.cloud.rules(INSTANCE);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].cidr, "203.0.113.5/32");
}
