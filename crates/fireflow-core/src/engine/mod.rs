//! Reconciliation engine
//!
//! The engine is responsible for:
//! - Resolving the current public address via the AddressSource
//! - Loading enabled rules from the RuleRepository
//! - Driving each rule's remote counterpart to the desired state
//! - Persisting handles and addresses after successful remote changes
//!
//! ## Architecture
//!
//! ```text
//!   Scheduler / AdminService
//!              │ run_pass()
//!              ▼
//!   ┌──────────────────────┐   resolve()   ┌───────────────┐
//!   │ ReconciliationEngine │──────────────▶│ AddressSource │
//!   └──────────────────────┘               └───────────────┘
//!              │
//!    ┌─────────┼───────────────────────┬──────────────────┐
//!    ▼         ▼                       ▼                  ▼
//! ┌──────────────┐ ┌──────────────────┐ ┌────────────────┐ ┌────────┐
//! │RuleRepository│ │ ProviderRegistry │ │FirewallProvider│ │ Events │
//! └──────────────┘ └──────────────────┘ └────────────────┘ └────────┘
//! ```
//!
//! ## Per-rule state machine
//!
//! ```text
//! PENDING -> MATCHED | CREATED | REPLACED | FAILED   (or SKIPPED)
//! ```
//!
//! 1. Disabled or unlabelled rules are SKIPPED.
//! 2. No known handle: create → CREATED.
//! 3. Known handle: [`replace_rule`]. Nothing mutated and the same handle
//!    back → MATCHED; a replacement created or stale duplicates deleted →
//!    REPLACED; `RuleNotFound` → create → CREATED.
//! 4. Any other error → FAILED; local state untouched, the pass continues.
//!
//! Every list, create and delete runs under its own `call_timeout`; the
//! composite replace is never bounded as a whole.
//!
//! Persistence happens only after the remote call succeeded and is best
//! effort: a failed write is logged and the next pass self-heals.
//!
//! ## Single flight
//!
//! Passes never overlap. `run_pass` and `execute_rule` share a run-lock;
//! a caller that finds it held gets [`Error::PassInProgress`].

mod report;

pub use report::{PassReport, RuleOutcome, RuleState};

use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{FireflowConfig, keys};
use crate::error::{Error, Result};
use crate::model::{ObservedRule, RemoteHandle, Rule};
use crate::registry::ProviderRegistry;
use crate::traits::{
    AddressSource, ConfigSource, FirewallProvider, Replacement, RuleRepository, bounded,
    replace_rule,
};

/// Events emitted by the ReconciliationEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A pass acquired the run-lock
    PassStarted { started_at: DateTime<Utc> },

    /// A rule reached MATCHED, CREATED, REPLACED or SKIPPED
    RuleReconciled {
        rule_id: u64,
        label: String,
        state: RuleState,
        remote_handle: Option<RemoteHandle>,
    },

    /// A rule reached FAILED
    RuleFailed {
        rule_id: u64,
        label: String,
        error: String,
    },

    /// A pass completed
    PassFinished {
        address: Ipv4Addr,
        total: usize,
        touched: usize,
        failed: usize,
    },

    /// A pass was aborted before any rule was evaluated
    PassAborted { error: String },

    /// A pass was refused because another one was running
    PassRejected,
}

/// Core reconciliation engine
///
/// ## Lifecycle
///
/// 1. Create with [`ReconciliationEngine::new()`]
/// 2. Share behind an `Arc` with the scheduler and the admin service
/// 3. Call [`ReconciliationEngine::run_pass()`] from either
/// 4. [`ReconciliationEngine::wait_idle()`] before shutdown
pub struct ReconciliationEngine {
    address_source: Arc<dyn AddressSource>,
    repository: Arc<dyn RuleRepository>,
    config_source: Arc<dyn ConfigSource>,
    registry: Arc<ProviderRegistry>,

    /// Used when `ip_fetch_url` is unset
    default_address_url: String,

    /// Bound on every address resolution and provider call
    call_timeout: Duration,

    run_lock: Mutex<()>,

    event_tx: mpsc::Sender<EngineEvent>,
}

impl ReconciliationEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        address_source: Arc<dyn AddressSource>,
        repository: Arc<dyn RuleRepository>,
        config_source: Arc<dyn ConfigSource>,
        registry: Arc<ProviderRegistry>,
        config: &FireflowConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);

        let engine = Self {
            address_source,
            repository,
            config_source,
            registry,
            default_address_url: config.address.default_url.clone(),
            call_timeout: config.engine.call_timeout(),
            run_lock: Mutex::new(()),
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// Run one full pass over every enabled rule
    ///
    /// # Returns
    ///
    /// - `Ok(PassReport)`: the pass ran; individual rules may still have FAILED
    /// - `Err(Error::PassInProgress)`: another pass holds the run-lock
    /// - `Err(_)`: address resolution or rule listing failed; nothing was attempted
    pub async fn run_pass(&self) -> Result<PassReport> {
        let _guard = self.acquire()?;
        let started_at = Utc::now();
        self.emit_event(EngineEvent::PassStarted { started_at });

        let (address, mut rules) = match self.prepare_pass().await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Reconciliation pass aborted: {}", e);
                self.emit_event(EngineEvent::PassAborted {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        rules.sort_by_key(|r| r.id);
        info!(
            "Reconciling {} rule(s) against {}",
            rules.len(),
            address
        );

        let mut outcomes = Vec::with_capacity(rules.len());
        for rule in &rules {
            outcomes.push(self.reconcile_rule(rule, address).await);
        }

        let report = PassReport {
            address,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        self.finish(&report);
        Ok(report)
    }

    /// Reconcile a single rule now, regardless of schedule
    ///
    /// Shares the run-lock with [`Self::run_pass`]. A disabled or unlabelled
    /// rule yields SKIPPED.
    pub async fn execute_rule(&self, rule_id: u64) -> Result<PassReport> {
        let _guard = self.acquire()?;
        let started_at = Utc::now();
        self.emit_event(EngineEvent::PassStarted { started_at });

        let prepared = async {
            let address = self.resolve_address().await?;
            let rule = self.repository.get_rule_by_id(rule_id).await?;
            Ok::<_, Error>((address, rule))
        }
        .await;

        let (address, rule) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Execution of rule {} aborted: {}", rule_id, e);
                self.emit_event(EngineEvent::PassAborted {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let outcome = self.reconcile_rule(&rule, address).await;
        let report = PassReport {
            address,
            started_at,
            finished_at: Utc::now(),
            outcomes: vec![outcome],
        };
        self.finish(&report);
        Ok(report)
    }

    /// Remove the remote counterpart of a rule, best effort
    ///
    /// Applies whatever the rule's enabled flag says: a disabled rule may
    /// still have a permissive remote rule from an earlier pass. Waits for
    /// any in-flight pass so the removal cannot race a replace of the same
    /// rule. Returns whether a remote rule was deleted.
    pub async fn retire_rule(&self, rule: &Rule) -> Result<bool> {
        let _guard = self.run_lock.lock().await;

        let applied = rule.known_handle().is_some() || rule.last_applied_address.is_some();
        if rule.label.trim().is_empty() || !applied {
            debug!("Rule {} was never applied; nothing to remove remotely", rule.id);
            return Ok(false);
        }

        let provider = self.provider_for(&rule.provider, rule.cloud_config_id).await?;
        let name = provider.provider_name();
        let desired = rule.desired_state(rule.last_applied_address.unwrap_or(Ipv4Addr::UNSPECIFIED));
        let observed = self
            .call(name, provider.list_firewall_rules(&rule.instance_id))
            .await?;

        let matcher = provider.matcher();
        let Some(remote) = matcher.find(&desired, rule.known_handle(), &observed) else {
            debug!("No remote counterpart for rule {} on {}", rule.id, rule.instance_id);
            return Ok(false);
        };
        let mut doomed = vec![remote.clone()];
        doomed.extend(matcher.duplicates(&desired, remote, &observed).into_iter().cloned());

        for remote in &doomed {
            self.call(name, provider.delete_firewall_rule_by_spec(&rule.instance_id, remote))
                .await?;
            info!(
                "Removed remote rule {} ({}) for rule {} on {}",
                remote.handle, remote.cidr, rule.id, rule.instance_id
            );
        }
        Ok(true)
    }

    /// Resolve the current public address
    ///
    /// Reads `ip_fetch_url` from the config source, falling back to the
    /// configured default when it is unset, empty or unreadable.
    pub async fn resolve_address(&self) -> Result<Ipv4Addr> {
        let url = match self.config_source.get_string(keys::IP_FETCH_URL).await {
            Ok(Some(url)) if !url.trim().is_empty() => url.trim().to_string(),
            Ok(_) => self.default_address_url.clone(),
            Err(e) => {
                warn!(
                    "Failed to read {}: {}. Using {}",
                    keys::IP_FETCH_URL,
                    e,
                    self.default_address_url
                );
                self.default_address_url.clone()
            }
        };

        debug!("Resolving public address via {} ({})", url, self.address_source.source_name());
        let address = tokio::time::timeout(self.call_timeout, self.address_source.resolve(&url))
            .await
            .map_err(|_| {
                Error::address_unavailable(format!(
                    "{} did not answer within {:?}",
                    url, self.call_timeout
                ))
            })??;

        debug!("Resolved public address {}", address);
        Ok(address)
    }

    /// Build a provider client from the credentials a rule points at
    pub async fn provider_for(
        &self,
        provider: &str,
        cloud_config_id: Option<u64>,
    ) -> Result<Box<dyn FirewallProvider>> {
        let credentials = self
            .repository
            .cloud_credentials(cloud_config_id, provider)
            .await?;
        self.registry.create_provider(provider, &credentials)
    }

    /// Wait until no pass is running
    pub async fn wait_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    /// Whether a pass currently holds the run-lock
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Bound a provider call by the per-call timeout
    pub(crate) async fn call<T, F>(&self, provider: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded(provider, Some(self.call_timeout), fut).await
    }

    fn acquire(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.run_lock.try_lock().map_err(|_| {
            warn!("Reconciliation pass already running; request rejected");
            self.emit_event(EngineEvent::PassRejected);
            Error::PassInProgress
        })
    }

    async fn prepare_pass(&self) -> Result<(Ipv4Addr, Vec<Rule>)> {
        let address = self.resolve_address().await?;
        let rules = self.repository.list_enabled_rules().await?;
        Ok((address, rules))
    }

    fn finish(&self, report: &PassReport) {
        info!("Reconciliation pass finished: {}", report.summary());
        self.emit_event(EngineEvent::PassFinished {
            address: report.address,
            total: report.outcomes.len(),
            touched: report.touched(),
            failed: report.failed(),
        });
    }

    /// Reconcile one rule; never fails the pass
    async fn reconcile_rule(&self, rule: &Rule, address: Ipv4Addr) -> RuleOutcome {
        if !rule.is_reconcilable() {
            let reason = if !rule.enabled {
                debug!("Rule {} is disabled, skipping", rule.id);
                "disabled"
            } else {
                warn!("Rule {} has no label and can never be matched, skipping", rule.id);
                "no label"
            };
            return self.record(RuleOutcome::skipped(rule, reason));
        }

        match self.apply(rule, address).await {
            Ok((state, observed, detail)) => {
                self.persist(rule, address, &observed.handle).await;
                let outcome = RuleOutcome::applied(rule, state, observed.handle);
                self.record(match detail {
                    Some(detail) => outcome.with_detail(detail),
                    None => outcome,
                })
            }
            Err(e) => {
                error!(
                    "Rule {} ({}) on {} failed: {}",
                    rule.id, rule.label, rule.instance_id, e
                );
                self.record(RuleOutcome::failed(rule, &e))
            }
        }
    }

    /// Remote half of the state machine
    async fn apply(
        &self,
        rule: &Rule,
        address: Ipv4Addr,
    ) -> Result<(RuleState, ObservedRule, Option<String>)> {
        let provider = self.provider_for(&rule.provider, rule.cloud_config_id).await?;
        let name = provider.provider_name();
        let desired = rule.desired_state(address);

        let Some(prior) = rule.known_handle() else {
            debug!("Rule {} has no remote handle, creating", rule.id);
            let created = self
                .call(name, provider.create_firewall_rule(&rule.instance_id, &desired))
                .await?;
            info!(
                "Created remote rule {} for rule {} ({}) on {}",
                created.handle, rule.id, desired.cidr, rule.instance_id
            );
            return Ok((RuleState::Created, created, None));
        };

        let replacement = replace_rule(
            provider.as_ref(),
            &rule.instance_id,
            Some(prior),
            &desired,
            Some(self.call_timeout),
        )
        .await;

        match replacement {
            Ok(replacement) => {
                let detail = describe_cleanup(&replacement);
                if !replacement.mutated() && &replacement.rule.handle == prior {
                    debug!("Rule {} already matches {}", rule.id, desired.cidr);
                    return Ok((RuleState::Matched, replacement.rule, detail));
                }
                info!(
                    "Replaced remote rule for rule {} on {}: {} -> {}",
                    rule.id, rule.instance_id, prior, replacement.rule.handle
                );
                Ok((RuleState::Replaced, replacement.rule, detail))
            }
            Err(e) if e.is_rule_not_found() => {
                info!(
                    "Remote rule for rule {} disappeared from {}, recreating",
                    rule.id, rule.instance_id
                );
                let created = self
                    .call(name, provider.create_firewall_rule(&rule.instance_id, &desired))
                    .await?;
                Ok((RuleState::Created, created, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Write back handle and address; failures are logged, never surfaced
    async fn persist(&self, rule: &Rule, address: Ipv4Addr, handle: &RemoteHandle) {
        let mut updated = rule.clone();
        updated.remote_handle = Some(handle.clone());
        updated.last_applied_address = Some(address);

        if updated == *rule {
            return;
        }

        if let Err(e) = self.repository.update_rule(&updated).await {
            warn!(
                "Remote change for rule {} succeeded but saving it failed: {}. \
                 The next pass will reconcile again.",
                rule.id, e
            );
        }
    }

    fn record(&self, outcome: RuleOutcome) -> RuleOutcome {
        let event = match outcome.state {
            RuleState::Failed => EngineEvent::RuleFailed {
                rule_id: outcome.rule_id,
                label: outcome.label.clone(),
                error: outcome.detail.clone().unwrap_or_default(),
            },
            state => EngineEvent::RuleReconciled {
                rule_id: outcome.rule_id,
                label: outcome.label.clone(),
                state,
                remote_handle: outcome.remote_handle.clone(),
            },
        };
        self.emit_event(event);
        outcome
    }

    /// Emit an engine event, dropping it when the channel is full
    fn emit_event(&self, event: EngineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Event channel full, dropping event. Consider increasing event_channel_capacity."
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("No event listener, dropping event");
            }
        }
    }
}

/// Outcome detail for stale rules deleted or left behind
fn describe_cleanup(replacement: &Replacement) -> Option<String> {
    let cidrs = |rules: &[ObservedRule]| {
        rules
            .iter()
            .map(|r| r.cidr.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut parts = Vec::new();
    if !replacement.removed.is_empty() {
        parts.push(format!("removed stale {}", cidrs(&replacement.removed)));
    }
    if !replacement.left_behind.is_empty() {
        parts.push(format!("stale rule left behind: {}", cidrs(&replacement.left_behind)));
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_compare_by_value() {
        let event = EngineEvent::RuleReconciled {
            rule_id: 1,
            label: "ssh-admin".to_string(),
            state: RuleState::Matched,
            remote_handle: Some(RemoteHandle::new("lh-00")),
        };
        assert_eq!(event.clone(), event);
        assert_ne!(event, EngineEvent::PassRejected);
    }
}
