//! Administrative service
//!
//! The boundary an HTTP layer (or any other front end) calls into. It owns
//! no state of its own beyond the engine, scheduler, repository and config
//! source it is wired with.

use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{
    DEFAULT_SCHEDULE_INTERVAL_MINUTES, keys, validate_interval_minutes,
};
use crate::engine::{PassReport, ReconciliationEngine, RuleOutcome};
use crate::error::Result;
use crate::model::{InstanceInfo, ObservedRule, Rule};
use crate::scheduler::PassScheduler;
use crate::traits::{ConfigSource, RuleRepository};

/// Synchronous answer to "run a pass now"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub address: Ipv4Addr,
    /// Rules CREATED or REPLACED
    pub touched: usize,
    pub outcomes: Vec<RuleOutcome>,
    pub summary: String,
}

impl From<PassReport> for RunSummary {
    fn from(report: PassReport) -> Self {
        Self {
            address: report.address,
            touched: report.touched(),
            summary: report.summary(),
            outcomes: report.outcomes,
        }
    }
}

/// Schedule settings as stored in the config source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleState {
    pub enabled: bool,
    pub interval_minutes: u32,
    /// Whether a trigger is actually installed right now
    pub active: bool,
}

/// Administrative operations over a running FireFlow instance
pub struct AdminService {
    engine: Arc<ReconciliationEngine>,
    scheduler: Arc<PassScheduler>,
    repository: Arc<dyn RuleRepository>,
    config_source: Arc<dyn ConfigSource>,
}

impl AdminService {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        scheduler: Arc<PassScheduler>,
        repository: Arc<dyn RuleRepository>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            repository,
            config_source,
        }
    }

    /// Run a full pass now
    ///
    /// Fails only when the pass as a whole could not run (address
    /// resolution, rule listing, or a pass already in flight).
    pub async fn run_now(&self) -> Result<RunSummary> {
        let report = self.engine.run_pass().await?;
        Ok(report.into())
    }

    /// Reconcile a single rule now
    pub async fn execute_rule(&self, rule_id: u64) -> Result<RunSummary> {
        let report = self.engine.execute_rule(rule_id).await?;
        Ok(report.into())
    }

    /// Change the schedule and persist it
    ///
    /// Enabling validates `interval_minutes` (1..=1440). Disabling keeps the
    /// stored interval untouched when `interval_minutes` is out of range.
    pub async fn reconfigure_schedule(&self, interval_minutes: u32, enabled: bool) -> Result<()> {
        if enabled {
            validate_interval_minutes(interval_minutes)?;
            self.config_source
                .set_string(keys::SCHEDULE_INTERVAL_MINUTES, &interval_minutes.to_string())
                .await?;
            self.config_source
                .set_string(keys::SCHEDULE_ENABLED, "true")
                .await?;
            self.scheduler.configure(interval_minutes)?;
        } else {
            if validate_interval_minutes(interval_minutes).is_ok() {
                self.config_source
                    .set_string(keys::SCHEDULE_INTERVAL_MINUTES, &interval_minutes.to_string())
                    .await?;
            }
            self.config_source
                .set_string(keys::SCHEDULE_ENABLED, "false")
                .await?;
            self.scheduler.disable();
        }
        Ok(())
    }

    pub fn is_schedule_active(&self) -> bool {
        self.scheduler.is_active()
    }

    /// Stored schedule settings, with defaults for absent keys
    pub async fn schedule_state(&self) -> ScheduleState {
        let (enabled, interval_minutes) = self.stored_schedule().await;
        ScheduleState {
            enabled,
            interval_minutes,
            active: self.scheduler.is_active(),
        }
    }

    /// Install the trigger from stored settings (boot time)
    ///
    /// Returns whether the schedule was enabled.
    pub async fn restore_schedule(&self) -> Result<bool> {
        let (enabled, interval_minutes) = self.stored_schedule().await;
        if !enabled {
            info!("Schedule disabled; passes run only on demand");
            self.scheduler.disable();
            return Ok(false);
        }
        self.scheduler.configure(interval_minutes)?;
        Ok(true)
    }

    /// Query the configured address source
    pub async fn current_address(&self) -> Result<Ipv4Addr> {
        self.engine.resolve_address().await
    }

    /// Normalize, validate and store a new rule
    pub async fn create_rule(&self, mut rule: Rule) -> Result<Rule> {
        rule.normalize();
        rule.validate()?;
        rule.id = 0;
        rule.last_applied_address = None;
        rule.remote_handle = None;

        let stored = self.repository.insert_rule(rule).await?;
        info!(
            "Created rule {} ({} {} {} on {})",
            stored.id, stored.label, stored.protocol, stored.port, stored.instance_id
        );
        Ok(stored)
    }

    /// Every stored rule, enabled or not, in id order
    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        let mut rules = self.repository.list_rules().await?;
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }

    /// Normalize, validate and store an edited rule
    ///
    /// The stored handle and last-applied address are kept unless the edit
    /// moves the rule to another remote counterpart (provider, credentials,
    /// instance, protocol, port or label). Then the old counterpart is
    /// removed best effort and the rule is created afresh on the next pass.
    pub async fn update_rule(&self, mut rule: Rule) -> Result<Rule> {
        rule.normalize();
        rule.validate()?;
        let existing = self.repository.get_rule_by_id(rule.id).await?;

        if moves_counterpart(&existing, &rule) {
            match self.engine.retire_rule(&existing).await {
                Ok(true) => info!("Removed old remote rule for edited rule {}", rule.id),
                Ok(false) => {}
                Err(e) => warn!(
                    "Could not remove old remote rule for edited rule {} on {}: {}",
                    rule.id, existing.instance_id, e
                ),
            }
            rule.remote_handle = None;
            rule.last_applied_address = None;
        } else {
            rule.remote_handle = existing.remote_handle.clone();
            rule.last_applied_address = existing.last_applied_address;
        }

        self.repository.update_rule(&rule).await?;
        info!(
            "Updated rule {} ({} {} {} on {})",
            rule.id, rule.label, rule.protocol, rule.port, rule.instance_id
        );
        Ok(rule)
    }

    /// Delete a rule, removing its remote counterpart on a best-effort basis
    pub async fn delete_rule(&self, rule_id: u64) -> Result<()> {
        let rule = self.repository.get_rule_by_id(rule_id).await?;

        match self.engine.retire_rule(&rule).await {
            Ok(true) => {}
            Ok(false) => info!("Rule {} had no remote counterpart", rule_id),
            Err(e) => warn!(
                "Could not remove remote rule for rule {} on {}: {}",
                rule_id, rule.instance_id, e
            ),
        }

        self.repository.delete_rule(rule_id).await?;
        info!("Deleted rule {}", rule_id);
        Ok(())
    }

    /// Instance details (credential testing, diagnostics)
    pub async fn instance_info(
        &self,
        provider: &str,
        instance_id: &str,
        cloud_config_id: Option<u64>,
    ) -> Result<InstanceInfo> {
        let client = self.engine.provider_for(provider, cloud_config_id).await?;
        self.engine
            .call(client.provider_name(), client.get_instance(instance_id))
            .await
    }

    /// Rules currently present at the provider for an instance
    pub async fn remote_rules(
        &self,
        provider: &str,
        instance_id: &str,
        cloud_config_id: Option<u64>,
    ) -> Result<Vec<ObservedRule>> {
        let client = self.engine.provider_for(provider, cloud_config_id).await?;
        self.engine
            .call(client.provider_name(), client.list_firewall_rules(instance_id))
            .await
    }

    pub async fn enabled_rule_count(&self) -> Result<usize> {
        Ok(self.repository.list_enabled_rules().await?.len())
    }

    async fn stored_schedule(&self) -> (bool, u32) {
        let enabled = match self.config_source.get_string(keys::SCHEDULE_ENABLED).await {
            Ok(Some(value)) => parse_flag(&value),
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to read {}: {}", keys::SCHEDULE_ENABLED, e);
                false
            }
        };

        let interval_minutes = match self
            .config_source
            .get_string(keys::SCHEDULE_INTERVAL_MINUTES)
            .await
        {
            Ok(Some(value)) => value
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|m| validate_interval_minutes(*m).is_ok())
                .unwrap_or_else(|| {
                    warn!(
                        "Ignoring invalid {}={:?}, using {}",
                        keys::SCHEDULE_INTERVAL_MINUTES,
                        value,
                        DEFAULT_SCHEDULE_INTERVAL_MINUTES
                    );
                    DEFAULT_SCHEDULE_INTERVAL_MINUTES
                }),
            Ok(None) => DEFAULT_SCHEDULE_INTERVAL_MINUTES,
            Err(e) => {
                warn!("Failed to read {}: {}", keys::SCHEDULE_INTERVAL_MINUTES, e);
                DEFAULT_SCHEDULE_INTERVAL_MINUTES
            }
        };

        (enabled, interval_minutes)
    }
}

fn moves_counterpart(before: &Rule, after: &Rule) -> bool {
    before.provider != after.provider
        || before.cloud_config_id != after.cloud_config_id
        || before.instance_id != after.instance_id
        || before.protocol != after.protocol
        || before.effective_port() != after.effective_port()
        || before.label != after.label
}

/// "true"/"1"/"yes"/"on", case-insensitive
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
