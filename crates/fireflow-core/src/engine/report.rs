//! Per-rule outcomes and pass reports

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

use crate::model::RemoteHandle;

/// Terminal state of one rule in one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleState {
    /// Remote state already matched; no mutation
    Matched,
    /// A new remote rule was created
    Created,
    /// The remote rule was replaced with one for the new address
    Replaced,
    /// Disabled or unlabelled; never sent to the provider
    Skipped,
    /// The provider or repository call failed; local state untouched
    Failed,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Matched => "MATCHED",
            RuleState::Created => "CREATED",
            RuleState::Replaced => "REPLACED",
            RuleState::Skipped => "SKIPPED",
            RuleState::Failed => "FAILED",
        }
    }

    /// Whether the remote firewall was mutated
    pub fn is_touched(&self) -> bool {
        matches!(self, RuleState::Created | RuleState::Replaced)
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of reconciling one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleOutcome {
    pub rule_id: u64,
    pub label: String,
    pub instance_id: String,
    pub state: RuleState,
    /// Handle of the remote rule after the pass (MATCHED/CREATED/REPLACED)
    pub remote_handle: Option<RemoteHandle>,
    /// Error message for FAILED, reason for SKIPPED, stale-rule cleanup
    /// for MATCHED/REPLACED
    pub detail: Option<String>,
}

impl RuleOutcome {
    pub(crate) fn applied(
        rule: &crate::model::Rule,
        state: RuleState,
        handle: RemoteHandle,
    ) -> Self {
        Self {
            rule_id: rule.id,
            label: rule.label.clone(),
            instance_id: rule.instance_id.clone(),
            state,
            remote_handle: Some(handle),
            detail: None,
        }
    }

    pub(crate) fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }

    pub(crate) fn skipped(rule: &crate::model::Rule, reason: &str) -> Self {
        Self {
            rule_id: rule.id,
            label: rule.label.clone(),
            instance_id: rule.instance_id.clone(),
            state: RuleState::Skipped,
            remote_handle: None,
            detail: Some(reason.to_string()),
        }
    }

    pub(crate) fn failed(rule: &crate::model::Rule, error: &crate::Error) -> Self {
        Self {
            rule_id: rule.id,
            label: rule.label.clone(),
            instance_id: rule.instance_id.clone(),
            state: RuleState::Failed,
            remote_handle: None,
            detail: Some(error.to_string()),
        }
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Address every rule was reconciled against
    pub address: Ipv4Addr,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per rule, in ascending rule id order
    pub outcomes: Vec<RuleOutcome>,
}

impl PassReport {
    /// Rules whose remote state was mutated (CREATED or REPLACED)
    pub fn touched(&self) -> usize {
        self.outcomes.iter().filter(|o| o.state.is_touched()).count()
    }

    pub fn failed(&self) -> usize {
        self.count(RuleState::Failed)
    }

    pub fn count(&self, state: RuleState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    /// Outcome for a rule id
    pub fn outcome(&self, rule_id: u64) -> Option<&RuleOutcome> {
        self.outcomes.iter().find(|o| o.rule_id == rule_id)
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        let mut line = format!(
            "address {}: {} rule(s), {} created, {} replaced, {} matched, {} skipped, {} failed",
            self.address,
            self.outcomes.len(),
            self.count(RuleState::Created),
            self.count(RuleState::Replaced),
            self.count(RuleState::Matched),
            self.count(RuleState::Skipped),
            self.failed(),
        );

        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter(|o| o.state == RuleState::Failed)
            .map(|o| {
                format!(
                    "#{} {}: {}",
                    o.rule_id,
                    o.label,
                    o.detail.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        if !failures.is_empty() {
            line.push_str(" (");
            line.push_str(&failures.join("; "));
            line.push(')');
        }
        line
    }
}
