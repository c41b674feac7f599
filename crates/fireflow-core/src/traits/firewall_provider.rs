// # Firewall Provider Trait
//
// Defines the interface for managing instance firewall rules through a
// cloud vendor's API.
//
// ## Implementations
//
// - Tencent Cloud Lighthouse: `fireflow-provider-tencent` crate
// - Aliyun: registered as a stub that reports "not implemented"
//
// ## Update semantics
//
// Vendor APIs in scope have no "update rule" primitive and return no
// durable rule id. Updates are built from list/create/delete by
// [`replace_rule`]:
//
// 1. list the instance's current rules
// 2. find the counterpart with `provider.matcher()`
// 3. same cidr already → keep it
// 4. otherwise create the desired rule first, then delete the old one
//    (best effort: a stale permissive rule is preferable to a window with
//    no rule at all)
// 5. stale duplicates of the kept rule (left by an earlier failed delete)
//    are deleted as well
// 6. no counterpart → `Error::RuleNotFound`, the caller falls back to create
//
// Each step runs under its own timeout when one is given. The engine drives
// `replace_rule` directly so a slow delete can never cancel a create that
// already landed.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::identity::{LabelMatcher, RuleMatcher};
use crate::model::{CloudCredentials, DesiredRule, InstanceInfo, ObservedRule, RemoteHandle};
use crate::{Error, Result};

/// Trait for firewall provider implementations
///
/// # Error classification
///
/// Every method must map vendor failures onto:
/// - [`Error::ProviderTransient`]: network failure, throttling, vendor 5xx
/// - [`Error::RuleNotFound`] / [`Error::InstanceNotFound`]: missing resource
/// - [`Error::ProviderPermanent`]: bad credentials, rejected or unsupported request
///
/// # Forbidden
///
/// - retry or backoff (a failed rule is retried on the next pass)
/// - touching the rule repository (owned by the engine)
/// - caching remote state between calls
#[async_trait]
pub trait FirewallProvider: Send + Sync {
    /// Look up an instance
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo>;

    /// Full current remote rule set for an instance
    async fn list_firewall_rules(&self, instance_id: &str) -> Result<Vec<ObservedRule>>;

    /// Add an allow rule; the result carries its derived handle
    async fn create_firewall_rule(
        &self,
        instance_id: &str,
        desired: &DesiredRule,
    ) -> Result<ObservedRule>;

    /// Remove a rule by matching its full spec
    async fn delete_firewall_rule_by_spec(
        &self,
        instance_id: &str,
        rule: &ObservedRule,
    ) -> Result<()>;

    /// Bring the remote counterpart of a rule to the desired state
    ///
    /// Runs [`replace_rule`] without per-step timeouts and returns the rule
    /// that now represents `desired`.
    async fn update_firewall_rule(
        &self,
        instance_id: &str,
        prior_handle: &RemoteHandle,
        desired: &DesiredRule,
    ) -> Result<ObservedRule> {
        let replacement = replace_rule(self, instance_id, Some(prior_handle), desired, None).await?;
        Ok(replacement.rule)
    }

    /// How this provider locates the remote counterpart of a local rule
    fn matcher(&self) -> &dyn RuleMatcher {
        &LabelMatcher
    }

    /// Provider name (for logging and handle namespaces)
    fn provider_name(&self) -> &'static str;
}

/// Builds a provider client from a credential record
///
/// Clients are created per use so several credential sets can coexist.
pub trait FirewallProviderFactory: Send + Sync {
    /// Create a client bound to `credentials`
    fn create(&self, credentials: &CloudCredentials) -> Result<Box<dyn FirewallProvider>>;
}

/// What [`replace_rule`] did to converge on the desired rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    /// Remote rule that now represents the desired rule
    pub rule: ObservedRule,
    /// Whether `rule` was created by this call
    pub created: bool,
    /// Stale counterparts that were deleted
    pub removed: Vec<ObservedRule>,
    /// Stale counterparts whose delete failed
    pub left_behind: Vec<ObservedRule>,
}

impl Replacement {
    /// Whether the remote rule set changed
    pub fn mutated(&self) -> bool {
        self.created || !self.removed.is_empty()
    }
}

/// Converge the remote counterpart of a rule on `desired`
///
/// See the module docs for the algorithm. With `step_timeout` set, the
/// list, the create and every delete are bounded individually; an expired
/// step maps to [`Error::ProviderTransient`]. Failed deletes never fail the
/// call and are reported in [`Replacement::left_behind`].
pub async fn replace_rule<P>(
    provider: &P,
    instance_id: &str,
    prior_handle: Option<&RemoteHandle>,
    desired: &DesiredRule,
    step_timeout: Option<Duration>,
) -> Result<Replacement>
where
    P: FirewallProvider + ?Sized,
{
    let name = provider.provider_name();
    let observed = bounded(name, step_timeout, provider.list_firewall_rules(instance_id)).await?;
    let matcher = provider.matcher();

    let Some(current) = matcher.find(desired, prior_handle, &observed).cloned() else {
        debug!(
            "No remote rule on {} matches protocol={} port={} label={}",
            instance_id, desired.protocol, desired.port, desired.label
        );
        return Err(Error::rule_not_found(format!(
            "protocol={} port={} label={} on {}",
            desired.protocol, desired.port, desired.label, instance_id
        )));
    };

    let (kept, created) = if current.cidr == desired.cidr {
        debug!(
            "Remote rule {} on {} already allows {}",
            current.handle, instance_id, desired.cidr
        );
        (current.clone(), false)
    } else {
        let replacement =
            bounded(name, step_timeout, provider.create_firewall_rule(instance_id, desired)).await?;
        info!(
            "Created replacement {} ({}) on {} for {} ({})",
            replacement.handle, replacement.cidr, instance_id, current.handle, current.cidr
        );
        (replacement, true)
    };

    let mut stale: Vec<ObservedRule> = matcher
        .duplicates(desired, &kept, &observed)
        .into_iter()
        .cloned()
        .collect();
    if created && !stale.iter().any(|r| r.handle == current.handle) {
        stale.insert(0, current);
    }

    let mut removed = Vec::new();
    let mut left_behind = Vec::new();
    for rule in stale {
        match bounded(name, step_timeout, provider.delete_firewall_rule_by_spec(instance_id, &rule)).await {
            Ok(()) => {
                info!("Deleted stale rule {} ({}) on {}", rule.handle, rule.cidr, instance_id);
                removed.push(rule);
            }
            Err(e) => {
                warn!(
                    "Kept {} on {} but failed to delete stale rule {} ({}): {}",
                    kept.handle, instance_id, rule.handle, rule.cidr, e
                );
                left_behind.push(rule);
            }
        }
    }

    Ok(Replacement {
        rule: kept,
        created,
        removed,
        left_behind,
    })
}

/// Run a provider call, bounded by `timeout` when set
pub async fn bounded<T, F>(provider: &str, timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(timeout) = timeout else {
        return fut.await;
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::transient(
            provider,
            format!("call timed out after {:?}", timeout),
        )),
    }
}
