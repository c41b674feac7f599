//! Content-based rule identity
//!
//! Firewall APIs such as Lighthouse do not hand back a durable id for a
//! rule, so FireFlow names remote rules by their content:
//!
//! - a **remote handle** is a digest over `(protocol, port, cidr, action)`.
//!   It names one concrete version of a remote rule; when the cidr moves,
//!   the handle moves with it.
//! - a **match key** is `(protocol, port, label)`. It is what stays the
//!   same across address changes and is used by [`LabelMatcher`] to find
//!   the remote counterpart of a local rule.
//!
//! Providers that do have stable ids can plug in [`HandleMatcher`] (or their
//! own [`RuleMatcher`]) and skip content matching altogether.

use crate::model::{DesiredRule, ObservedRule, Protocol, RemoteHandle, RuleAction};
use sha2::{Digest, Sha256};

/// 128-bit content digest of a remote rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleIdentity([u8; 16]);

impl RuleIdentity {
    /// Digest the identity tuple
    ///
    /// The encoding is fixed so handles survive process restarts.
    pub fn compute(protocol: Protocol, port: &str, cidr: &str, action: RuleAction) -> Self {
        let content = format!(
            "{}-{}-{}-{}",
            protocol.as_str(),
            port.trim(),
            cidr.trim(),
            action.as_str()
        );
        let digest = Sha256::digest(content.as_bytes());
        let mut truncated = [0u8; 16];
        truncated.copy_from_slice(&digest[..16]);
        Self(truncated)
    }

    /// Identity of a desired rule
    pub fn of_desired(desired: &DesiredRule) -> Self {
        Self::compute(desired.protocol, &desired.port, &desired.cidr, desired.action)
    }

    /// Render as `<namespace>-<32 hex chars>`
    pub fn render(&self, namespace: &str) -> RemoteHandle {
        RemoteHandle::new(format!("{}-{}", namespace, hex::encode(self.0)))
    }
}

/// Convenience: the handle a provider in `namespace` assigns to this content
pub fn remote_handle(
    namespace: &str,
    protocol: Protocol,
    port: &str,
    cidr: &str,
    action: RuleAction,
) -> RemoteHandle {
    RuleIdentity::compute(protocol, port, cidr, action).render(namespace)
}

/// Finds the remote counterpart of a desired rule among observed rules
pub trait RuleMatcher: Send + Sync {
    /// Return the observed rule that represents `desired`, if any
    ///
    /// `prior` is the handle last persisted for the local rule.
    fn find<'a>(
        &self,
        desired: &DesiredRule,
        prior: Option<&RemoteHandle>,
        observed: &'a [ObservedRule],
    ) -> Option<&'a ObservedRule>;

    /// Other observed rules that stand for the same local rule as `kept`
    ///
    /// These are leftovers of an earlier replace whose delete failed.
    fn duplicates<'a>(
        &self,
        _desired: &DesiredRule,
        _kept: &ObservedRule,
        _observed: &'a [ObservedRule],
    ) -> Vec<&'a ObservedRule> {
        Vec::new()
    }
}

/// Matches on protocol, port and label; the cidr is free to differ
///
/// When several remote rules share the match key, the one already allowing
/// the desired cidr wins, then the one carrying the prior handle, then the
/// first listed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelMatcher;

impl LabelMatcher {
    fn same_key(desired: &DesiredRule, rule: &ObservedRule) -> bool {
        rule.protocol == desired.protocol
            && rule.port.trim() == desired.port.trim()
            && rule.label == desired.label
    }
}

impl RuleMatcher for LabelMatcher {
    fn find<'a>(
        &self,
        desired: &DesiredRule,
        prior: Option<&RemoteHandle>,
        observed: &'a [ObservedRule],
    ) -> Option<&'a ObservedRule> {
        let candidates: Vec<&ObservedRule> = observed
            .iter()
            .filter(|rule| Self::same_key(desired, rule))
            .collect();

        candidates
            .iter()
            .find(|rule| rule.cidr == desired.cidr)
            .or_else(|| {
                let prior = prior?;
                candidates.iter().find(|rule| &rule.handle == prior)
            })
            .or_else(|| candidates.first())
            .copied()
    }

    fn duplicates<'a>(
        &self,
        desired: &DesiredRule,
        kept: &ObservedRule,
        observed: &'a [ObservedRule],
    ) -> Vec<&'a ObservedRule> {
        observed
            .iter()
            .filter(|rule| Self::same_key(desired, rule) && rule.handle != kept.handle)
            .collect()
    }
}

/// Matches purely on the persisted handle
#[derive(Debug, Clone, Copy, Default)]
pub struct HandleMatcher;

impl RuleMatcher for HandleMatcher {
    fn find<'a>(
        &self,
        _desired: &DesiredRule,
        prior: Option<&RemoteHandle>,
        observed: &'a [ObservedRule],
    ) -> Option<&'a ObservedRule> {
        let prior = prior?;
        observed.iter().find(|rule| &rule.handle == prior)
    }
}
