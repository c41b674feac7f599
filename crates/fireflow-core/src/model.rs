//! Data model shared by the engine, providers and stores
//!
//! A [`Rule`] is owned by the repository. The engine derives a
//! [`DesiredRule`] from it on every pass and compares it against the
//! [`ObservedRule`]s a provider reports for the rule's instance.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Port sentinel used by protocols that have no port
pub const ALL_PORTS: &str = "ALL";

/// Firewall protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    /// Uppercase wire name (`TCP`, `UDP`, `ICMP`, `ALL`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::All => "ALL",
        }
    }

    /// ICMP and ALL rules always cover every port
    pub fn forces_all_ports(&self) -> bool {
        matches!(self, Protocol::Icmp | Protocol::All)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = crate::Error;

    /// Case-insensitive; an empty string means TCP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "ICMP" => Ok(Protocol::Icmp),
            "ALL" => Ok(Protocol::All),
            other => Err(crate::Error::invalid_input(format!(
                "unsupported protocol: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_str().to_string()
    }
}

/// Firewall rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RuleAction {
    #[default]
    Accept,
    Drop,
}

impl RuleAction {
    /// Uppercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Accept => "ACCEPT",
            RuleAction::Drop => "DROP",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(RuleAction::Accept),
            "DROP" => Ok(RuleAction::Drop),
            other => Err(crate::Error::invalid_input(format!(
                "unsupported action: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for RuleAction {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RuleAction> for String {
    fn from(action: RuleAction) -> Self {
        action.as_str().to_string()
    }
}

/// Provider-namespaced name of one concrete remote rule
///
/// See [`crate::identity`] for how handles are derived.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteHandle(String);

impl RemoteHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A locally stored allow-rule
///
/// `last_applied_address` and `remote_handle` are written by the
/// reconciliation engine only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Repository-assigned id
    pub id: u64,

    /// Provider name (e.g. "TencentCloud")
    pub provider: String,

    /// Associated credential record, `None` for the provider's default
    #[serde(default)]
    pub cloud_config_id: Option<u64>,

    /// Target instance id
    pub instance_id: String,

    /// Port or port range ("22", "8000-9000", "ALL")
    #[serde(default)]
    pub port: String,

    #[serde(default)]
    pub protocol: Protocol,

    /// Human-facing label; also the join key against remote state
    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub last_applied_address: Option<Ipv4Addr>,

    #[serde(default)]
    pub remote_handle: Option<RemoteHandle>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Create an enabled rule that has never been applied
    pub fn new(
        id: u64,
        provider: impl Into<String>,
        instance_id: impl Into<String>,
        protocol: Protocol,
        port: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id,
            provider: provider.into(),
            cloud_config_id: None,
            instance_id: instance_id.into(),
            port: port.into(),
            protocol,
            label: label.into(),
            last_applied_address: None,
            remote_handle: None,
            enabled: true,
        }
    }

    /// Associate a credential record
    pub fn with_cloud_config(mut self, cloud_config_id: u64) -> Self {
        self.cloud_config_id = Some(cloud_config_id);
        self
    }

    /// Enable or disable the rule
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set a previously known remote handle
    pub fn with_remote_handle(mut self, handle: RemoteHandle) -> Self {
        self.remote_handle = Some(handle);
        self
    }

    /// Eligible for reconciliation: enabled and labelled
    pub fn is_reconcilable(&self) -> bool {
        self.enabled && !self.label.trim().is_empty()
    }

    /// Known remote handle, ignoring empty placeholders
    pub fn known_handle(&self) -> Option<&RemoteHandle> {
        self.remote_handle.as_ref().filter(|h| !h.is_empty())
    }

    /// Port as it must appear remotely
    pub fn effective_port(&self) -> &str {
        if self.protocol.forces_all_ports() {
            ALL_PORTS
        } else {
            &self.port
        }
    }

    /// Desired remote state for the given public address
    pub fn desired_state(&self, address: Ipv4Addr) -> DesiredRule {
        DesiredRule {
            protocol: self.protocol,
            port: self.effective_port().to_string(),
            cidr: host_cidr(address),
            action: RuleAction::Accept,
            label: self.label.clone(),
        }
    }

    /// Apply creation-time invariants in place
    pub fn normalize(&mut self) {
        self.label = self.label.trim().to_string();
        self.port = self.port.trim().to_string();
        if self.protocol.forces_all_ports() {
            self.port = ALL_PORTS.to_string();
        }
    }

    /// Reject rules that can never be reconciled
    pub fn validate(&self) -> crate::Result<()> {
        if self.label.trim().is_empty() {
            return Err(crate::Error::invalid_input("rule label cannot be empty"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(crate::Error::invalid_input("rule instance id cannot be empty"));
        }
        if self.provider.trim().is_empty() {
            return Err(crate::Error::invalid_input("rule provider cannot be empty"));
        }
        if self.port.is_empty() && !self.protocol.forces_all_ports() {
            return Err(crate::Error::invalid_input(format!(
                "rule port cannot be empty for {}",
                self.protocol
            )));
        }
        Ok(())
    }
}

/// `a.b.c.d/32`
pub fn host_cidr(address: Ipv4Addr) -> String {
    format!("{}/32", address)
}

/// Remote state a rule should have, computed fresh each pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRule {
    pub protocol: Protocol,
    pub port: String,
    pub cidr: String,
    pub action: RuleAction,
    pub label: String,
}

/// A rule as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedRule {
    pub handle: RemoteHandle,
    pub protocol: Protocol,
    pub port: String,
    pub cidr: String,
    pub action: RuleAction,
    pub label: String,
}

/// Instance details used for diagnostics and credential checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub name: String,
    pub status: String,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    pub provider: String,
    pub region: String,
}

/// Credential record for one cloud account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudCredentials {
    /// Repository id, `None` for credentials supplied by configuration
    #[serde(default)]
    pub id: Option<u64>,
    pub provider: String,
    pub secret_id: String,
    pub secret_key: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl CloudCredentials {
    pub fn new(
        provider: impl Into<String>,
        secret_id: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            provider: provider.into(),
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Secret id safe for logs: first and last four characters only
    pub fn masked_secret_id(&self) -> String {
        mask_secret(&self.secret_id)
    }
}

impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret_id", &self.masked_secret_id())
            .field("secret_key", &"<REDACTED>")
            .field("region", &self.region)
            .finish()
    }
}

/// Mask a secret for logging
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}
