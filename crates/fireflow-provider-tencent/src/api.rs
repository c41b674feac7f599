//! Wire types for the Lighthouse (2020-03-24) and CVM (2017-03-12) APIs
//!
//! Only the fields FireFlow reads or writes are modelled. Responses arrive
//! wrapped as `{"Response": {...}}`; failures carry `Response.Error`.

use serde::{Deserialize, Serialize};

use fireflow_core::Error;

/// Page size for DescribeFirewallRules (the API maximum)
pub const FIREWALL_PAGE_LIMIT: u32 = 100;

/// Firewall rule as sent to and returned by Lighthouse
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FirewallRule {
    pub protocol: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub cidr_block: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub firewall_rule_description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeFirewallRulesRequest<'a> {
    pub instance_id: &'a str,
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeFirewallRulesResponse {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub firewall_rule_set: Vec<FirewallRule>,
}

/// Body of CreateFirewallRules and DeleteFirewallRules
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyFirewallRulesRequest<'a> {
    pub instance_id: &'a str,
    pub firewall_rules: Vec<FirewallRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmptyResponse {
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstancesRequest<'a> {
    pub instance_ids: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LighthouseInstancesResponse {
    #[serde(default)]
    pub instance_set: Vec<LighthouseInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LighthouseInstance {
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub instance_state: String,
    #[serde(default)]
    pub public_addresses: Vec<String>,
    #[serde(default)]
    pub private_addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CvmInstancesResponse {
    #[serde(default)]
    pub instance_set: Vec<CvmInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CvmInstance {
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub instance_state: String,
    #[serde(default)]
    pub public_ip_addresses: Vec<String>,
    #[serde(default)]
    pub private_ip_addresses: Vec<String>,
}

/// `Response.Error`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    /// Creating a rule that already exists
    pub fn is_rule_exists(&self) -> bool {
        self.code.ends_with("FirewallRulesExist")
    }

    /// Map a vendor error code onto the FireFlow taxonomy
    ///
    /// - throttling, internal errors and unavailable resources are transient
    /// - missing firewall rules are [`Error::RuleNotFound`], other missing
    ///   resources [`Error::InstanceNotFound`]
    /// - authentication failures and everything else are permanent
    pub fn classify(&self, provider: &str) -> Error {
        let detail = format!("{}: {}", self.code, self.message);
        let code = self.code.as_str();

        if code.starts_with("RequestLimitExceeded")
            || code.starts_with("InternalError")
            || code.starts_with("ResourceUnavailable")
        {
            return Error::transient(provider, detail);
        }

        if code.ends_with("FirewallRulesNotExist") || code.ends_with("FirewallRuleNotFound") {
            return Error::rule_not_found(detail);
        }

        if code.starts_with("ResourceNotFound") || code == "InvalidInstanceId.NotFound" {
            return Error::instance_not_found(detail);
        }

        Error::permanent(provider, detail)
    }
}

/// Classify a non-2xx HTTP answer that carried no API error body
pub fn classify_status(provider: &str, status: u16, body: &str) -> Error {
    let snippet: String = body.chars().take(200).collect();
    match status {
        429 | 500..=599 => Error::transient(provider, format!("HTTP {}: {}", status, snippet)),
        401 | 403 => Error::permanent(provider, format!("authentication rejected (HTTP {})", status)),
        _ => Error::permanent(provider, format!("HTTP {}: {}", status, snippet)),
    }
}
