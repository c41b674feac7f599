// # Tencent Cloud Firewall Provider
//
// Manages Lighthouse instance firewall rules through the Tencent Cloud API
// 3.0 (signed JSON over HTTPS).
//
// ## Scope
//
// - Lighthouse (`lhins-...`): get instance, list (paginated), create, delete by spec
// - CVM (`ins-...`): get instance only. CVM firewalls are security groups;
//   every firewall operation reports a permanent "not implemented" error.
//
// Lighthouse has no update primitive and returns no rule id, so this
// provider relies on the default `update_firewall_rule` (create the new
// rule, then delete the old one) and derives handles from rule content in
// the `lh` namespace.
//
// ## Constraints
//
// - One HTTP request per API call; no retries, no caching
// - Secret key never appears in logs or `Debug` output
//
// ## API Reference
//
// - DescribeFirewallRules / CreateFirewallRules / DeleteFirewallRules /
//   DescribeInstances on `lighthouse.tencentcloudapi.com`, version 2020-03-24
// - DescribeInstances on `cvm.tencentcloudapi.com`, version 2017-03-12

pub mod api;
pub mod sign;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use fireflow_core::identity::remote_handle;
use fireflow_core::model::{
    CloudCredentials, DesiredRule, InstanceInfo, ObservedRule, Protocol, RuleAction,
};
use fireflow_core::traits::{FirewallProvider, FirewallProviderFactory};
use fireflow_core::{Error, ProviderRegistry, Result};

use api::{ApiError, FirewallRule};

/// Name rules use to select this provider
pub const PROVIDER_NAME: &str = "TencentCloud";

/// Namespace of the content-derived remote handles
pub const HANDLE_NAMESPACE: &str = "lh";

/// Region used when the credential record names none
pub const DEFAULT_REGION: &str = "ap-beijing";

const LIGHTHOUSE_ENDPOINT: &str = "https://lighthouse.tencentcloudapi.com";
const CVM_ENDPOINT: &str = "https://cvm.tencentcloudapi.com";

/// Default HTTP timeout for API requests
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const CVM_NOT_IMPLEMENTED: &str = "CVM firewall rule management not implemented";

/// Tencent Cloud API product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    Lighthouse,
    Cvm,
}

impl Service {
    fn name(&self) -> &'static str {
        match self {
            Service::Lighthouse => "lighthouse",
            Service::Cvm => "cvm",
        }
    }

    fn version(&self) -> &'static str {
        match self {
            Service::Lighthouse => "2020-03-24",
            Service::Cvm => "2017-03-12",
        }
    }
}

/// Base URLs of the two products
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub lighthouse: String,
    pub cvm: String,
}

impl Endpoints {
    /// Send every product to one base URL (local mocks, private gateways)
    pub fn single(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            lighthouse: base_url.clone(),
            cvm: base_url,
        }
    }

    fn for_service(&self, service: Service) -> &str {
        match service {
            Service::Lighthouse => &self.lighthouse,
            Service::Cvm => &self.cvm,
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            lighthouse: LIGHTHOUSE_ENDPOINT.to_string(),
            cvm: CVM_ENDPOINT.to_string(),
        }
    }
}

/// Whether an instance id names a CVM instance
pub fn is_cvm_instance(instance_id: &str) -> bool {
    instance_id.starts_with("ins-")
}

/// Tencent Cloud firewall provider bound to one credential set
pub struct TencentProvider {
    secret_id: String,
    secret_key: String,
    region: String,
    endpoints: Endpoints,
    client: reqwest::Client,
}

// Custom Debug implementation that hides the secret key
impl std::fmt::Debug for TencentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TencentProvider")
            .field("secret_id", &fireflow_core::model::mask_secret(&self.secret_id))
            .field("secret_key", &"<REDACTED>")
            .field("region", &self.region)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl TencentProvider {
    /// Create a provider against the public endpoints
    pub fn new(credentials: &CloudCredentials) -> Result<Self> {
        Self::with_endpoints(credentials, Endpoints::default(), DEFAULT_HTTP_TIMEOUT)
    }

    /// Create a provider with explicit endpoints and HTTP timeout
    pub fn with_endpoints(
        credentials: &CloudCredentials,
        endpoints: Endpoints,
        timeout: Duration,
    ) -> Result<Self> {
        if credentials.secret_id.trim().is_empty() || credentials.secret_key.trim().is_empty() {
            return Err(Error::permanent(
                PROVIDER_NAME,
                "secret id and secret key are required",
            ));
        }

        let region = credentials
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::permanent(PROVIDER_NAME, format!("failed to build HTTP client: {}", e)))?;

        tracing::debug!(
            "Tencent Cloud client for {} in {}",
            credentials.masked_secret_id(),
            region
        );

        Ok(Self {
            secret_id: credentials.secret_id.clone(),
            secret_key: credentials.secret_key.clone(),
            region,
            endpoints,
            client,
        })
    }

    /// Region requests are sent to
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Issue one signed API call and unwrap `Response`
    async fn call<Req, Resp>(&self, service: Service, action: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        match self.call_raw(service, action, request).await? {
            Ok(response) => Ok(response),
            Err(api_error) => Err(api_error.classify(PROVIDER_NAME)),
        }
    }

    /// Like [`Self::call`], but hands vendor errors back unclassified
    async fn call_raw<Req, Resp>(
        &self,
        service: Service,
        action: &str,
        request: &Req,
    ) -> Result<std::result::Result<Resp, ApiError>>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let endpoint = self.endpoints.for_service(service);
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::config(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(Error::config(format!("endpoint has no host: {}", endpoint))),
        };

        let payload = serde_json::to_string(request)?;
        let timestamp = Utc::now();
        let authorization = sign::authorization(
            &self.secret_id,
            &self.secret_key,
            &sign::SigningRequest {
                service: service.name(),
                host: &host,
                action,
                payload: &payload,
                timestamp,
            },
        )?;

        tracing::debug!("{} {} ({})", service.name(), action, self.region);

        let response = self
            .client
            .post(url)
            .header("Authorization", authorization)
            .header("Content-Type", sign::CONTENT_TYPE)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.timestamp().to_string())
            .header("X-TC-Version", service.version())
            .header("X-TC-Region", &self.region)
            .body(payload)
            .send()
            .await
            .map_err(|e| Error::transient(PROVIDER_NAME, format!("{} request failed: {}", action, e)))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Error::transient(PROVIDER_NAME, format!("failed to read {} response: {}", action, e))
        })?;

        let parsed: Option<serde_json::Value> = serde_json::from_str(&body).ok();
        let envelope = parsed.as_ref().and_then(|v| v.get("Response"));

        if let Some(error) = envelope.and_then(|r| r.get("Error")) {
            let api_error: ApiError = serde_json::from_value(error.clone()).map_err(|e| {
                Error::permanent(PROVIDER_NAME, format!("malformed {} error: {}", action, e))
            })?;
            tracing::debug!("{} failed: {} ({})", action, api_error.code, api_error.message);
            return Ok(Err(api_error));
        }

        if !status.is_success() {
            return Err(api::classify_status(PROVIDER_NAME, status.as_u16(), &body));
        }

        let envelope = envelope.ok_or_else(|| {
            Error::permanent(PROVIDER_NAME, format!("{} response has no Response object", action))
        })?;

        serde_json::from_value(envelope.clone())
            .map(Ok)
            .map_err(|e| Error::permanent(PROVIDER_NAME, format!("malformed {} response: {}", action, e)))
    }

    async fn get_lighthouse_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        let response: api::LighthouseInstancesResponse = self
            .call(
                Service::Lighthouse,
                "DescribeInstances",
                &api::DescribeInstancesRequest {
                    instance_ids: vec![instance_id],
                },
            )
            .await?;

        let instance = response
            .instance_set
            .into_iter()
            .next()
            .ok_or_else(|| Error::instance_not_found(format!("lighthouse instance {}", instance_id)))?;

        Ok(InstanceInfo {
            instance_id: instance.instance_id,
            name: instance.instance_name,
            status: instance.instance_state,
            public_address: instance.public_addresses.into_iter().next(),
            private_address: instance.private_addresses.into_iter().next(),
            provider: PROVIDER_NAME.to_string(),
            region: self.region.clone(),
        })
    }

    async fn get_cvm_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        let response: api::CvmInstancesResponse = self
            .call(
                Service::Cvm,
                "DescribeInstances",
                &api::DescribeInstancesRequest {
                    instance_ids: vec![instance_id],
                },
            )
            .await?;

        let instance = response
            .instance_set
            .into_iter()
            .next()
            .ok_or_else(|| Error::instance_not_found(format!("CVM instance {}", instance_id)))?;

        Ok(InstanceInfo {
            instance_id: instance.instance_id,
            name: instance.instance_name,
            status: instance.instance_state,
            public_address: instance.public_ip_addresses.into_iter().next(),
            private_address: instance.private_ip_addresses.into_iter().next(),
            provider: PROVIDER_NAME.to_string(),
            region: self.region.clone(),
        })
    }

    fn reject_cvm(&self, instance_id: &str) -> Result<()> {
        if is_cvm_instance(instance_id) {
            return Err(Error::permanent(PROVIDER_NAME, CVM_NOT_IMPLEMENTED));
        }
        Ok(())
    }
}

/// Convert a Lighthouse rule into an observed rule
///
/// Rules FireFlow cannot represent (IPv6-only, unknown protocols) are
/// dropped so the label matcher never picks them as a counterpart.
fn observe(rule: FirewallRule) -> Option<ObservedRule> {
    if rule.cidr_block.trim().is_empty() {
        return None;
    }
    let protocol: Protocol = rule.protocol.parse().ok()?;
    let action: RuleAction = rule.action.parse().unwrap_or_default();
    let port = if rule.port.trim().is_empty() {
        fireflow_core::model::ALL_PORTS.to_string()
    } else {
        rule.port.trim().to_string()
    };

    Some(ObservedRule {
        handle: remote_handle(HANDLE_NAMESPACE, protocol, &port, &rule.cidr_block, action),
        protocol,
        port,
        cidr: rule.cidr_block,
        action,
        label: rule.firewall_rule_description,
    })
}

fn wire_rule(protocol: Protocol, port: &str, cidr: &str, action: RuleAction, label: &str) -> FirewallRule {
    FirewallRule {
        protocol: protocol.as_str().to_string(),
        port: port.to_string(),
        cidr_block: cidr.to_string(),
        action: action.as_str().to_string(),
        firewall_rule_description: label.to_string(),
    }
}

#[async_trait]
impl FirewallProvider for TencentProvider {
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        if is_cvm_instance(instance_id) {
            self.get_cvm_instance(instance_id).await
        } else {
            self.get_lighthouse_instance(instance_id).await
        }
    }

    async fn list_firewall_rules(&self, instance_id: &str) -> Result<Vec<ObservedRule>> {
        self.reject_cvm(instance_id)?;

        let mut rules = Vec::new();
        let mut offset = 0u32;

        loop {
            let page: api::DescribeFirewallRulesResponse = self
                .call(
                    Service::Lighthouse,
                    "DescribeFirewallRules",
                    &api::DescribeFirewallRulesRequest {
                        instance_id,
                        offset,
                        limit: api::FIREWALL_PAGE_LIMIT,
                    },
                )
                .await?;

            let fetched = page.firewall_rule_set.len() as u32;
            rules.extend(page.firewall_rule_set.into_iter().filter_map(observe));
            offset += fetched;

            if fetched < api::FIREWALL_PAGE_LIMIT || u64::from(offset) >= page.total_count {
                break;
            }
        }

        tracing::debug!("Lighthouse {} has {} firewall rule(s)", instance_id, rules.len());
        Ok(rules)
    }

    async fn create_firewall_rule(
        &self,
        instance_id: &str,
        desired: &DesiredRule,
    ) -> Result<ObservedRule> {
        self.reject_cvm(instance_id)?;

        let rule = wire_rule(
            desired.protocol,
            &desired.port,
            &desired.cidr,
            desired.action,
            &desired.label,
        );
        let request = api::ModifyFirewallRulesRequest {
            instance_id,
            firewall_rules: vec![rule.clone()],
        };

        match self
            .call_raw::<_, api::EmptyResponse>(Service::Lighthouse, "CreateFirewallRules", &request)
            .await?
        {
            Ok(response) => {
                tracing::info!(
                    "Created Lighthouse rule on {}: {} {} {} ({}) [request {}]",
                    instance_id,
                    desired.protocol,
                    desired.port,
                    desired.cidr,
                    desired.label,
                    response.request_id
                );
            }
            Err(api_error) if api_error.is_rule_exists() => {
                tracing::info!(
                    "Lighthouse rule on {} already exists: {} {} {} ({})",
                    instance_id,
                    desired.protocol,
                    desired.port,
                    desired.cidr,
                    desired.label
                );
            }
            Err(api_error) => return Err(api_error.classify(PROVIDER_NAME)),
        }

        observe(rule).ok_or_else(|| {
            Error::permanent(PROVIDER_NAME, format!("cannot represent created rule for {}", instance_id))
        })
    }

    async fn delete_firewall_rule_by_spec(
        &self,
        instance_id: &str,
        rule: &ObservedRule,
    ) -> Result<()> {
        self.reject_cvm(instance_id)?;

        let _: api::EmptyResponse = self
            .call(
                Service::Lighthouse,
                "DeleteFirewallRules",
                &api::ModifyFirewallRulesRequest {
                    instance_id,
                    firewall_rules: vec![wire_rule(
                        rule.protocol,
                        &rule.port,
                        &rule.cidr,
                        rule.action,
                        &rule.label,
                    )],
                },
            )
            .await?;

        tracing::info!(
            "Deleted Lighthouse rule on {}: {} {} {} ({})",
            instance_id,
            rule.protocol,
            rule.port,
            rule.cidr,
            rule.label
        );
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

/// Factory for creating Tencent Cloud providers
#[derive(Debug, Clone, Default)]
pub struct TencentFactory {
    endpoints: Endpoints,
    timeout: Option<Duration>,
}

impl TencentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build clients against non-default endpoints
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Override the HTTP timeout of built clients
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl FirewallProviderFactory for TencentFactory {
    fn create(&self, credentials: &CloudCredentials) -> Result<Box<dyn FirewallProvider>> {
        let provider = TencentProvider::with_endpoints(
            credentials,
            self.endpoints.clone(),
            self.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT),
        )?;
        Ok(Box::new(provider))
    }
}

/// Register the Tencent Cloud provider with a registry
///
/// # Example
///
/// ```rust
/// use fireflow_core::ProviderRegistry;
///
/// let registry = ProviderRegistry::new();
/// fireflow_provider_tencent::register(&registry);
/// assert!(registry.has_provider("TencentCloud"));
/// ```
pub fn register(registry: &ProviderRegistry) {
    registry.register_provider(PROVIDER_NAME, Box::new(TencentFactory::new()));
}

/// Register the Tencent Cloud provider with a per-request HTTP timeout
pub fn register_with_timeout(registry: &ProviderRegistry, timeout: Duration) {
    registry.register_provider(
        PROVIDER_NAME,
        Box::new(TencentFactory::new().with_timeout(timeout)),
    );
}
