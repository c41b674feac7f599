//! Test doubles and common utilities for contract tests
//!
//! The doubles keep their state behind `Arc`s so a test can hold one handle
//! while the engine owns another.

#![allow(dead_code)]

use async_trait::async_trait;
use fireflow_core::config::FireflowConfig;
use fireflow_core::engine::{EngineEvent, ReconciliationEngine};
use fireflow_core::error::{Error, Result};
use fireflow_core::identity::remote_handle;
use fireflow_core::model::{
    CloudCredentials, DesiredRule, InstanceInfo, ObservedRule, Protocol, Rule,
};
use fireflow_core::registry::ProviderRegistry;
use fireflow_core::store::{MemoryConfigSource, MemoryRuleRepository};
use fireflow_core::traits::{
    AddressSource, ConfigSource, FirewallProvider, FirewallProviderFactory, RuleRepository,
    validate_address,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const PROVIDER: &str = "TencentCloud";
pub const INSTANCE: &str = "lhins-web";
pub const HANDLE_NAMESPACE: &str = "fake";

pub fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn ssh_rule() -> Rule {
    Rule::new(0, PROVIDER, INSTANCE, Protocol::Tcp, "22", "ssh-admin")
}

/// Handle the fake provider assigns to TCP/ACCEPT content
pub fn tcp_handle(port: &str, address: &str) -> fireflow_core::RemoteHandle {
    remote_handle(
        HANDLE_NAMESPACE,
        Protocol::Tcp,
        port,
        &format!("{}/32", address),
        fireflow_core::RuleAction::Accept,
    )
}

// ---------------------------------------------------------------------------
// Address source
// ---------------------------------------------------------------------------

/// Address source whose raw answer the test controls
#[derive(Clone)]
pub struct FakeAddressSource {
    raw: Arc<Mutex<String>>,
    unavailable: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
    resolve_count: Arc<AtomicUsize>,
    last_url: Arc<Mutex<Option<String>>>,
}

impl FakeAddressSource {
    pub fn new(raw: &str) -> Self {
        Self {
            raw: Arc::new(Mutex::new(raw.to_string())),
            unavailable: Arc::new(AtomicBool::new(false)),
            delay: Arc::new(Mutex::new(None)),
            resolve_count: Arc::new(AtomicUsize::new(0)),
            last_url: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_raw(&self, raw: &str) {
        *self.raw.lock().unwrap() = raw.to_string();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolve_count.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<String> {
        self.last_url.lock().unwrap().clone()
    }
}

#[async_trait]
impl AddressSource for FakeAddressSource {
    async fn resolve(&self, source_url: &str) -> Result<Ipv4Addr> {
        self.resolve_count.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock().unwrap() = Some(source_url.to_string());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::address_unavailable("connection refused"));
        }
        let raw = self.raw.lock().unwrap().clone();
        validate_address(&raw)
    }

    fn source_name(&self) -> &'static str {
        "fake"
    }
}

// ---------------------------------------------------------------------------
// Firewall provider
// ---------------------------------------------------------------------------

/// Failure to inject into a provider operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Permanent,
}

impl Failure {
    fn to_error(self, op: &str) -> Error {
        match self {
            Failure::Transient => Error::transient(PROVIDER, format!("{}: throttled", op)),
            Failure::Permanent => Error::permanent(PROVIDER, format!("{}: AuthFailure", op)),
        }
    }
}

#[derive(Default)]
struct CloudState {
    rules: HashMap<String, Vec<ObservedRule>>,
    fail_create: HashMap<String, Failure>,
    fail_list: HashMap<String, Failure>,
    fail_delete: bool,
    create_delay: Option<Duration>,
    delete_delay: Option<Duration>,
    credentials_seen: Vec<String>,
}

/// Shared in-memory "remote" firewall plus call counters
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
    list_calls: Arc<AtomicUsize>,
    create_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules(&self, instance_id: &str) -> Vec<ObservedRule> {
        self.state
            .lock()
            .unwrap()
            .rules
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Put a rule on the remote side behind the engine's back
    pub fn seed(&self, instance_id: &str, rule: ObservedRule) {
        self.state
            .lock()
            .unwrap()
            .rules
            .entry(instance_id.to_string())
            .or_default()
            .push(rule);
    }

    /// Remove every remote rule for an instance (out-of-band deletion)
    pub fn wipe(&self, instance_id: &str) {
        self.state.lock().unwrap().rules.remove(instance_id);
    }

    pub fn fail_create_on(&self, instance_id: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .fail_create
            .insert(instance_id.to_string(), failure);
    }

    pub fn fail_list_on(&self, instance_id: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .fail_list
            .insert(instance_id.to_string(), failure);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_delete = fail;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delete_delay = Some(delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently running mutations seen
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Secret ids of every client the factory built
    pub fn credentials_seen(&self) -> Vec<String> {
        self.state.lock().unwrap().credentials_seen.clone()
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Provider client over a [`FakeCloud`]; inherits the default update
pub struct FakeFirewall {
    cloud: FakeCloud,
}

#[async_trait]
impl FirewallProvider for FakeFirewall {
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo> {
        if instance_id != INSTANCE {
            return Err(Error::instance_not_found(instance_id));
        }
        Ok(InstanceInfo {
            instance_id: instance_id.to_string(),
            name: "web".to_string(),
            status: "RUNNING".to_string(),
            public_address: Some("198.51.100.10".to_string()),
            private_address: Some("10.0.0.2".to_string()),
            provider: PROVIDER.to_string(),
            region: "ap-beijing".to_string(),
        })
    }

    async fn list_firewall_rules(&self, instance_id: &str) -> Result<Vec<ObservedRule>> {
        self.cloud.list_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .cloud
            .state
            .lock()
            .unwrap()
            .fail_list
            .get(instance_id)
            .copied();
        if let Some(failure) = failure {
            return Err(failure.to_error("list"));
        }
        Ok(self.cloud.rules(instance_id))
    }

    async fn create_firewall_rule(
        &self,
        instance_id: &str,
        desired: &DesiredRule,
    ) -> Result<ObservedRule> {
        self.cloud.create_calls.fetch_add(1, Ordering::SeqCst);
        self.cloud.enter();

        let (failure, delay) = {
            let state = self.cloud.state.lock().unwrap();
            (state.fail_create.get(instance_id).copied(), state.create_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = failure {
            self.cloud.leave();
            return Err(failure.to_error("create"));
        }

        let rule = ObservedRule {
            handle: remote_handle(
                HANDLE_NAMESPACE,
                desired.protocol,
                &desired.port,
                &desired.cidr,
                desired.action,
            ),
            protocol: desired.protocol,
            port: desired.port.clone(),
            cidr: desired.cidr.clone(),
            action: desired.action,
            label: desired.label.clone(),
        };
        // Like real firewalls, an identical rule is not added twice
        if !self.cloud.rules(instance_id).contains(&rule) {
            self.cloud.seed(instance_id, rule.clone());
        }
        self.cloud.leave();
        Ok(rule)
    }

    async fn delete_firewall_rule_by_spec(
        &self,
        instance_id: &str,
        rule: &ObservedRule,
    ) -> Result<()> {
        self.cloud.delete_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.cloud.state.lock().unwrap().delete_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.cloud.state.lock().unwrap();
        if state.fail_delete {
            return Err(Error::transient(PROVIDER, "delete: InternalError"));
        }
        if let Some(rules) = state.rules.get_mut(instance_id) {
            rules.retain(|r| r != rule);
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

pub struct FakeFirewallFactory {
    cloud: FakeCloud,
}

impl FakeFirewallFactory {
    pub fn new(cloud: FakeCloud) -> Self {
        Self { cloud }
    }
}

impl FirewallProviderFactory for FakeFirewallFactory {
    fn create(&self, credentials: &CloudCredentials) -> Result<Box<dyn FirewallProvider>> {
        self.cloud
            .state
            .lock()
            .unwrap()
            .credentials_seen
            .push(credentials.secret_id.clone());
        Ok(Box::new(FakeFirewall {
            cloud: self.cloud.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Memory repository with switchable write/list failures
#[derive(Clone, Default)]
pub struct FlakyRepository {
    inner: MemoryRuleRepository,
    fail_updates: Arc<AtomicBool>,
    fail_lists: Arc<AtomicBool>,
    update_calls: Arc<AtomicUsize>,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &MemoryRuleRepository {
        &self.inner
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleRepository for FlakyRepository {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(Error::storage("database is locked"));
        }
        self.inner.list_enabled_rules().await
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        self.inner.list_rules().await
    }

    async fn get_rule_by_id(&self, id: u64) -> Result<Rule> {
        self.inner.get_rule_by_id(id).await
    }

    async fn insert_rule(&self, rule: Rule) -> Result<Rule> {
        self.inner.insert_rule(rule).await
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::storage("disk full"));
        }
        self.inner.update_rule(rule).await
    }

    async fn delete_rule(&self, id: u64) -> Result<()> {
        self.inner.delete_rule(id).await
    }

    async fn cloud_credentials(
        &self,
        cloud_config_id: Option<u64>,
        provider: &str,
    ) -> Result<CloudCredentials> {
        self.inner.cloud_credentials(cloud_config_id, provider).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Engine over an arbitrary repository, talking to `cloud`
///
/// Used where the store itself is under test, e.g. a file store reopened
/// after a restart.
pub fn engine_over(
    repository: Arc<dyn RuleRepository>,
    config_source: Arc<dyn ConfigSource>,
    cloud: &FakeCloud,
    address: &FakeAddressSource,
) -> ReconciliationEngine {
    let registry = Arc::new(ProviderRegistry::new());
    registry.register_provider(PROVIDER, Box::new(FakeFirewallFactory::new(cloud.clone())));

    let (engine, _events) = ReconciliationEngine::new(
        Arc::new(address.clone()),
        repository,
        config_source,
        registry,
        &FireflowConfig::default(),
    )
    .expect("engine construction succeeds");
    engine
}

/// Engine wired to fakes
pub struct Harness {
    pub engine: Arc<ReconciliationEngine>,
    pub events: mpsc::Receiver<EngineEvent>,
    pub repo: FlakyRepository,
    pub cloud: FakeCloud,
    pub address: FakeAddressSource,
    pub config_source: MemoryConfigSource,
    pub registry: Arc<ProviderRegistry>,
}

impl Harness {
    /// Engine resolving `203.0.113.5`, default credentials for TencentCloud
    pub async fn new() -> Self {
        Self::with_config(FireflowConfig::default()).await
    }

    pub async fn with_config(config: FireflowConfig) -> Self {
        let repo = FlakyRepository::new();
        repo.memory()
            .add_credentials(CloudCredentials::new(PROVIDER, "AKIDdefault00000000", "default-key"))
            .await;

        let cloud = FakeCloud::new();
        let registry = Arc::new(ProviderRegistry::new());
        registry.register_provider(PROVIDER, Box::new(FakeFirewallFactory::new(cloud.clone())));
        registry.register_unimplemented(fireflow_core::registry::ALIYUN);

        let address = FakeAddressSource::new("203.0.113.5\n");
        let config_source = MemoryConfigSource::new();

        let (engine, events) = ReconciliationEngine::new(
            Arc::new(address.clone()),
            Arc::new(repo.clone()),
            Arc::new(config_source.clone()),
            Arc::clone(&registry),
            &config,
        )
        .expect("engine construction succeeds");

        Self {
            engine: Arc::new(engine),
            events,
            repo,
            cloud,
            address,
            config_source,
            registry,
        }
    }

    pub async fn add_rule(&self, rule: Rule) -> Rule {
        self.repo.insert_rule(rule).await.unwrap()
    }

    pub async fn rule(&self, id: u64) -> Rule {
        self.repo.get_rule_by_id(id).await.unwrap()
    }

    /// Drain every event emitted so far
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
