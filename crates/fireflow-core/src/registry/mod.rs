//! Provider registry
//!
//! Maps a rule's provider name to the factory that builds clients for it.
//! Lookup is case-insensitive, so rules stored as "tencentcloud" and
//! "TencentCloud" resolve to the same factory.
//!
//! ## Registration
//!
//! Provider crates expose a `register` function:
//!
//! ```rust,ignore
//! // In fireflow-provider-tencent
//! pub fn register(registry: &ProviderRegistry) {
//!     registry.register_provider("TencentCloud", Box::new(TencentFactory::new()));
//! }
//! ```
//!
//! Vendors that are recognised but have no client yet are registered with
//! [`ProviderRegistry::register_unimplemented`]; rules for them fail with a
//! permanent "not implemented" error instead of "unsupported provider".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::model::CloudCredentials;
use crate::traits::{FirewallProvider, FirewallProviderFactory};

/// Name under which Aliyun rules are recognised
pub const ALIYUN: &str = "Aliyun";

/// Registry of firewall provider factories
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn FirewallProviderFactory>>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider factory under `name`
    pub fn register_provider(
        &self,
        name: impl Into<String>,
        factory: Box<dyn FirewallProviderFactory>,
    ) {
        let name = name.into();
        tracing::debug!("Registering firewall provider {}", name);
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        providers.insert(name.to_ascii_lowercase(), Arc::from(factory));
    }

    /// Register a known vendor without a client implementation
    pub fn register_unimplemented(&self, name: &'static str) {
        self.register_provider(name, Box::new(UnimplementedFactory { name }));
    }

    /// Whether a factory is registered for `name`
    pub fn has_provider(&self, name: &str) -> bool {
        self.providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&name.to_ascii_lowercase())
    }

    /// Build a client for `provider` bound to `credentials`
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn FirewallProvider>)`: a fresh client
    /// - `Err(Error::ProviderPermanent)`: unknown provider, or factory failure
    pub fn create_provider(
        &self,
        provider: &str,
        credentials: &CloudCredentials,
    ) -> Result<Box<dyn FirewallProvider>> {
        let factory = {
            let providers = self
                .providers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            providers
                .get(&provider.to_ascii_lowercase())
                .cloned()
                .ok_or_else(|| Error::permanent(provider, "unsupported provider"))?
        };

        factory.create(credentials)
    }
}

/// Factory for vendors that are recognised but not supported yet
struct UnimplementedFactory {
    name: &'static str,
}

impl FirewallProviderFactory for UnimplementedFactory {
    fn create(&self, _credentials: &CloudCredentials) -> Result<Box<dyn FirewallProvider>> {
        Err(Error::permanent(self.name, "provider not implemented"))
    }
}
