// # Memory Stores
//
// In-memory implementations of `RuleRepository` and `ConfigSource`.
//
// Nothing survives a restart. Rules loaded again afterwards carry no handle,
// so the next pass takes the create path and reports CREATED. Providers treat
// creating an identical rule as success, but a counterpart for an older
// address stays behind until the rule's next replace cleans it up.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::RuleTable;
use crate::Result;
use crate::model::{CloudCredentials, Rule};
use crate::traits::{ConfigSource, RuleRepository};

/// In-memory rule repository
///
/// Clones share the same underlying table.
#[derive(Debug, Clone, Default)]
pub struct MemoryRuleRepository {
    inner: Arc<RwLock<RuleTable>>,
}

impl MemoryRuleRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a credential record, returning it with its assigned id
    pub async fn add_credentials(&self, credentials: CloudCredentials) -> CloudCredentials {
        self.inner.write().await.add_credentials(credentials)
    }

    /// Number of stored rules
    pub async fn len(&self) -> usize {
        self.inner.read().await.rules.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.rules.is_empty()
    }
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.inner.read().await.enabled_rules())
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.inner.read().await.all_rules())
    }

    async fn get_rule_by_id(&self, id: u64) -> Result<Rule> {
        self.inner.read().await.get(id)
    }

    async fn insert_rule(&self, rule: Rule) -> Result<Rule> {
        self.inner.write().await.insert(rule)
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        self.inner.write().await.update(rule)
    }

    async fn delete_rule(&self, id: u64) -> Result<()> {
        self.inner.write().await.delete(id);
        Ok(())
    }

    async fn cloud_credentials(
        &self,
        cloud_config_id: Option<u64>,
        provider: &str,
    ) -> Result<CloudCredentials> {
        self.inner
            .read()
            .await
            .credentials_for(cloud_config_id, provider)
    }
}

/// In-memory runtime settings
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigSource {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source pre-populated with `entries`
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::model::Protocol;

    #[tokio::test]
    async fn enabled_listing_excludes_disabled_rules() {
        let repo = MemoryRuleRepository::new();
        assert!(repo.is_empty().await);

        repo.insert_rule(Rule::new(0, "TencentCloud", "lhins-1", Protocol::Tcp, "22", "ssh"))
            .await
            .unwrap();
        repo.insert_rule(
            Rule::new(0, "TencentCloud", "lhins-1", Protocol::Tcp, "80", "web").with_enabled(false),
        )
        .await
        .unwrap();

        assert_eq!(repo.len().await, 2);
        let enabled = repo.list_enabled_rules().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].label, "ssh");
    }

    #[tokio::test]
    async fn clones_share_state() {
        let repo = MemoryRuleRepository::new();
        let clone = repo.clone();
        let rule = repo
            .insert_rule(Rule::new(0, "TencentCloud", "lhins-1", Protocol::Udp, "53", "dns"))
            .await
            .unwrap();

        let mut stored = clone.get_rule_by_id(rule.id).await.unwrap();
        stored.last_applied_address = Some("203.0.113.5".parse().unwrap());
        clone.update_rule(&stored).await.unwrap();

        assert_eq!(repo.get_rule_by_id(rule.id).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let repo = MemoryRuleRepository::new();
        repo.delete_rule(42).await.unwrap();
        assert!(matches!(repo.get_rule_by_id(42).await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn config_source_round_trip() {
        let source = MemoryConfigSource::with_entries([("cron_enabled", "true")]);
        assert_eq!(
            source.get_string("cron_enabled").await.unwrap().as_deref(),
            Some("true")
        );
        assert!(source.get_string("ip_fetch_url").await.unwrap().is_none());
        source.set_string("ip_fetch_url", "https://4.ipw.cn").await.unwrap();
        assert!(source.get_string("ip_fetch_url").await.unwrap().is_some());
    }
}
