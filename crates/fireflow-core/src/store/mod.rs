// # Rule Store Implementations
//
// Implementations of `RuleRepository` and `ConfigSource`. Both stores keep
// their contents in a `RuleTable`; the file store additionally writes the
// table to disk after every mutation.

pub mod file;
pub mod memory;

pub use file::FileRuleRepository;
pub use memory::{MemoryConfigSource, MemoryRuleRepository};

use std::collections::{BTreeMap, HashMap};

use crate::model::{CloudCredentials, Rule};
use crate::{Error, Result};

/// Rules, credential records and settings held by a store
#[derive(Debug, Clone, Default)]
pub(crate) struct RuleTable {
    pub rules: BTreeMap<u64, Rule>,
    pub cloud_configs: Vec<CloudCredentials>,
    pub settings: HashMap<String, String>,
}

impl RuleTable {
    pub fn enabled_rules(&self) -> Vec<Rule> {
        self.rules.values().filter(|r| r.enabled).cloned().collect()
    }

    pub fn all_rules(&self) -> Vec<Rule> {
        self.rules.values().cloned().collect()
    }

    pub fn get(&self, id: u64) -> Result<Rule> {
        self.rules
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::storage(format!("rule {} does not exist", id)))
    }

    /// Insert, assigning the next free id when `rule.id == 0`
    pub fn insert(&mut self, mut rule: Rule) -> Result<Rule> {
        if rule.id == 0 {
            rule.id = self.rules.keys().next_back().map_or(1, |max| max + 1);
        } else if self.rules.contains_key(&rule.id) {
            return Err(Error::storage(format!("rule {} already exists", rule.id)));
        }
        self.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    pub fn update(&mut self, rule: &Rule) -> Result<()> {
        match self.rules.get_mut(&rule.id) {
            Some(slot) => {
                *slot = rule.clone();
                Ok(())
            }
            None => Err(Error::storage(format!("rule {} does not exist", rule.id))),
        }
    }

    pub fn delete(&mut self, id: u64) -> bool {
        self.rules.remove(&id).is_some()
    }

    /// Add a credential record, assigning its id
    pub fn add_credentials(&mut self, mut credentials: CloudCredentials) -> CloudCredentials {
        let next = self
            .cloud_configs
            .iter()
            .filter_map(|c| c.id)
            .max()
            .map_or(1, |max| max + 1);
        credentials.id = Some(next);
        self.cloud_configs.push(credentials.clone());
        credentials
    }

    /// Install the default record for a provider
    ///
    /// The provider's first record keeps its id and takes the new secrets and
    /// region. A provider with no record gets a new one.
    pub fn set_default_credentials(&mut self, credentials: CloudCredentials) -> CloudCredentials {
        match self
            .cloud_configs
            .iter_mut()
            .find(|c| c.provider.eq_ignore_ascii_case(&credentials.provider))
        {
            Some(existing) => {
                existing.secret_id = credentials.secret_id;
                existing.secret_key = credentials.secret_key;
                existing.region = credentials.region;
                existing.clone()
            }
            None => self.add_credentials(credentials),
        }
    }

    /// Select the credential record for a rule
    ///
    /// An explicit id must exist and belong to `provider`. Without one, the
    /// first record for `provider` is used.
    pub fn credentials_for(
        &self,
        cloud_config_id: Option<u64>,
        provider: &str,
    ) -> Result<CloudCredentials> {
        match cloud_config_id {
            Some(id) => {
                let record = self
                    .cloud_configs
                    .iter()
                    .find(|c| c.id == Some(id))
                    .ok_or_else(|| Error::storage(format!("cloud config {} does not exist", id)))?;
                if !record.provider.eq_ignore_ascii_case(provider) {
                    return Err(Error::storage(format!(
                        "cloud config {} belongs to {}, not {}",
                        id, record.provider, provider
                    )));
                }
                Ok(record.clone())
            }
            None => self
                .cloud_configs
                .iter()
                .find(|c| c.provider.eq_ignore_ascii_case(provider))
                .cloned()
                .ok_or_else(|| {
                    Error::storage(format!("no cloud config for provider {}", provider))
                }),
        }
    }
}
