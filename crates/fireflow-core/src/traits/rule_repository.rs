// # Rule Repository Trait
//
// Defines the storage boundary for rules and cloud credential records.
//
// ## Ownership
//
// Rules are created and deleted by the administrative surface. The
// reconciliation engine only ever writes `remote_handle` and
// `last_applied_address`, and only while holding its run-lock, so
// implementations need no locking beyond what concurrent readers require.
//
// ## Implementations
//
// - In-memory: `MemoryRuleRepository`
// - JSON file: `FileRuleRepository`

use async_trait::async_trait;

use crate::Result;
use crate::model::{CloudCredentials, Rule};

/// Trait for rule repository implementations
///
/// All failures are reported as [`crate::Error::Storage`].
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// All rules with `enabled == true`
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>>;

    /// All rules, enabled or not
    async fn list_rules(&self) -> Result<Vec<Rule>>;

    /// A single rule
    ///
    /// # Returns
    ///
    /// - `Ok(Rule)`: the rule
    /// - `Err(Error::Storage)`: unknown id or storage failure
    async fn get_rule_by_id(&self, id: u64) -> Result<Rule>;

    /// Insert a new rule, assigning its id
    async fn insert_rule(&self, rule: Rule) -> Result<Rule>;

    /// Replace a stored rule
    async fn update_rule(&self, rule: &Rule) -> Result<()>;

    /// Delete a rule (deleting an unknown id is not an error)
    async fn delete_rule(&self, id: u64) -> Result<()>;

    /// Credential record for a rule
    ///
    /// `cloud_config_id == None` selects the default record for `provider`.
    async fn cloud_credentials(
        &self,
        cloud_config_id: Option<u64>,
        provider: &str,
    ) -> Result<CloudCredentials>;
}
