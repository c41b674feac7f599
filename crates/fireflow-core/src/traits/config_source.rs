// # Config Source Trait
//
// Runtime key/value settings that the administrative surface may change
// while the process runs (address source URL, schedule). Absent keys fall
// back to the defaults in `crate::config::keys`.

use async_trait::async_trait;

use crate::Result;

/// Trait for runtime configuration sources
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Value for `key`, `None` when unset
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;
}
