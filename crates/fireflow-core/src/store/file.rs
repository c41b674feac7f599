// # File Rule Repository
//
// JSON file implementation of `RuleRepository` and `ConfigSource`.
//
// ## Crash Recovery
//
// - Atomic writes: the table is written to `<path>.tmp`, then renamed
// - Backup: the previous file is copied to `<path>.backup` before each write
// - Corruption: an unparseable file falls back to the backup, then to empty
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "rules": [
//     {
//       "id": 1,
//       "provider": "TencentCloud",
//       "instance_id": "lhins-abc",
//       "port": "22",
//       "protocol": "TCP",
//       "label": "ssh-admin",
//       "last_applied_address": "203.0.113.5",
//       "remote_handle": "lh-…",
//       "enabled": true
//     }
//   ],
//   "cloud_configs": [],
//   "settings": { "cron_enabled": "true" }
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use super::RuleTable;
use crate::model::{CloudCredentials, Rule};
use crate::traits::{ConfigSource, RuleRepository};
use crate::{Error, Result};

/// Rules file format version
const RULES_FILE_VERSION: &str = "1.0";

/// File-backed rule repository and settings store
///
/// Every mutation is written to disk before the call returns. A failed
/// write leaves the in-memory table updated and is reported as
/// [`Error::Storage`].
#[derive(Debug, Clone)]
pub struct FileRuleRepository {
    path: PathBuf,
    table: Arc<RwLock<RuleTable>>,
    /// Serializes writers of the temp file
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RulesFileFormat {
    version: String,
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    cloud_configs: Vec<CloudCredentials>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

impl RulesFileFormat {
    fn from_table(table: &RuleTable) -> Self {
        Self {
            version: RULES_FILE_VERSION.to_string(),
            rules: table.all_rules(),
            cloud_configs: table.cloud_configs.clone(),
            settings: table.settings.clone(),
        }
    }

    fn into_table(self) -> RuleTable {
        RuleTable {
            rules: self.rules.into_iter().map(|r| (r.id, r)).collect(),
            cloud_configs: self.cloud_configs,
            settings: self.settings,
        }
    }
}

impl FileRuleRepository {
    /// Open or create a rules file
    ///
    /// Parent directories are created as needed.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::storage(format!(
                        "failed to create rules directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let table = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            table: Arc::new(RwLock::new(table)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Path of the rules file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a credential record, returning it with its assigned id
    pub async fn add_credentials(&self, credentials: CloudCredentials) -> Result<CloudCredentials> {
        let added = self.table.write().await.add_credentials(credentials);
        self.persist().await?;
        Ok(added)
    }

    /// Install the default credential record for a provider and persist
    pub async fn set_default_credentials(
        &self,
        credentials: CloudCredentials,
    ) -> Result<CloudCredentials> {
        let installed = self.table.write().await.set_default_credentials(credentials);
        self.persist().await?;
        Ok(installed)
    }

    async fn load_with_recovery(path: &Path) -> Result<RuleTable> {
        match Self::load(path).await {
            Ok(table) => {
                tracing::debug!("Loaded {} rules from {}", table.rules.len(), path.display());
                Ok(table)
            }
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Rules file {} appears corrupted: {}. Attempting recovery from backup.",
                    path.display(),
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with an empty rule set.");
                    return Ok(RuleTable::default());
                }

                match Self::load(&backup_path).await {
                    Ok(table) => {
                        tracing::info!("Recovered {} rules from backup", table.rules.len());
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore rules file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(table)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also unreadable: {}. Starting with an empty rule set.",
                            backup_err
                        );
                        Ok(RuleTable::default())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load(path: &Path) -> Result<RuleTable> {
        if !path.exists() {
            tracing::debug!("Rules file does not exist yet: {}", path.display());
            return Ok(RuleTable::default());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::storage(format!("failed to read rules file {}: {}", path.display(), e))
        })?;

        let file: RulesFileFormat = serde_json::from_str(&content)?;

        if file.version != RULES_FILE_VERSION {
            tracing::warn!(
                "Rules file version mismatch: expected {}, got {}. Loading anyway.",
                RULES_FILE_VERSION,
                file.version
            );
        }

        Ok(file.into_table())
    }

    /// Write the table atomically
    async fn persist(&self) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        let json = {
            let table = self.table.read().await;
            let file = RulesFileFormat::from_table(&table);
            serde_json::to_string_pretty(&file)
                .map_err(|e| Error::storage(format!("failed to serialize rules: {}", e)))?
        };

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::storage(format!(
                    "failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::storage(format!(
                    "failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.flush().await.map_err(|e| {
                Error::storage(format!(
                    "failed to flush temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await {
                tracing::warn!("Failed to create rules backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::storage(format!(
                "failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("Rules written to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl RuleRepository for FileRuleRepository {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.table.read().await.enabled_rules())
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.table.read().await.all_rules())
    }

    async fn get_rule_by_id(&self, id: u64) -> Result<Rule> {
        self.table.read().await.get(id)
    }

    /// A failed write rolls the insert back, so an `Err` never leaves a
    /// rule behind that the engine would reconcile
    async fn insert_rule(&self, rule: Rule) -> Result<Rule> {
        let inserted = self.table.write().await.insert(rule)?;
        if let Err(e) = self.persist().await {
            self.table.write().await.delete(inserted.id);
            return Err(e);
        }
        Ok(inserted)
    }

    async fn update_rule(&self, rule: &Rule) -> Result<()> {
        let previous = {
            let mut table = self.table.write().await;
            let previous = table.get(rule.id)?;
            table.update(rule)?;
            previous
        };
        if let Err(e) = self.persist().await {
            self.table.write().await.update(&previous)?;
            return Err(e);
        }
        Ok(())
    }

    async fn delete_rule(&self, id: u64) -> Result<()> {
        let removed = self.table.write().await.delete(id);
        if removed {
            self.persist().await?;
        }
        Ok(())
    }

    async fn cloud_credentials(
        &self,
        cloud_config_id: Option<u64>,
        provider: &str,
    ) -> Result<CloudCredentials> {
        self.table
            .read()
            .await
            .credentials_for(cloud_config_id, provider)
    }
}

#[async_trait]
impl ConfigSource for FileRuleRepository {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.table.read().await.settings.get(key).cloned())
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.table
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        self.persist().await
    }
}
