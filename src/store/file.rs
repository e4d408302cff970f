// Copyright 2024-2026 ModelServer Contributors
// Licensed under the Apache License, Version 2.0

//! JSON file-backed config store.
//!
//! The whole document is held in memory and rewritten atomically
//! (temp file + rename) on every mutation. Deletion is soft: rows are
//! flagged inactive and stay in the document for recovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};
use crate::models::{ModelConfig, ValidationReport};

use super::ConfigStore;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredModel {
    config: ModelConfig,
    is_active: bool,
}

/// Complete store state, as serialized to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    schema_version: u32,
    saved_at: chrono::DateTime<Utc>,
    models: HashMap<String, StoredModel>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            models: HashMap::new(),
        }
    }
}

/// File-backed [`ConfigStore`].
pub struct FileConfigStore {
    path: PathBuf,
    backups_dir: PathBuf,
    document: RwLock<StoreDocument>,
}

fn store_error(context: &str, err: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::DependencyUnavailable(format!("config store: {context}: {err}"))
}

impl FileConfigStore {
    /// Open (or initialize) a store at `path`. Backups live in a
    /// `backups/` directory next to the store file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backups_dir = path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));

        let document = if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| store_error("stat", e))?
        {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| store_error("read", e))?;
            serde_json::from_slice(&bytes).map_err(|e| store_error("parse", e))?
        } else {
            StoreDocument::default()
        };

        Ok(Self {
            path,
            backups_dir,
            document: RwLock::new(document),
        })
    }

    /// Write the document to disk via temp file + rename.
    async fn persist(&self, document: &StoreDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_error("mkdir", e))?;
        }
        let bytes =
            serde_json::to_vec_pretty(document).map_err(|e| store_error("serialize", e))?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| store_error("write", e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| store_error("rename", e))?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn save_model_config(&self, config: &ModelConfig) -> Result<()> {
        let mut document = self.document.write().await;
        let mut config = config.clone();
        config.updated_at = Utc::now();
        document.models.insert(
            config.id.clone(),
            StoredModel {
                config,
                is_active: true,
            },
        );
        document.saved_at = Utc::now();
        self.persist(&document).await
    }

    async fn load_model_configs(&self) -> Result<Vec<ModelConfig>> {
        let document = self.document.read().await;
        let mut configs: Vec<ModelConfig> = document
            .models
            .values()
            .filter(|m| m.is_active)
            .map(|m| m.config.clone())
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }

    async fn delete_model_config(&self, model_id: &str) -> Result<()> {
        let mut document = self.document.write().await;
        match document.models.get_mut(model_id) {
            Some(stored) if stored.is_active => {
                stored.is_active = false;
                stored.config.updated_at = Utc::now();
            }
            _ => return Err(OrchestratorError::NotFound(model_id.to_string())),
        }
        document.saved_at = Utc::now();
        self.persist(&document).await
    }

    async fn validate_config(&self, config: &ModelConfig) -> ValidationReport {
        config.validate_schema()
    }

    async fn backup(&self) -> Result<String> {
        let document = self.document.read().await;
        tokio::fs::create_dir_all(&self.backups_dir)
            .await
            .map_err(|e| store_error("mkdir backups", e))?;

        let name = format!(
            "models-{}-{}.json",
            Utc::now().format("%Y%m%d%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let bytes =
            serde_json::to_vec_pretty(&*document).map_err(|e| store_error("serialize", e))?;
        tokio::fs::write(self.backups_dir.join(&name), bytes)
            .await
            .map_err(|e| store_error("write backup", e))?;
        tracing::info!(backup = %name, "config store backup created");
        Ok(name)
    }

    async fn restore(&self, backup_name: &str) -> Result<()> {
        let backup_path = self.backups_dir.join(backup_name);
        let bytes = tokio::fs::read(&backup_path)
            .await
            .map_err(|_| OrchestratorError::NotFound(format!("backup {backup_name}")))?;
        let restored: StoreDocument =
            serde_json::from_slice(&bytes).map_err(|e| store_error("parse backup", e))?;

        let mut document = self.document.write().await;
        *document = restored;
        self.persist(&document).await?;
        tracing::info!(backup = %backup_name, "config store restored");
        Ok(())
    }

    async fn list_backups(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.backups_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(names), // no backups yet
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_error("list backups", e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("models-") && name.ends_with(".json") {
                    names.push(name.to_string());
                }
            }
        }
        // Timestamped names: lexicographic descending is newest first.
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    async fn cleanup_old_backups(&self, keep_count: usize) -> Result<usize> {
        let names = self.list_backups().await?;
        let mut deleted = 0;
        for name in names.iter().skip(keep_count) {
            tokio::fs::remove_file(self.backups_dir.join(name))
                .await
                .map_err(|e| store_error("remove backup", e))?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Framework, HealthCheckConfig, ResourceRequirement, RetryPolicy};
    use std::collections::BTreeMap;

    fn config(id: &str) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            name: format!("model {id}"),
            framework: Framework::NativeServer,
            model_path: "/models/test.gguf".to_string(),
            priority: 5,
            gpu_devices: vec![0],
            parameters: BTreeMap::new(),
            additional_parameters: None,
            resource_requirements: ResourceRequirement {
                gpu_memory: 4096,
                gpu_devices: vec![0],
                cpu_cores: None,
                system_memory: None,
            },
            health_check: HealthCheckConfig::default(),
            retry_policy: RetryPolicy::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn store() -> (tempfile::TempDir, FileConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::open(dir.path().join("models.json"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (_dir, store) = store().await;
        store.save_model_config(&config("m1")).await.unwrap();
        store.save_model_config(&config("m2")).await.unwrap();

        let configs = store.load_model_configs().await.unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].id, "m1");
        assert_eq!(configs[1].id, "m2");
    }

    #[tokio::test]
    async fn test_save_bumps_updated_at() {
        let (_dir, store) = store().await;
        let cfg = config("m1");
        let before = cfg.updated_at;
        store.save_model_config(&cfg).await.unwrap();
        let loaded = store.load_model_configs().await.unwrap();
        assert!(loaded[0].updated_at >= before);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_config() {
        let (_dir, store) = store().await;
        store.save_model_config(&config("m1")).await.unwrap();
        store.delete_model_config("m1").await.unwrap();

        assert!(store.load_model_configs().await.unwrap().is_empty());
        // Deleting again reports not found: the row is already inactive.
        assert!(matches!(
            store.delete_model_config("m1").await,
            Err(OrchestratorError::NotFound(_))
        ));
        // Re-saving reactivates the id.
        store.save_model_config(&config("m1")).await.unwrap();
        assert_eq!(store.load_model_configs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        {
            let store = FileConfigStore::open(&path).await.unwrap();
            store.save_model_config(&config("m1")).await.unwrap();
        }
        let store = FileConfigStore::open(&path).await.unwrap();
        let configs = store.load_model_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, "m1");
    }

    #[tokio::test]
    async fn test_backup_restore_cycle() {
        let (_dir, store) = store().await;
        store.save_model_config(&config("m1")).await.unwrap();
        let backup = store.backup().await.unwrap();

        store.delete_model_config("m1").await.unwrap();
        assert!(store.load_model_configs().await.unwrap().is_empty());

        store.restore(&backup).await.unwrap();
        assert_eq!(store.load_model_configs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_unknown_backup() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.restore("models-00000000-missing.json").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_backup_listing_and_cleanup() {
        let (_dir, store) = store().await;
        store.save_model_config(&config("m1")).await.unwrap();
        for _ in 0..4 {
            store.backup().await.unwrap();
        }
        assert_eq!(store.list_backups().await.unwrap().len(), 4);

        let deleted = store.cleanup_old_backups(2).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.list_backups().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validate_delegates_to_schema() {
        let (_dir, store) = store().await;
        let mut bad = config("bad id!");
        bad.id = "bad id!".to_string();
        let report = store.validate_config(&bad).await;
        assert!(!report.is_valid);
    }
}
