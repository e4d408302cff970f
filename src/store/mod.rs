//! Config store boundary.
//!
//! The orchestrator persists model configurations only through the
//! [`ConfigStore`] trait; the file-backed implementation ships here, and a
//! database-backed one can be substituted without touching the core.

mod file;

pub use file::FileConfigStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ModelConfig, ValidationReport};

/// Persistence contract for model configurations.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Upsert by id; bumps `updated_at`.
    async fn save_model_config(&self, config: &ModelConfig) -> Result<()>;

    /// Active configurations only; soft-deleted rows are absent.
    async fn load_model_configs(&self) -> Result<Vec<ModelConfig>>;

    /// Soft delete: the row is kept but marked inactive.
    async fn delete_model_config(&self, model_id: &str) -> Result<()>;

    /// Structural validation without persistence.
    async fn validate_config(&self, config: &ModelConfig) -> ValidationReport;

    /// Snapshot current state; returns the backup name.
    async fn backup(&self) -> Result<String>;

    /// Replace current state with a named backup.
    async fn restore(&self, backup_name: &str) -> Result<()>;

    /// Backup names, newest first.
    async fn list_backups(&self) -> Result<Vec<String>>;

    /// Delete all but the newest `keep_count` backups; returns how many
    /// were removed.
    async fn cleanup_old_backups(&self, keep_count: usize) -> Result<usize>;
}
