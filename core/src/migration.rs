//! Versioned schema migrations.
//!
//! Dialect-agnostic bookkeeping: migrations are registered in order,
//! applied inside per-migration transactions by a [`MigrationBackend`],
//! and recorded in `s_schema_version(version, description, checksum,
//! applied_at)` with `version` unique. System tables carry the `s_`
//! prefix and relationship tables the `_rel` suffix; the SQL bodies
//! themselves come from the storage integration, not from this module.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use sha1::Digest;
use sha1::Sha1;
use tracing::info;

use crate::error::DataAgentErr;
use crate::error::Result;

pub const SCHEMA_VERSION_TABLE: &str = "s_schema_version";

#[derive(Debug, Clone)]
pub struct Migration {
    /// Monotonically increasing, zero-padded ("001", "002", ...).
    pub version: String,
    pub description: String,
    pub up: Vec<String>,
    /// Rollback is optional per migration.
    pub down: Option<Vec<String>>,
}

impl Migration {
    /// Checksum over the forward statements; recorded on apply and
    /// verified on subsequent runs.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha1::new();
        for statement in &self.up {
            hasher.update(statement.as_bytes());
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMigration {
    pub version: String,
    pub description: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// Storage-side half of the migration system.
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    /// Run one migration's statements inside a single transaction.
    async fn execute(&self, statements: &[String]) -> Result<()>;

    /// Rows of `s_schema_version`, in applied order.
    async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>>;

    async fn record_applied(&self, applied: &AppliedMigration) -> Result<()>;

    async fn remove_applied(&self, version: &str) -> Result<()>;
}

pub struct MigrationManager {
    backend: std::sync::Arc<dyn MigrationBackend>,
    migrations: Vec<Migration>,
}

impl MigrationManager {
    pub fn new(backend: std::sync::Arc<dyn MigrationBackend>) -> Self {
        Self {
            backend,
            migrations: Vec::new(),
        }
    }

    /// Register a migration. Versions must be unique and registered in
    /// increasing order.
    pub fn register(&mut self, migration: Migration) -> Result<()> {
        if let Some(last) = self.migrations.last() {
            if migration.version <= last.version {
                return Err(DataAgentErr::Storage(format!(
                    "migration {} registered out of order (after {})",
                    migration.version, last.version
                )));
            }
        }
        self.migrations.push(migration);
        Ok(())
    }

    pub fn registered_versions(&self) -> Vec<String> {
        self.migrations.iter().map(|m| m.version.clone()).collect()
    }

    /// Apply every pending migration in order. Already-applied versions
    /// are checksum-verified first. Returns the versions applied by this
    /// call.
    pub async fn migrate(&self) -> Result<Vec<String>> {
        let applied = self.backend.applied_migrations().await?;

        for row in &applied {
            if let Some(migration) = self.migrations.iter().find(|m| m.version == row.version) {
                if migration.checksum() != row.checksum {
                    return Err(DataAgentErr::MigrationChecksum(row.version.clone()));
                }
            }
        }

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.iter().any(|row| row.version == migration.version) {
                continue;
            }
            info!(
                "applying migration {}: {}",
                migration.version, migration.description
            );
            self.backend.execute(&migration.up).await?;
            self.backend
                .record_applied(&AppliedMigration {
                    version: migration.version.clone(),
                    description: migration.description.clone(),
                    checksum: migration.checksum(),
                    applied_at: Utc::now(),
                })
                .await?;
            newly_applied.push(migration.version.clone());
        }
        Ok(newly_applied)
    }

    /// Roll back the latest applied migration, which must be `version`
    /// and must carry a `down` script.
    pub async fn rollback(&self, version: &str) -> Result<()> {
        let applied = self.backend.applied_migrations().await?;
        let latest = applied
            .last()
            .ok_or_else(|| DataAgentErr::Storage("nothing to roll back".to_string()))?;
        if latest.version != version {
            return Err(DataAgentErr::Storage(format!(
                "can only roll back the latest applied migration ({})",
                latest.version
            )));
        }
        let migration = self
            .migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| DataAgentErr::Storage(format!("unknown migration {version}")))?;
        let Some(down) = &migration.down else {
            return Err(DataAgentErr::RollbackUnsupported(version.to_string()));
        };
        info!("rolling back migration {version}");
        self.backend.execute(down).await?;
        self.backend.remove_applied(version).await?;
        Ok(())
    }
}
