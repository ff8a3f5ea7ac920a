//! Persistent store of installed plugins and their settings.
//!
//! Reads go straight to the connection pool. Writes only happen through a
//! [`RegistryTransaction`], which the orchestrator opens, fills and then
//! commits or rolls back as one unit.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryOrder, Set, TransactionTrait,
};
use serde_json::{Map, Value};

use crate::descriptor::{LicenseType, PluginDescriptor};
use crate::error::PluginError;
use folio_db::entities::{installed_plugin, plugin_setting};

/// An installed plugin as recorded in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPlugin {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub license_type: LicenseType,
    /// Resolved dependency constraints from the installed version's descriptor.
    pub dependencies: BTreeMap<String, String>,
    pub settings: Map<String, Value>,
    pub installed_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
}

impl InstalledPlugin {
    /// Record for `descriptor` carrying `settings` as its defaults.
    pub fn from_descriptor(descriptor: &PluginDescriptor, settings: Map<String, Value>) -> Self {
        let now = chrono::Utc::now().fixed_offset();
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            author: descriptor.author.clone(),
            description: descriptor.description.clone(),
            license_type: descriptor.license_type,
            dependencies: descriptor.dependencies.clone(),
            settings,
            installed_at: now,
            updated_at: now,
        }
    }

    fn from_models(
        plugin: installed_plugin::Model,
        settings: Option<plugin_setting::Model>,
    ) -> Result<Self, PluginError> {
        let dependencies = plugin.dependency_map()?;
        let settings = match settings {
            Some(row) => parse_settings(&row.settings)?,
            None => Map::new(),
        };
        Ok(Self {
            license_type: LicenseType::from_db(&plugin.license_type),
            id: plugin.id,
            name: plugin.name,
            version: plugin.version,
            author: plugin.author,
            description: plugin.description,
            dependencies,
            settings,
            installed_at: plugin.installed_at,
            updated_at: plugin.updated_at,
        })
    }
}

fn parse_settings(raw: &str) -> Result<Map<String, Value>, PluginError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    Ok(serde_json::from_str(raw)?)
}

async fn find_installed<C: ConnectionTrait>(
    conn: &C,
    plugin_id: &str,
) -> Result<Option<InstalledPlugin>, PluginError> {
    let found = installed_plugin::Entity::find_by_id(plugin_id.to_string())
        .find_also_related(plugin_setting::Entity)
        .one(conn)
        .await?;
    found
        .map(|(plugin, settings)| InstalledPlugin::from_models(plugin, settings))
        .transpose()
}

// ─── Registry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PluginRegistry {
    db: DatabaseConnection,
}

impl PluginRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get_installed(
        &self,
        plugin_id: &str,
    ) -> Result<Option<InstalledPlugin>, PluginError> {
        find_installed(&self.db, plugin_id).await
    }

    /// Every installed plugin, ordered by id.
    pub async fn list_installed(&self) -> Result<Vec<InstalledPlugin>, PluginError> {
        let rows = installed_plugin::Entity::find()
            .find_also_related(plugin_setting::Entity)
            .order_by_asc(installed_plugin::Column::Id)
            .all(&self.db)
            .await?;
        rows.into_iter()
            .map(|(plugin, settings)| InstalledPlugin::from_models(plugin, settings))
            .collect()
    }

    pub async fn begin(&self) -> Result<RegistryTransaction, PluginError> {
        Ok(RegistryTransaction {
            txn: self.db.begin().await?,
        })
    }
}

// ─── Transaction ────────────────────────────────────────────────────────

/// A unit of registry writes. Dropping it without `commit` rolls back.
pub struct RegistryTransaction {
    txn: DatabaseTransaction,
}

impl RegistryTransaction {
    pub async fn get_installed(
        &self,
        plugin_id: &str,
    ) -> Result<Option<InstalledPlugin>, PluginError> {
        find_installed(&self.txn, plugin_id).await
    }

    /// Insert or update the plugin row and its settings.
    ///
    /// `record.settings` are treated as defaults: on update, keys already
    /// stored keep their values and only new keys are added.
    pub async fn upsert_installed(
        &self,
        record: &InstalledPlugin,
    ) -> Result<InstalledPlugin, PluginError> {
        let now = chrono::Utc::now().fixed_offset();
        let dependencies = serde_json::to_string(&record.dependencies)?;

        let existing = installed_plugin::Entity::find_by_id(record.id.clone())
            .one(&self.txn)
            .await?;
        let installed_at = match existing {
            Some(model) => {
                let installed_at = model.installed_at;
                let mut active: installed_plugin::ActiveModel = model.into();
                active.name = Set(record.name.clone());
                active.version = Set(record.version.clone());
                active.author = Set(record.author.clone());
                active.description = Set(record.description.clone());
                active.license_type = Set(record.license_type.as_str().to_string());
                active.dependencies = Set(dependencies);
                active.updated_at = Set(now);
                active.update(&self.txn).await?;
                installed_at
            }
            None => {
                let active = installed_plugin::ActiveModel {
                    id: Set(record.id.clone()),
                    name: Set(record.name.clone()),
                    version: Set(record.version.clone()),
                    author: Set(record.author.clone()),
                    description: Set(record.description.clone()),
                    license_type: Set(record.license_type.as_str().to_string()),
                    dependencies: Set(dependencies),
                    installed_at: Set(now),
                    updated_at: Set(now),
                };
                installed_plugin::Entity::insert(active)
                    .exec_without_returning(&self.txn)
                    .await?;
                now
            }
        };

        let stored = plugin_setting::Entity::find_by_id(record.id.clone())
            .one(&self.txn)
            .await?;
        let settings = match stored {
            Some(row) => {
                let mut merged = parse_settings(&row.settings)?;
                for (key, value) in &record.settings {
                    merged.entry(key.clone()).or_insert_with(|| value.clone());
                }
                let mut active: plugin_setting::ActiveModel = row.into();
                active.settings = Set(serde_json::to_string(&merged)?);
                active.updated_at = Set(now);
                active.update(&self.txn).await?;
                merged
            }
            None => {
                let active = plugin_setting::ActiveModel {
                    plugin_id: Set(record.id.clone()),
                    settings: Set(serde_json::to_string(&record.settings)?),
                    updated_at: Set(now),
                };
                plugin_setting::Entity::insert(active)
                    .exec_without_returning(&self.txn)
                    .await?;
                record.settings.clone()
            }
        };

        tracing::debug!(plugin_id = %record.id, version = %record.version, "registry row upserted");

        Ok(InstalledPlugin {
            settings,
            installed_at,
            updated_at: now,
            ..record.clone()
        })
    }

    /// Delete the plugin row and its settings.
    pub async fn remove_installed(&self, plugin_id: &str) -> Result<(), PluginError> {
        plugin_setting::Entity::delete_by_id(plugin_id.to_string())
            .exec(&self.txn)
            .await?;
        let res = installed_plugin::Entity::delete_by_id(plugin_id.to_string())
            .exec(&self.txn)
            .await?;
        if res.rows_affected == 0 {
            return Err(PluginError::NotFound(plugin_id.to_string()));
        }
        tracing::debug!(plugin_id, "registry row removed");
        Ok(())
    }

    pub async fn commit(self) -> Result<(), PluginError> {
        self.txn.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), PluginError> {
        self.txn.rollback().await?;
        Ok(())
    }
}

// ─── Test fixtures ──────────────────────────────────────────────────────
