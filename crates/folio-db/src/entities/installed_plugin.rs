use std::collections::BTreeMap;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "installed_plugins")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    pub license_type: String,
    /// Resolved `plugin-id → version constraint` map, JSON-encoded.
    #[sea_orm(column_type = "Text")]
    pub dependencies: String,
    pub installed_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Decode the recorded dependency constraints.
    pub fn dependency_map(&self) -> Result<BTreeMap<String, String>, serde_json::Error> {
        if self.dependencies.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&self.dependencies)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::plugin_setting::Entity")]
    PluginSetting,
}

impl Related<super::plugin_setting::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PluginSetting.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
