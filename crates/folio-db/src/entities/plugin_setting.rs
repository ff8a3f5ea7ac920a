use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One JSON settings blob per installed plugin.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "plugin_settings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub plugin_id: String,
    #[sea_orm(column_type = "Text")]
    pub settings: String,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::installed_plugin::Entity",
        from = "Column::PluginId",
        to = "super::installed_plugin::Column::Id",
        on_delete = "Cascade"
    )]
    InstalledPlugin,
}

impl Related<super::installed_plugin::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InstalledPlugin.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
