use sea_orm_migration::prelude::*;

/// Migration 1: Create plugin installation tables.
///
/// Two tables:
/// - `installed_plugins`: one row per installed plugin id, with the resolved
///   dependency constraints recorded at install/update time
/// - `plugin_settings`: one JSON settings blob per installed plugin
#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InstalledPlugins::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstalledPlugins::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstalledPlugins::Name).string_len(255).not_null())
                    .col(ColumnDef::new(InstalledPlugins::Version).string_len(64).not_null())
                    .col(ColumnDef::new(InstalledPlugins::Author).string_len(255).null())
                    .col(ColumnDef::new(InstalledPlugins::Description).text().null())
                    .col(
                        ColumnDef::new(InstalledPlugins::LicenseType)
                            .string_len(16)
                            .not_null()
                            .default("free"),
                    )
                    .col(
                        ColumnDef::new(InstalledPlugins::Dependencies)
                            .text()
                            .not_null()
                            .default("{}"),
                    )
                    .col(
                        ColumnDef::new(InstalledPlugins::InstalledAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(InstalledPlugins::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PluginSettings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PluginSettings::PluginId)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PluginSettings::Settings)
                            .text()
                            .not_null()
                            .default("{}"),
                    )
                    .col(
                        ColumnDef::new(PluginSettings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_plugin_settings_plugin_id")
                            .from(PluginSettings::Table, PluginSettings::PluginId)
                            .to(InstalledPlugins::Table, InstalledPlugins::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PluginSettings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(InstalledPlugins::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
pub enum InstalledPlugins {
    Table,
    Id,
    Name,
    Version,
    Author,
    Description,
    LicenseType,
    Dependencies,
    InstalledAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
pub enum PluginSettings {
    Table,
    PluginId,
    Settings,
    UpdatedAt,
}
