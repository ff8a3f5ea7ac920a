pub mod installed_plugin;
pub mod plugin_setting;
