//! Package metadata (`plugin.json`) parsing and validation.
//!
//! Every package carries a `plugin.json` at its root. The marketplace
//! descriptor is what we asked for; the metadata is what we actually got,
//! so the two must agree on id and version before anything is promoted.

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

pub const METADATA_FILE: &str = "plugin.json";

pub const DEFAULT_BOOTSTRAP: &str = "bootstrap.wasm";

fn default_bootstrap() -> String {
    DEFAULT_BOOTSTRAP.to_string()
}

/// Metadata shipped inside a plugin package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// Bootstrap module path, relative to the package root.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: String,
    #[serde(default)]
    pub permissions: Permissions,
}

/// Network access requested by the bootstrap code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub http_hosts: Vec<String>,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a plugin id against `^[a-z][a-z0-9-]{1,63}$`.
pub fn validate_plugin_id(id: &str) -> Result<(), PluginError> {
    let len = id.len();
    if !(2..=64).contains(&len) {
        return Err(PluginError::InvalidMetadata(format!(
            "plugin id must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = id.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(PluginError::InvalidMetadata(format!(
                "plugin id must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(PluginError::InvalidMetadata(format!(
                "plugin id contains invalid character '{ch}'"
            )));
        }
    }

    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<(), PluginError> {
    semver::Version::parse(value).map_err(|_| {
        PluginError::InvalidMetadata(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

/// Reject absolute paths and `..` components.
pub(crate) fn validate_path_safety(path: &str, field_name: &str) -> Result<(), PluginError> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(PluginError::InvalidMetadata(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(PluginError::InvalidMetadata(format!(
            "{field_name} must not contain '..': '{path}'"
        )));
    }
    Ok(())
}

/// Must be non-empty, contain no spaces, and be `"*"`, `"localhost"` or a dotted domain.
fn validate_http_host(host: &str) -> Result<(), PluginError> {
    if host.is_empty() {
        return Err(PluginError::InvalidMetadata(
            "http_hosts entry must not be empty".into(),
        ));
    }
    if host.contains(' ') {
        return Err(PluginError::InvalidMetadata(format!(
            "http_hosts entry must not contain spaces: '{host}'"
        )));
    }
    if host != "*" && host != "localhost" && !host.contains('.') {
        return Err(PluginError::InvalidMetadata(format!(
            "http_hosts entry is not a valid domain: '{host}'"
        )));
    }
    Ok(())
}

impl PluginMetadata {
    pub fn parse(json: &str) -> Result<Self, PluginError> {
        serde_json::from_str(json)
            .map_err(|e| PluginError::InvalidMetadata(format!("{METADATA_FILE}: {e}")))
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        validate_plugin_id(&self.id)?;
        validate_semver(&self.version, "version")?;

        let name_len = self.name.trim().len();
        if name_len == 0 || name_len > 255 {
            return Err(PluginError::InvalidMetadata(format!(
                "name must be 1-255 characters, got {name_len}"
            )));
        }

        if let Some(ref description) = self.description {
            if description.len() > 2000 {
                return Err(PluginError::InvalidMetadata(
                    "description must be at most 2000 characters".into(),
                ));
            }
        }

        validate_path_safety(&self.bootstrap, "bootstrap")?;
        if !self.bootstrap.ends_with(".wasm") {
            return Err(PluginError::InvalidMetadata(format!(
                "bootstrap must end with '.wasm', got '{}'",
                self.bootstrap
            )));
        }

        for host in &self.permissions.http_hosts {
            validate_http_host(host)?;
        }

        Ok(())
    }

    pub fn parse_and_validate(json: &str) -> Result<Self, PluginError> {
        let metadata = Self::parse(json)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Read and validate `plugin.json` from an extracted package root.
    pub async fn load(package_root: &std::path::Path) -> Result<Self, PluginError> {
        let path = package_root.join(METADATA_FILE);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PluginError::Structure(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse_and_validate(&raw)
    }

    /// The package must be the plugin and version that was requested.
    pub fn ensure_matches(&self, plugin_id: &str, version: &str) -> Result<(), PluginError> {
        if self.id != plugin_id {
            return Err(PluginError::InvalidMetadata(format!(
                "package declares id '{}' but '{plugin_id}' was requested",
                self.id
            )));
        }
        if crate::version::compare(&self.version, version) != std::cmp::Ordering::Equal {
            return Err(PluginError::InvalidMetadata(format!(
                "package declares version {} but marketplace advertises {version}",
                self.version
            )));
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_VALID_JSON: &str = r#"{
        "id": "seo-tools",
        "name": "SEO Tools",
        "version": "1.1.0",
        "description": "Meta tags and sitemaps",
        "author": "Folio Labs",
        "bootstrap": "bin/bootstrap.wasm",
        "permissions": { "http_hosts": ["api.example.com", "localhost"] }
    }"#;

    #[test]
    fn test_parse_full_metadata() {
        let meta = PluginMetadata::parse_and_validate(FULL_VALID_JSON).unwrap();
        assert_eq!(meta.id, "seo-tools");
        assert_eq!(meta.version, "1.1.0");
        assert_eq!(meta.bootstrap, "bin/bootstrap.wasm");
        assert_eq!(meta.author.as_deref(), Some("Folio Labs"));
        assert_eq!(meta.permissions.http_hosts.len(), 2);
    }

    #[test]
    fn test_parse_minimal_defaults() {
        let meta = PluginMetadata::parse_and_validate(
            r#"{"id": "core-utils", "name": "Core Utils", "version": "1.0.0"}"#,
        )
        .unwrap();
        assert_eq!(meta.bootstrap, DEFAULT_BOOTSTRAP);
        assert!(meta.description.is_none());
        assert!(meta.permissions.http_hosts.is_empty());
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = PluginMetadata::parse("{ not json").unwrap_err();
        assert!(matches!(err, PluginError::InvalidMetadata(_)));
        assert!(err.to_string().contains("plugin.json"));
    }

    #[test]
    fn test_validate_plugin_id() {
        assert!(validate_plugin_id("seo-tools").is_ok());
        assert!(validate_plugin_id("a1").is_ok());
        assert!(validate_plugin_id("a").is_err());
        assert!(validate_plugin_id("").is_err());
        assert!(validate_plugin_id("SeoTools").is_err());
        assert!(validate_plugin_id("1seo").is_err());
        assert!(validate_plugin_id("seo_tools").is_err());
        assert!(validate_plugin_id("../etc").is_err());
        assert!(validate_plugin_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_version_not_semver() {
        let err = PluginMetadata::parse_and_validate(
            r#"{"id": "seo-tools", "name": "SEO", "version": "one"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("semver"));
    }

    #[test]
    fn test_validate_empty_name() {
        let err = PluginMetadata::parse_and_validate(
            r#"{"id": "seo-tools", "name": "  ", "version": "1.0.0"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("1-255"));
    }

    #[test]
    fn test_validate_bootstrap_path() {
        let traversal = PluginMetadata::parse_and_validate(
            r#"{"id": "seo-tools", "name": "SEO", "version": "1.0.0", "bootstrap": "../x.wasm"}"#,
        )
        .unwrap_err();
        assert!(traversal.to_string().contains(".."));

        let absolute = PluginMetadata::parse_and_validate(
            r#"{"id": "seo-tools", "name": "SEO", "version": "1.0.0", "bootstrap": "/x.wasm"}"#,
        )
        .unwrap_err();
        assert!(absolute.to_string().contains("absolute"));

        let ext = PluginMetadata::parse_and_validate(
            r#"{"id": "seo-tools", "name": "SEO", "version": "1.0.0", "bootstrap": "boot.js"}"#,
        )
        .unwrap_err();
        assert!(ext.to_string().contains(".wasm"));
    }

    #[test]
    fn test_validate_http_hosts() {
        let err = PluginMetadata::parse_and_validate(
            r#"{"id": "seo-tools", "name": "SEO", "version": "1.0.0",
                "permissions": {"http_hosts": ["intranet"]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a valid domain"));

        let err = PluginMetadata::parse_and_validate(
            r#"{"id": "seo-tools", "name": "SEO", "version": "1.0.0",
                "permissions": {"http_hosts": [""]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_ensure_matches() {
        let meta = PluginMetadata::parse_and_validate(FULL_VALID_JSON).unwrap();
        assert!(meta.ensure_matches("seo-tools", "1.1.0").is_ok());
        // Normalized comparison
        assert!(meta.ensure_matches("seo-tools", "v1.1").is_ok());

        let wrong_id = meta.ensure_matches("other", "1.1.0").unwrap_err();
        assert!(wrong_id.to_string().contains("'other'"));

        let wrong_version = meta.ensure_matches("seo-tools", "1.2.0").unwrap_err();
        assert!(matches!(wrong_version, PluginError::InvalidMetadata(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_structure_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PluginMetadata::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, PluginError::Structure(_)));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(METADATA_FILE), FULL_VALID_JSON)
            .await
            .unwrap();
        let meta = PluginMetadata::load(dir.path()).await.unwrap();
        assert_eq!(meta.name, "SEO Tools");
    }
}
