//! Marketplace plugin descriptors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Commercial terms attached to a plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseType {
    #[default]
    Free,
    Paid,
    Trial,
}

impl LicenseType {
    /// Paid and trial plugins need a license key to install.
    pub fn requires_key(self) -> bool {
        !matches!(self, LicenseType::Free)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LicenseType::Free => "free",
            LicenseType::Paid => "paid",
            LicenseType::Trial => "trial",
        }
    }

    /// Parse a stored value; unknown strings fall back to `Free`.
    pub fn from_db(value: &str) -> Self {
        match value {
            "paid" => LicenseType::Paid,
            "trial" => LicenseType::Trial,
            _ => LicenseType::Free,
        }
    }
}

impl fmt::Display for LicenseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry metadata for one published plugin version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Filled from the map key when the registry returns an object keyed by id.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub license_type: LicenseType,
    /// Constraint on the host platform version, e.g. `>=2.0`.
    #[serde(default)]
    pub requires_platform_version: Option<String>,
    /// Dependency id to version constraint.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    pub download_url: String,
    /// Hex SHA-256 of the artifact at `download_url`.
    pub signature: String,
    #[serde(default)]
    pub changelog: Option<String>,
}
