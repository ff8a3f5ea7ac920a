//! Pipeline configuration: directories, marketplace endpoint, limits.

use std::path::PathBuf;
use std::time::Duration;

/// Default marketplace cache TTL: one hour.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Default max downloaded package size: 50 MB.
const DEFAULT_MAX_PACKAGE_SIZE_MB: u64 = 50;

/// Default max number of entries in a package archive.
const DEFAULT_MAX_PACKAGE_FILES: usize = 500;

/// Default max total extracted size: 100 MB.
const DEFAULT_MAX_EXTRACTED_MB: u64 = 100;

const DEFAULT_MARKETPLACE_URL: &str = "https://marketplace.folio.example/api/v1";

fn parsed_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> bool {
    lookup(name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Configuration shared by the install pipeline components.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Live plugins root; each plugin lives in `<plugins_dir>/<id>`.
    pub plugins_dir: PathBuf,
    /// Untrusted staging root; never loaded by the live application.
    pub sandbox_dir: PathBuf,
    /// Marketplace API base URL.
    pub marketplace_url: String,
    pub marketplace_cache_ttl: Duration,
    pub http_timeout: Duration,
    /// Version of the running platform, checked against descriptor constraints.
    pub platform_version: String,
    /// Max downloaded artifact size in bytes.
    pub max_package_size: u64,
    pub max_package_files: usize,
    /// Max total uncompressed size in bytes.
    pub max_extracted_size: u64,
    /// Ask the marketplace to validate license keys for paid/trial plugins.
    pub verify_license_online: bool,
    /// Permit plain-HTTP and private-network download URLs (local registries, tests).
    pub allow_insecure_downloads: bool,
}

impl PipelineConfig {
    /// Config with explicit directories and endpoint, defaults elsewhere.
    pub fn new(
        plugins_dir: impl Into<PathBuf>,
        sandbox_dir: impl Into<PathBuf>,
        marketplace_url: impl Into<String>,
        platform_version: impl Into<String>,
    ) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            sandbox_dir: sandbox_dir.into(),
            marketplace_url: marketplace_url.into(),
            marketplace_cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            http_timeout: Duration::from_secs(30),
            platform_version: platform_version.into(),
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE_MB * 1024 * 1024,
            max_package_files: DEFAULT_MAX_PACKAGE_FILES,
            max_extracted_size: DEFAULT_MAX_EXTRACTED_MB * 1024 * 1024,
            verify_license_online: false,
            allow_insecure_downloads: false,
        }
    }

    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build config from any variable source; unset or unparsable values
    /// fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let plugins_dir =
            PathBuf::from(lookup("PLUGIN_DIR").unwrap_or_else(|| "/data/plugins".into()));
        let sandbox_dir = lookup("PLUGIN_SANDBOX_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| plugins_dir.join(".sandbox"));

        Self {
            marketplace_url: lookup("MARKETPLACE_URL")
                .unwrap_or_else(|| DEFAULT_MARKETPLACE_URL.to_string()),
            marketplace_cache_ttl: Duration::from_secs(parsed_or(
                &lookup,
                "MARKETPLACE_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            http_timeout: Duration::from_secs(parsed_or(&lookup, "MARKETPLACE_HTTP_TIMEOUT_SECS", 30)),
            platform_version: lookup("FOLIO_PLATFORM_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            max_package_size: parsed_or(&lookup, "PLUGIN_PACKAGE_MAX_SIZE_MB", DEFAULT_MAX_PACKAGE_SIZE_MB)
                .saturating_mul(1024 * 1024),
            max_package_files: parsed_or(&lookup, "PLUGIN_PACKAGE_MAX_FILES", DEFAULT_MAX_PACKAGE_FILES),
            max_extracted_size: parsed_or(&lookup, "PLUGIN_PACKAGE_MAX_EXTRACTED_MB", DEFAULT_MAX_EXTRACTED_MB)
                .saturating_mul(1024 * 1024),
            verify_license_online: flag(&lookup, "PLUGIN_VERIFY_LICENSE_ONLINE"),
            allow_insecure_downloads: flag(&lookup, "PLUGIN_ALLOW_INSECURE_DOWNLOADS"),
            plugins_dir,
            sandbox_dir,
        }
    }

    /// Private directory for downloaded artifacts awaiting verification.
    pub fn downloads_dir(&self) -> PathBuf {
        self.sandbox_dir.join(".downloads")
    }

    /// Directory of in-flight markers read by startup reconciliation.
    pub fn inflight_dir(&self) -> PathBuf {
        self.sandbox_dir.join(".inflight")
    }

    /// Per-plugin lock files shared by every process using this sandbox.
    pub fn locks_dir(&self) -> PathBuf {
        self.sandbox_dir.join(".locks")
    }

    pub fn marker_path(&self, plugin_id: &str) -> PathBuf {
        self.inflight_dir().join(format!("{plugin_id}.json"))
    }

    /// Per-attempt staging directory.
    pub fn staging_path(&self, plugin_id: &str) -> PathBuf {
        self.sandbox_dir.join(plugin_id)
    }

    pub fn live_path(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir.join(plugin_id)
    }

    /// Where the previous version waits while a new one is promoted.
    pub fn backup_path(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir.join(format!(".{plugin_id}.previous"))
    }

    /// Same-filesystem landing spot used when staging cannot be renamed directly.
    pub fn incoming_path(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir.join(format!(".{plugin_id}.incoming"))
    }

    /// Create the plugin, staging, download and marker directories.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.plugins_dir.clone(),
            self.sandbox_dir.clone(),
            self.downloads_dir(),
            self.inflight_dir(),
            self.locks_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
