//! Remote marketplace client.
//!
//! Lists published plugins, fetches descriptors, verifies license keys and
//! downloads package artifacts. Listing and descriptor lookups are cached in
//! memory for a configurable TTL; license verification never is.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::descriptor::PluginDescriptor;
use crate::error::PluginError;
use crate::metadata::validate_plugin_id;

const USER_AGENT: &str = concat!("Folio/", env!("CARGO_PKG_VERSION"), " plugin-installer");

/// Cached value with the instant it was fetched.
struct Cached<T> {
    fetched_at: Instant,
    value: T,
}

impl<T: Clone> Cached<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.fetched_at.elapsed() < ttl).then(|| self.value.clone())
    }
}

// ── Wire types ──────────────────────────────────────────────────

/// The listing endpoint returns either an array or an object keyed by id.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Array(Vec<PluginDescriptor>),
    Keyed(BTreeMap<String, PluginDescriptor>),
}

#[derive(Serialize)]
struct LicenseRequest<'a> {
    license_key: &'a str,
}

#[derive(Deserialize)]
struct LicenseResponse {
    valid: bool,
}

/// HTTP client for the plugin marketplace.
pub struct MarketplaceClient {
    http: reqwest::Client,
    base_url: String,
    cache_ttl: Duration,
    max_download_size: u64,
    allow_insecure_downloads: bool,
    list_cache: RwLock<Option<Cached<Vec<PluginDescriptor>>>>,
    detail_cache: RwLock<HashMap<String, Cached<PluginDescriptor>>>,
}

impl MarketplaceClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> Result<Self, PluginError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| PluginError::RegistryUnavailable(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache_ttl,
            max_download_size: u64::MAX,
            allow_insecure_downloads: false,
            list_cache: RwLock::new(None),
            detail_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PluginError> {
        let mut client = Self::new(
            config.marketplace_url.clone(),
            config.http_timeout,
            config.marketplace_cache_ttl,
        )?;
        client.max_download_size = config.max_package_size;
        client.allow_insecure_downloads = config.allow_insecure_downloads;
        Ok(client)
    }

    /// Cap on artifact size in bytes.
    pub fn with_download_limit(mut self, max_bytes: u64) -> Self {
        self.max_download_size = max_bytes;
        self
    }

    /// Allow plain-HTTP and private-network artifact URLs.
    pub fn allow_insecure_downloads(mut self, allow: bool) -> Self {
        self.allow_insecure_downloads = allow;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// All published plugins, sorted by id.
    pub async fn get_available_plugins(&self) -> Result<Vec<PluginDescriptor>, PluginError> {
        if let Some(cached) = self
            .list_cache
            .read()
            .await
            .as_ref()
            .and_then(|c| c.fresh(self.cache_ttl))
        {
            debug!(count = cached.len(), "marketplace listing served from cache");
            return Ok(cached);
        }

        let url = format!("{}/plugins", self.base_url);
        let resp = self.send(self.http.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(PluginError::RegistryUnavailable(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }

        let body: ListResponse = resp
            .json()
            .await
            .map_err(|e| PluginError::RegistryUnavailable(format!("invalid listing: {e}")))?;

        let mut plugins = match body {
            ListResponse::Array(list) => list,
            ListResponse::Keyed(map) => map
                .into_iter()
                .map(|(id, mut d)| {
                    if d.id.is_empty() {
                        d.id = id;
                    }
                    d
                })
                .collect(),
        };
        plugins.retain(|d| {
            let ok = validate_plugin_id(&d.id).is_ok();
            if !ok {
                warn!(plugin_id = %d.id, "skipping marketplace entry with invalid id");
            }
            ok
        });
        plugins.sort_by(|a, b| a.id.cmp(&b.id));

        debug!(count = plugins.len(), "marketplace listing fetched");
        *self.list_cache.write().await = Some(Cached {
            fetched_at: Instant::now(),
            value: plugins.clone(),
        });
        Ok(plugins)
    }

    /// Descriptor of the latest published version of `plugin_id`.
    pub async fn get_plugin_details(
        &self,
        plugin_id: &str,
    ) -> Result<PluginDescriptor, PluginError> {
        validate_plugin_id(plugin_id)
            .map_err(|_| PluginError::NotFound(plugin_id.to_string()))?;

        if let Some(cached) = self
            .detail_cache
            .read()
            .await
            .get(plugin_id)
            .and_then(|c| c.fresh(self.cache_ttl))
        {
            debug!(plugin_id, "plugin descriptor served from cache");
            return Ok(cached);
        }

        let url = format!("{}/plugins/{plugin_id}", self.base_url);
        let resp = self.send(self.http.get(&url)).await?;
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(PluginError::NotFound(plugin_id.to_string())),
            s => {
                return Err(PluginError::RegistryUnavailable(format!(
                    "GET {url} returned {s}"
                )))
            }
        }

        let mut descriptor: PluginDescriptor = resp
            .json()
            .await
            .map_err(|e| PluginError::RegistryUnavailable(format!("invalid descriptor: {e}")))?;
        if descriptor.id.is_empty() {
            descriptor.id = plugin_id.to_string();
        }
        if descriptor.id != plugin_id {
            return Err(PluginError::RegistryUnavailable(format!(
                "marketplace returned descriptor for '{}' when asked for '{plugin_id}'",
                descriptor.id
            )));
        }

        debug!(plugin_id, version = %descriptor.version, "plugin descriptor fetched");
        self.detail_cache.write().await.insert(
            plugin_id.to_string(),
            Cached {
                fetched_at: Instant::now(),
                value: descriptor.clone(),
            },
        );
        Ok(descriptor)
    }

    /// Ask the marketplace whether `license_key` unlocks `plugin_id`.
    pub async fn verify_license(
        &self,
        plugin_id: &str,
        license_key: &str,
    ) -> Result<bool, PluginError> {
        validate_plugin_id(plugin_id)
            .map_err(|_| PluginError::NotFound(plugin_id.to_string()))?;

        let url = format!("{}/plugins/{plugin_id}/licenses/verify", self.base_url);
        let resp = self
            .send(self.http.post(&url).json(&LicenseRequest { license_key }))
            .await?;
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(PluginError::NotFound(plugin_id.to_string())),
            s => {
                return Err(PluginError::RegistryUnavailable(format!(
                    "POST {url} returned {s}"
                )))
            }
        }

        let body: LicenseResponse = resp
            .json()
            .await
            .map_err(|e| PluginError::RegistryUnavailable(format!("invalid license reply: {e}")))?;
        debug!(plugin_id, valid = body.valid, "license verified");
        Ok(body.valid)
    }

    /// Stream the artifact at `url` into `dest`, returning the byte count.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64, PluginError> {
        if !self.allow_insecure_downloads {
            validate_download_url(url)?;
        }

        let mut resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PluginError::Download(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(PluginError::Download(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }
        if let Some(len) = resp.content_length() {
            if len > self.max_download_size {
                return Err(PluginError::Download(format!(
                    "artifact is {len} bytes, limit is {}",
                    self.max_download_size
                )));
            }
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| PluginError::Download(format!("create {}: {e}", dest.display())))?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| PluginError::Download(format!("reading body of {url}: {e}")))?
        {
            written += chunk.len() as u64;
            if written > self.max_download_size {
                return Err(PluginError::Download(format!(
                    "artifact exceeds limit of {} bytes",
                    self.max_download_size
                )));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| PluginError::Download(format!("write {}: {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| PluginError::Download(format!("flush {}: {e}", dest.display())))?;

        debug!(url, bytes = written, "artifact downloaded");
        Ok(written)
    }

    /// Drop every cached listing and descriptor.
    pub async fn invalidate_cache(&self) {
        *self.list_cache.write().await = None;
        self.detail_cache.write().await.clear();
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, PluginError> {
        req.send().await.map_err(|e| {
            warn!("marketplace request failed: {e}");
            PluginError::RegistryUnavailable(e.to_string())
        })
    }
}

/// Only HTTPS artifact URLs on public hosts are fetched.
fn validate_download_url(url: &str) -> Result<(), PluginError> {
    let parsed = url::Url::parse(url)
        .map_err(|_| PluginError::Download(format!("invalid download URL: '{url}'")))?;

    if parsed.scheme() != "https" {
        return Err(PluginError::Download(format!(
            "only HTTPS download URLs are allowed, got scheme '{}' in '{url}'",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host()
        .ok_or_else(|| PluginError::Download(format!("download URL has no host: '{url}'")))?;

    let blocked = match &host {
        url::Host::Domain(name) => ["localhost", "metadata.google.internal"].contains(name),
        url::Host::Ipv4(v4) => is_reserved_v4(*v4),
        url::Host::Ipv6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_reserved_v4(v4),
            None => {
                let first = v6.segments()[0];
                v6.is_loopback()
                    || v6.is_unspecified()
                    || (first & 0xfe00) == 0xfc00
                    || (first & 0xffc0) == 0xfe80
            }
        },
    };
    if blocked {
        return Err(PluginError::Download(format!(
            "download URL host '{host}' is blocked (private/reserved address)"
        )));
    }

    Ok(())
}

fn is_reserved_v4(ip: std::net::Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

// ─── Tests ──────────────────────────────────────────────────────────────
