//! Sandboxed trial instantiation of a staged plugin.
//!
//! The bootstrap module is loaded into an Extism (wasmtime) instance with
//! no WASI, no host functions, bounded memory and fuel, and outbound HTTP
//! limited to the hosts the package declares. Nothing it does can reach
//! the live registry or settings store.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::package::StagedPackage;

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per call (default: 1_000_000).
    pub fuel_limit: u64,
    /// Maximum bootstrap module size in bytes (default: 10 MB).
    pub max_wasm_size: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            max_wasm_size: 10 * 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Unset or unparsable variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let megabytes = |name: &str| {
            lookup(name)
                .and_then(|v| v.parse::<u64>().ok())
                .map(|mb| mb.saturating_mul(1024 * 1024))
        };
        Self {
            memory_limit: megabytes("PLUGIN_MEMORY_LIMIT_MB")
                .and_then(|bytes| usize::try_from(bytes).ok())
                .unwrap_or(defaults.memory_limit),
            fuel_limit: lookup("PLUGIN_FUEL_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fuel_limit),
            max_wasm_size: megabytes("PLUGIN_SANDBOX_MAX_WASM_SIZE_MB")
                .unwrap_or(defaults.max_wasm_size),
        }
    }
}

// ─── Capability interface ───────────────────────────────────────────────

/// Identity a plugin reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
}

/// Outcome of a plugin's own requirement self-check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementReport {
    pub satisfied: bool,
    #[serde(default)]
    pub missing: Vec<String>,
}

/// Operations every installable plugin must provide.
pub trait PluginCapabilities {
    fn activate(&mut self) -> Result<(), PluginError>;
    fn deactivate(&mut self) -> Result<(), PluginError>;
    fn settings(&mut self) -> Result<serde_json::Value, PluginError>;
    /// Names of the hooks the plugin subscribes to.
    fn register_hooks(&mut self) -> Result<Vec<String>, PluginError>;
    fn metadata(&mut self) -> Result<CapabilityMetadata, PluginError>;
    fn check_requirements(&mut self) -> Result<RequirementReport, PluginError>;
}

/// Turns a staged package into a live capability object.
pub trait BootstrapLoader: Send + Sync {
    fn load(&self, package: &StagedPackage) -> Result<Box<dyn PluginCapabilities>, PluginError>;
}

// ─── Extism binding ─────────────────────────────────────────────────────

/// Exports a bootstrap module must provide, one per capability.
pub const REQUIRED_EXPORTS: &[&str] = &[
    "activate",
    "deactivate",
    "settings",
    "register_hooks",
    "metadata",
    "check_requirements",
];

/// A WASM module running inside an Extism sandbox.
pub struct PluginSandbox {
    plugin: extism::Plugin,
    plugin_id: String,
}

impl std::fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

impl PluginSandbox {
    /// Load a module with memory pages and fuel capped, WASI off.
    pub fn load(
        wasm_path: &Path,
        config: &SandboxConfig,
        plugin_id: &str,
        allowed_hosts: &[String],
    ) -> Result<Self, PluginError> {
        let wasm_bytes = std::fs::read(wasm_path)?;

        let manifest = extism::Manifest::new([extism::Wasm::data(wasm_bytes)])
            .with_memory_max((config.memory_limit / 65536) as u32)
            .with_allowed_hosts(allowed_hosts.iter().cloned());

        let plugin = extism::PluginBuilder::new(manifest)
            .with_wasi(false)
            .with_fuel_limit(config.fuel_limit)
            .build()
            .map_err(|e| {
                PluginError::SandboxValidation(format!("bootstrap failed to instantiate: {e}"))
            })?;

        Ok(Self {
            plugin,
            plugin_id: plugin_id.to_string(),
        })
    }

    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, PluginError> {
        self.plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| {
                let msg = e.to_string();
                let reason = if msg.contains("fuel") {
                    "fuel exhausted".to_string()
                } else if msg.contains("memory") {
                    "memory limit exceeded".to_string()
                } else {
                    msg
                };
                PluginError::SandboxValidation(format!(
                    "{}::{function_name} failed: {reason}",
                    self.plugin_id
                ))
            })
    }

    fn call_json<O: serde::de::DeserializeOwned>(
        &mut self,
        function_name: &str,
    ) -> Result<O, PluginError> {
        let output = self.call(function_name, b"{}")?;
        serde_json::from_slice(&output).map_err(|e| {
            PluginError::SandboxValidation(format!(
                "{function_name} returned malformed output: {e}"
            ))
        })
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.plugin.function_exists(name)
    }
}

/// [`PluginCapabilities`] backed by the exports of a sandboxed module.
#[derive(Debug)]
pub struct WasmPlugin {
    sandbox: PluginSandbox,
}

impl WasmPlugin {
    /// Wrap a sandbox, refusing modules that lack any capability export.
    pub fn new(sandbox: PluginSandbox) -> Result<Self, PluginError> {
        let missing: Vec<_> = REQUIRED_EXPORTS
            .iter()
            .filter(|name| !sandbox.has_function(name))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(PluginError::SandboxValidation(format!(
                "bootstrap is missing required exports: {}",
                missing.join(", ")
            )));
        }
        Ok(Self { sandbox })
    }
}

impl PluginCapabilities for WasmPlugin {
    fn activate(&mut self) -> Result<(), PluginError> {
        self.sandbox.call("activate", b"{}").map(|_| ())
    }

    fn deactivate(&mut self) -> Result<(), PluginError> {
        self.sandbox.call("deactivate", b"{}").map(|_| ())
    }

    fn settings(&mut self) -> Result<serde_json::Value, PluginError> {
        self.sandbox.call_json("settings")
    }

    fn register_hooks(&mut self) -> Result<Vec<String>, PluginError> {
        self.sandbox.call_json("register_hooks")
    }

    fn metadata(&mut self) -> Result<CapabilityMetadata, PluginError> {
        self.sandbox.call_json("metadata")
    }

    fn check_requirements(&mut self) -> Result<RequirementReport, PluginError> {
        self.sandbox.call_json("check_requirements")
    }
}

/// Default loader: staged bootstrap module through Extism.
#[derive(Debug, Clone, Default)]
pub struct WasmBootstrapLoader {
    config: SandboxConfig,
}

impl WasmBootstrapLoader {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

impl BootstrapLoader for WasmBootstrapLoader {
    fn load(&self, package: &StagedPackage) -> Result<Box<dyn PluginCapabilities>, PluginError> {
        let sandbox = PluginSandbox::load(
            &package.bootstrap_path,
            &self.config,
            &package.metadata.id,
            &package.metadata.permissions.http_hosts,
        )?;
        Ok(Box::new(WasmPlugin::new(sandbox)?))
    }
}

// ─── Executor ───────────────────────────────────────────────────────────

/// Instantiates staged plugins and runs their self-checks off the async runtime.
#[derive(Clone)]
pub struct SandboxExecutor {
    loader: Arc<dyn BootstrapLoader>,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor").finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    pub fn new(loader: Arc<dyn BootstrapLoader>) -> Self {
        Self { loader }
    }

    pub fn wasm(config: SandboxConfig) -> Self {
        Self::new(Arc::new(WasmBootstrapLoader::new(config)))
    }

    /// Instantiate the package and require a passing requirement check.
    ///
    /// Any error or panic inside the plugin becomes `SandboxValidation`.
    pub async fn execute(&self, package: &StagedPackage) -> Result<(), PluginError> {
        let loader = Arc::clone(&self.loader);
        let package = package.clone();
        let plugin_id = package.metadata.id.clone();

        let outcome = tokio::task::spawn_blocking(move || trial_run(loader.as_ref(), &package)).await;

        let result = match outcome {
            Ok(result) => result.map_err(|e| match e {
                PluginError::SandboxValidation(_) => e,
                other => PluginError::SandboxValidation(other.to_string()),
            }),
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Err(PluginError::SandboxValidation(format!(
                    "bootstrap panicked: {msg}"
                )))
            }
            Err(join) => Err(PluginError::SandboxValidation(join.to_string())),
        };

        match &result {
            Ok(()) => tracing::debug!(plugin_id = %plugin_id, "sandbox validation passed"),
            Err(e) => tracing::warn!(plugin_id = %plugin_id, "sandbox validation failed: {e}"),
        }
        result
    }
}

fn trial_run(loader: &dyn BootstrapLoader, package: &StagedPackage) -> Result<(), PluginError> {
    let mut plugin = loader.load(package)?;

    let reported = plugin.metadata()?;
    if reported.id != package.metadata.id {
        return Err(PluginError::SandboxValidation(format!(
            "bootstrap reports id '{}' but package is '{}'",
            reported.id, package.metadata.id
        )));
    }

    let report = plugin.check_requirements()?;
    if !report.satisfied {
        return Err(PluginError::SandboxValidation(format!(
            "plugin requirements not met: {}",
            if report.missing.is_empty() {
                "unspecified".to_string()
            } else {
                report.missing.join(", ")
            }
        )));
    }
    Ok(())
}

// ─── Test doubles ───────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;

    /// How a [`FakeLoader`] plugin behaves during the trial run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behavior {
        Healthy,
        FailsInstantiation,
        PanicsInstantiation,
        UnmetRequirements,
    }

    pub struct FakeLoader(pub Behavior);

    struct FakePlugin {
        meta: CapabilityMetadata,
        behavior: Behavior,
    }

    impl PluginCapabilities for FakePlugin {
        fn activate(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
        fn deactivate(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
        fn settings(&mut self) -> Result<serde_json::Value, PluginError> {
            Ok(serde_json::json!({}))
        }
        fn register_hooks(&mut self) -> Result<Vec<String>, PluginError> {
            Ok(vec!["on_publish".into()])
        }
        fn metadata(&mut self) -> Result<CapabilityMetadata, PluginError> {
            Ok(self.meta.clone())
        }
        fn check_requirements(&mut self) -> Result<RequirementReport, PluginError> {
            Ok(RequirementReport {
                satisfied: self.behavior != Behavior::UnmetRequirements,
                missing: vec!["ext-intl".into()],
            })
        }
    }

    impl BootstrapLoader for FakeLoader {
        fn load(
            &self,
            package: &StagedPackage,
        ) -> Result<Box<dyn PluginCapabilities>, PluginError> {
            match self.0 {
                Behavior::FailsInstantiation => {
                    Err(PluginError::Io(std::io::Error::other("constructor threw")))
                }
                Behavior::PanicsInstantiation => panic!("constructor exploded"),
                behavior => Ok(Box::new(FakePlugin {
                    meta: CapabilityMetadata {
                        id: package.metadata.id.clone(),
                        name: package.metadata.name.clone(),
                        version: package.metadata.version.clone(),
                    },
                    behavior,
                })),
            }
        }
    }

    pub fn executor(behavior: Behavior) -> SandboxExecutor {
        SandboxExecutor::new(Arc::new(FakeLoader(behavior)))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
