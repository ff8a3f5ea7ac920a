//! Install/update/uninstall pipeline.
//!
//! Each request runs the state machine
//! `Requested → Fetching → LicenseChecked → Downloading → Verifying → Staged
//! → SandboxValidated → Promoted → Registered`, with `Failed` reachable from
//! every non-terminal state. A per-plugin lock is held for the whole run and
//! any failure triggers a cleanup pass that leaves the previous state intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::dependency;
use crate::descriptor::PluginDescriptor;
use crate::error::{ErrorKind, PluginError};
use crate::lock::PluginLocks;
use crate::marketplace::MarketplaceClient;
use crate::package::{self, PackageLimits};
use crate::reconcile::{self, remove_dir_if_exists, InflightMarker, ReconcileReport};
use crate::registry::{InstalledPlugin, PluginRegistry};
use crate::sandbox::{SandboxConfig, SandboxExecutor};
use crate::verifier::PackageVerifier;
use crate::version::{self, VersionConstraint};

// ─── Public result types ────────────────────────────────────────────────

/// Outcome of an install, update or uninstall request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallResult {
    pub success: bool,
    pub message: String,
    pub error: Option<ErrorKind>,
}

impl InstallResult {
    fn ok(message: String) -> Self {
        Self {
            success: true,
            message,
            error: None,
        }
    }

    fn failed(err: &PluginError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            error: Some(err.kind()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub current: String,
    pub available: String,
    pub changelog: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Install,
    Update,
    Uninstall,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Update => "update",
            Operation::Uninstall => "uninstall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Requested,
    Fetching,
    LicenseChecked,
    Downloading,
    Verifying,
    Staged,
    SandboxValidated,
    Promoted,
    Registered,
    Failed,
}

impl InstallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstallState::Registered | InstallState::Failed)
    }

    /// Forward by one step, or into `Failed` from any non-terminal state.
    pub fn can_transition_to(self, next: InstallState) -> bool {
        use InstallState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Requested, Fetching)
                | (Fetching, LicenseChecked)
                | (LicenseChecked, Downloading)
                | (Downloading, Verifying)
                | (Verifying, Staged)
                | (Staged, SandboxValidated)
                | (SandboxValidated, Promoted)
                | (Promoted, Registered)
        )
    }
}

// ─── Attempt ────────────────────────────────────────────────────────────

/// State of one pipeline run; dropped when the call returns.
struct InstallationAttempt {
    plugin_id: String,
    operation: Operation,
    state: InstallState,
    target_version: Option<String>,
    previous_version: Option<String>,
    fresh_install: bool,
    staging_path: PathBuf,
    marker_path: PathBuf,
    download: Option<tempfile::NamedTempFile>,
    marker_written: bool,
    backup_taken: bool,
    promoted: bool,
    started_at: chrono::DateTime<Utc>,
}

impl InstallationAttempt {
    fn new(operation: Operation, plugin_id: &str, config: &PipelineConfig) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            operation,
            state: InstallState::Requested,
            target_version: None,
            previous_version: None,
            fresh_install: true,
            staging_path: config.staging_path(plugin_id),
            marker_path: config.marker_path(plugin_id),
            download: None,
            marker_written: false,
            backup_taken: false,
            promoted: false,
            started_at: Utc::now(),
        }
    }

    fn advance(&mut self, next: InstallState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(
            plugin_id = %self.plugin_id,
            from = ?self.state,
            to = ?next,
            "pipeline transition"
        );
        self.state = next;
    }

    fn download_path(&self) -> Option<&Path> {
        self.download.as_ref().map(|f| f.path())
    }

    /// Persist where this run stands so a restart can undo it.
    async fn mark(&mut self) -> Result<(), PluginError> {
        let marker = InflightMarker {
            plugin_id: self.plugin_id.clone(),
            operation: self.operation,
            target_version: self.target_version.clone(),
            previous_version: self.previous_version.clone(),
            phase: self.state,
            fresh_install: self.fresh_install,
            download_path: self.download_path().map(Path::to_path_buf),
            started_at: self.started_at,
        };
        marker.write(&self.marker_path).await?;
        self.marker_written = true;
        Ok(())
    }

    fn discard_download(&mut self) {
        if let Some(file) = self.download.take() {
            if let Err(e) = file.close() {
                tracing::warn!(plugin_id = %self.plugin_id, "failed to delete download: {e}");
            }
        }
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────

/// Sequences marketplace, verifier, sandbox and registry for each request.
pub struct InstallOrchestrator {
    config: PipelineConfig,
    marketplace: MarketplaceClient,
    verifier: PackageVerifier,
    sandbox: SandboxExecutor,
    registry: PluginRegistry,
    locks: PluginLocks,
    limits: PackageLimits,
}

impl InstallOrchestrator {
    pub fn new(
        config: PipelineConfig,
        marketplace: MarketplaceClient,
        verifier: PackageVerifier,
        sandbox: SandboxExecutor,
        registry: PluginRegistry,
    ) -> Self {
        let limits = PackageLimits::from_config(&config, SandboxConfig::default().max_wasm_size);
        let locks = PluginLocks::with_dir(config.locks_dir());
        Self {
            config,
            marketplace,
            verifier,
            sandbox,
            registry,
            locks,
            limits,
        }
    }

    /// Cap on the bootstrap module size accepted during staging.
    pub fn with_max_wasm_size(mut self, max_bytes: u64) -> Self {
        self.limits.max_wasm_size = max_bytes;
        self
    }

    pub fn marketplace(&self) -> &MarketplaceClient {
        &self.marketplace
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub async fn install(&self, plugin_id: &str, license_key: Option<&str>) -> InstallResult {
        self.run(Operation::Install, plugin_id, license_key).await
    }

    pub async fn update(&self, plugin_id: &str) -> InstallResult {
        self.run(Operation::Update, plugin_id, None).await
    }

    pub async fn uninstall(&self, plugin_id: &str) -> InstallResult {
        tracing::info!(plugin_id, "uninstall requested");
        let _guard = match self.locks.try_acquire(plugin_id, Operation::Uninstall.as_str()) {
            Ok(guard) => guard,
            Err(e) => return InstallResult::failed(&e),
        };

        match self.remove(plugin_id).await {
            Ok(version) => {
                tracing::info!(plugin_id, version = %version, "plugin uninstalled");
                InstallResult::ok(format!("Plugin {plugin_id} {version} uninstalled"))
            }
            Err(e) => {
                tracing::warn!(plugin_id, kind = %e.kind(), "uninstall failed: {e}");
                InstallResult::failed(&e)
            }
        }
    }

    /// Installed plugins with a newer marketplace version. Read-only.
    pub async fn check_for_updates(&self) -> Result<BTreeMap<String, UpdateInfo>, PluginError> {
        let mut updates = BTreeMap::new();
        for plugin in self.registry.list_installed().await? {
            let descriptor = match self.marketplace.get_plugin_details(&plugin.id).await {
                Ok(d) => d,
                Err(PluginError::NotFound(_)) => {
                    tracing::debug!(plugin_id = %plugin.id, "installed plugin no longer listed");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if version::compare(&plugin.version, &descriptor.version).is_lt() {
                updates.insert(
                    plugin.id.clone(),
                    UpdateInfo {
                        current: plugin.version,
                        available: descriptor.version,
                        changelog: descriptor.changelog,
                    },
                );
            }
        }
        Ok(updates)
    }

    /// Undo whatever interrupted runs left behind. Run once at startup.
    pub async fn reconcile(&self) -> Result<ReconcileReport, PluginError> {
        reconcile::reconcile(&self.config, &self.registry, &self.locks).await
    }

    // ── Pipeline ────────────────────────────────────────────────────

    async fn run(
        &self,
        operation: Operation,
        plugin_id: &str,
        license_key: Option<&str>,
    ) -> InstallResult {
        tracing::info!(plugin_id, operation = operation.as_str(), "plugin pipeline started");

        let _guard = match self.locks.try_acquire(plugin_id, operation.as_str()) {
            Ok(guard) => guard,
            Err(e) => return InstallResult::failed(&e),
        };

        let mut attempt = InstallationAttempt::new(operation, plugin_id, &self.config);
        match self.drive(&mut attempt, license_key).await {
            Ok(record) => {
                tracing::info!(
                    plugin_id,
                    version = %record.version,
                    operation = operation.as_str(),
                    "plugin pipeline finished"
                );
                let verb = match operation {
                    Operation::Update => "updated to",
                    _ => "installed at",
                };
                InstallResult::ok(format!("Plugin {plugin_id} {verb} version {}", record.version))
            }
            Err(e) => {
                tracing::warn!(
                    plugin_id,
                    state = ?attempt.state,
                    kind = %e.kind(),
                    "plugin pipeline failed: {e}"
                );
                attempt.advance(InstallState::Failed);
                let keep_marker = matches!(e, PluginError::PromotionRollback { .. });
                self.cleanup(&mut attempt, keep_marker).await;
                InstallResult::failed(&e)
            }
        }
    }

    async fn drive(
        &self,
        attempt: &mut InstallationAttempt,
        license_key: Option<&str>,
    ) -> Result<InstalledPlugin, PluginError> {
        let plugin_id = attempt.plugin_id.clone();

        // Requested → Fetching
        attempt.advance(InstallState::Fetching);
        let descriptor = self.marketplace.get_plugin_details(&plugin_id).await?;
        attempt.target_version = Some(descriptor.version.clone());

        let current = self.registry.get_installed(&plugin_id).await?;
        if attempt.operation == Operation::Update {
            let Some(installed) = &current else {
                return Err(PluginError::NotFound(format!("{plugin_id} is not installed")));
            };
            if version::compare(&installed.version, &descriptor.version).is_ge() {
                return Err(PluginError::AlreadyUpToDate {
                    id: plugin_id,
                    installed: installed.version.clone(),
                    available: descriptor.version.clone(),
                });
            }
        }
        attempt.previous_version = current.as_ref().map(|p| p.version.clone());
        attempt.fresh_install = current.is_none();

        self.check_compatibility(&descriptor)?;
        self.check_graph(&descriptor, attempt.fresh_install).await?;

        // Fetching → LicenseChecked
        if attempt.operation == Operation::Install {
            self.check_license(&descriptor, license_key).await?;
        }
        attempt.advance(InstallState::LicenseChecked);

        // LicenseChecked → Downloading
        attempt.advance(InstallState::Downloading);
        let downloads = self.config.downloads_dir();
        tokio::fs::create_dir_all(&downloads).await?;
        tokio::fs::create_dir_all(self.config.inflight_dir()).await?;
        attempt.download = Some(
            tempfile::Builder::new()
                .prefix(&format!("{plugin_id}-"))
                .suffix(".zip")
                .tempfile_in(&downloads)?,
        );
        attempt.mark().await?;
        let download_path = attempt
            .download_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| PluginError::Download("no download location".into()))?;
        self.marketplace
            .download(&descriptor.download_url, &download_path)
            .await?;

        // Downloading → Verifying
        attempt.advance(InstallState::Verifying);
        if !self
            .verifier
            .verify(&download_path, &descriptor.signature)
            .await?
        {
            attempt.discard_download();
            return Err(PluginError::Verification(format!(
                "digest of {plugin_id} {} does not match the published signature",
                descriptor.version
            )));
        }

        // Verifying → Staged
        remove_dir_if_exists(&attempt.staging_path).await?;
        package::extract(&download_path, &attempt.staging_path, self.limits).await?;
        attempt.discard_download();
        let staged = package::inspect(&attempt.staging_path, self.limits).await?;
        staged
            .metadata
            .ensure_matches(&plugin_id, &descriptor.version)?;
        attempt.advance(InstallState::Staged);

        // Staged → SandboxValidated
        self.sandbox.execute(&staged).await?;
        attempt.advance(InstallState::SandboxValidated);

        // SandboxValidated → Promoted
        attempt.mark().await?;
        self.promote(attempt).await?;
        attempt.advance(InstallState::Promoted);
        attempt.mark().await?;

        // Promoted → Registered
        let record = InstalledPlugin::from_descriptor(&descriptor, staged.default_settings);
        let registered = match self.register(&record).await {
            Ok(registered) => registered,
            Err(e) => {
                tracing::error!(
                    plugin_id = %plugin_id,
                    version = %descriptor.version,
                    "registration failed after promotion, rolling back filesystem: {e}"
                );
                return match self.rollback_promotion(attempt).await {
                    Ok(()) => {
                        tracing::error!(plugin_id = %plugin_id, "filesystem promotion rolled back");
                        Err(PluginError::Registration(e.to_string()))
                    }
                    Err(rollback) => {
                        tracing::error!(
                            plugin_id = %plugin_id,
                            "filesystem rollback failed, plugin directory and registry disagree: {rollback}"
                        );
                        Err(PluginError::PromotionRollback {
                            id: plugin_id,
                            reason: format!("registration failed ({e}); rollback failed ({rollback})"),
                        })
                    }
                };
            }
        };
        attempt.advance(InstallState::Registered);

        if attempt.backup_taken {
            if let Err(e) = remove_dir_if_exists(&self.config.backup_path(&plugin_id)).await {
                tracing::warn!(plugin_id = %plugin_id, "could not remove previous version: {e}");
            }
        }
        if let Err(e) = InflightMarker::remove(&attempt.marker_path).await {
            tracing::warn!(plugin_id = %plugin_id, "failed to remove in-flight marker: {e}");
        }
        Ok(registered)
    }

    fn check_compatibility(&self, descriptor: &PluginDescriptor) -> Result<(), PluginError> {
        let Some(raw) = descriptor.requires_platform_version.as_deref() else {
            return Ok(());
        };
        let constraint = VersionConstraint::parse(raw)?;
        if !constraint.matches(&self.config.platform_version) {
            return Err(PluginError::Incompatible(format!(
                "{} {} requires platform {constraint}, running {}",
                descriptor.id, descriptor.version, self.config.platform_version
            )));
        }
        Ok(())
    }

    async fn check_graph(
        &self,
        descriptor: &PluginDescriptor,
        fresh_install: bool,
    ) -> Result<(), PluginError> {
        let installed = self.registry.list_installed().await?;
        dependency::check_dependencies(&descriptor.dependencies, &installed)?;
        if !fresh_install {
            dependency::check_consumers(&descriptor.id, &descriptor.version, &installed)?;
        }
        dependency::check_acyclic(&descriptor.id, &descriptor.dependencies, &installed)
    }

    async fn check_license(
        &self,
        descriptor: &PluginDescriptor,
        license_key: Option<&str>,
    ) -> Result<(), PluginError> {
        if !descriptor.license_type.requires_key() {
            return Ok(());
        }
        let key = license_key.map(str::trim).filter(|k| !k.is_empty());
        let Some(key) = key else {
            return Err(PluginError::LicenseRequired(format!(
                "{} is a {} plugin and needs a license key",
                descriptor.id, descriptor.license_type
            )));
        };
        if self.config.verify_license_online
            && !self.marketplace.verify_license(&descriptor.id, key).await?
        {
            return Err(PluginError::LicenseRequired(format!(
                "license key rejected for {}",
                descriptor.id
            )));
        }
        Ok(())
    }

    /// Move staging into the live directory, setting any previous version aside.
    async fn promote(&self, attempt: &mut InstallationAttempt) -> Result<(), PluginError> {
        let id = attempt.plugin_id.as_str();
        let live = self.config.live_path(id);
        let backup = self.config.backup_path(id);
        tokio::fs::create_dir_all(&self.config.plugins_dir).await?;

        if tokio::fs::try_exists(&backup).await? {
            tracing::warn!(plugin_id = id, "removing stale previous-version directory");
            remove_dir_if_exists(&backup).await?;
        }
        if tokio::fs::try_exists(&live).await? {
            tokio::fs::rename(&live, &backup).await?;
            attempt.backup_taken = true;
        }

        if let Err(e) = tokio::fs::rename(&attempt.staging_path, &live).await {
            tracing::warn!(plugin_id = id, "direct rename failed ({e}), copying via incoming dir");
            let incoming = self.config.incoming_path(id);
            let copied = async {
                remove_dir_if_exists(&incoming).await?;
                copy_dir_recursive(&attempt.staging_path, &incoming).await?;
                tokio::fs::rename(&incoming, &live).await?;
                Ok::<(), PluginError>(())
            }
            .await;
            if let Err(e) = copied {
                if let Err(rm) = remove_dir_if_exists(&incoming).await {
                    tracing::warn!(plugin_id = id, "failed to remove incoming directory: {rm}");
                }
                if let Err(restore) = self.restore_backup(attempt).await {
                    tracing::error!(
                        plugin_id = %attempt.plugin_id,
                        "promotion failed and the previous version could not be restored: {restore}"
                    );
                    return Err(PluginError::PromotionRollback {
                        id: attempt.plugin_id.clone(),
                        reason: format!("promotion failed ({e}); restore failed ({restore})"),
                    });
                }
                return Err(e);
            }
            remove_dir_if_exists(&attempt.staging_path).await?;
        }

        attempt.promoted = true;
        tracing::debug!(plugin_id = id, live = %live.display(), "package promoted");
        Ok(())
    }

    /// Put the live directory back the way it was before `promote`.
    async fn rollback_promotion(&self, attempt: &mut InstallationAttempt) -> Result<(), PluginError> {
        if attempt.promoted {
            remove_dir_if_exists(&self.config.live_path(&attempt.plugin_id)).await?;
            attempt.promoted = false;
        }
        self.restore_backup(attempt).await
    }

    /// Move a set-aside previous version back to the live path, if one was taken.
    async fn restore_backup(&self, attempt: &mut InstallationAttempt) -> Result<(), PluginError> {
        if !attempt.backup_taken {
            return Ok(());
        }
        let live = self.config.live_path(&attempt.plugin_id);
        remove_dir_if_exists(&live).await?;
        tokio::fs::rename(self.config.backup_path(&attempt.plugin_id), &live).await?;
        attempt.backup_taken = false;
        Ok(())
    }

    async fn register(&self, record: &InstalledPlugin) -> Result<InstalledPlugin, PluginError> {
        let txn = self.registry.begin().await?;
        match txn.upsert_installed(record).await {
            Ok(registered) => {
                txn.commit().await?;
                Ok(registered)
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    tracing::warn!(plugin_id = %record.id, "transaction rollback failed: {rb}");
                }
                Err(e)
            }
        }
    }

    /// Remove staging, the download and any half-done promotion.
    async fn cleanup(&self, attempt: &mut InstallationAttempt, keep_marker: bool) {
        let id = attempt.plugin_id.clone();
        attempt.discard_download();

        if let Err(e) = remove_dir_if_exists(&attempt.staging_path).await {
            tracing::warn!(plugin_id = %id, "failed to remove staging directory: {e}");
        }
        if let Err(e) = self.rollback_promotion(attempt).await {
            tracing::error!(plugin_id = %id, "failed to undo promotion during cleanup: {e}");
            return;
        }
        if attempt.marker_written && !keep_marker {
            if let Err(e) = InflightMarker::remove(&attempt.marker_path).await {
                tracing::warn!(plugin_id = %id, "failed to remove in-flight marker: {e}");
            }
        }
    }

    async fn remove(&self, plugin_id: &str) -> Result<String, PluginError> {
        let installed = self
            .registry
            .get_installed(plugin_id)
            .await?
            .ok_or_else(|| PluginError::NotFound(format!("{plugin_id} is not installed")))?;
        dependency::check_removal(plugin_id, &self.registry.list_installed().await?)?;

        let mut attempt = InstallationAttempt::new(Operation::Uninstall, plugin_id, &self.config);
        attempt.previous_version = Some(installed.version.clone());
        attempt.fresh_install = false;
        tokio::fs::create_dir_all(self.config.inflight_dir()).await?;
        attempt.mark().await?;

        let txn = match self.registry.begin().await {
            Ok(txn) => txn,
            Err(e) => {
                InflightMarker::remove(&attempt.marker_path).await?;
                return Err(registry_write_error(e));
            }
        };
        if let Err(e) = txn.remove_installed(plugin_id).await {
            if let Err(rb) = txn.rollback().await {
                tracing::warn!(plugin_id, "transaction rollback failed: {rb}");
            }
            InflightMarker::remove(&attempt.marker_path).await?;
            return Err(registry_write_error(e));
        }
        if let Err(e) = txn.commit().await {
            InflightMarker::remove(&attempt.marker_path).await?;
            return Err(registry_write_error(e));
        }

        let live = self.config.live_path(plugin_id);
        let backup = self.config.backup_path(plugin_id);
        if tokio::fs::try_exists(&live).await? {
            remove_dir_if_exists(&backup).await?;
            tokio::fs::rename(&live, &backup).await?;
        }
        remove_dir_if_exists(&backup).await?;
        InflightMarker::remove(&attempt.marker_path).await?;
        Ok(installed.version)
    }
}

/// Database failures while changing the registry are registration failures;
/// other errors keep their own kind.
fn registry_write_error(e: PluginError) -> PluginError {
    match e {
        PluginError::Database(db) => PluginError::Registration(db.to_string()),
        other => other,
    }
}

/// Recursively copy a directory and its contents.
async fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<(), PluginError> {
    tokio::fs::create_dir_all(dest).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        let dest_path = dest.join(entry.file_name());
        if entry.file_type().await?.is_dir() {
            Box::pin(copy_dir_recursive(&entry_path, &dest_path)).await?;
        } else {
            tokio::fs::copy(&entry_path, &dest_path).await?;
        }
    }
    Ok(())
}
