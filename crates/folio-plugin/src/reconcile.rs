//! In-flight markers and startup reconciliation.
//!
//! Each pipeline run keeps a small JSON marker under `<sandbox>/.inflight`
//! while it touches the filesystem. A marker that survives a process exit
//! means the run never finished; [`reconcile`] puts the plugin directory
//! back in line with what the registry says is installed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::PluginError;
use crate::lock::PluginLocks;
use crate::orchestrator::{InstallState, Operation};
use crate::registry::PluginRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InflightMarker {
    pub plugin_id: String,
    pub operation: Operation,
    pub target_version: Option<String>,
    pub previous_version: Option<String>,
    /// Last state reached before the process stopped.
    pub phase: InstallState,
    pub fresh_install: bool,
    #[serde(default)]
    pub download_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl InflightMarker {
    /// Write via a temp file and rename so a reader never sees half a marker.
    pub async fn write(&self, path: &Path) -> Result<(), PluginError> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn read(path: &Path) -> Result<Self, PluginError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn remove(path: &Path) -> Result<(), PluginError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Markers found and processed.
    pub markers: usize,
    /// Plugins whose previous version was moved back into place.
    pub restored: Vec<String>,
    /// Live directories removed because the registry never recorded them.
    pub removed: Vec<String>,
    /// Finished runs whose leftovers (backup, staging) were cleared.
    pub finalized: Vec<String>,
    /// Markers left in place because they could not be processed.
    pub failed: Vec<String>,
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Process every leftover marker. Plugins with a pipeline running in this
/// process are skipped.
pub async fn reconcile(
    config: &PipelineConfig,
    registry: &PluginRegistry,
    locks: &PluginLocks,
) -> Result<ReconcileReport, PluginError> {
    let mut report = ReconcileReport::default();
    let dir = config.inflight_dir();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        report.markers += 1;

        let marker = match InflightMarker::read(&path).await {
            Ok(marker) => marker,
            Err(e) => {
                tracing::warn!(path = %path.display(), "unreadable in-flight marker: {e}");
                report.failed.push(path.display().to_string());
                continue;
            }
        };

        let Ok(_guard) = locks.try_acquire(&marker.plugin_id, "reconcile") else {
            tracing::debug!(plugin_id = %marker.plugin_id, "pipeline running; marker left alone");
            continue;
        };

        match reconcile_one(config, registry, &marker, &mut report).await {
            Ok(()) => InflightMarker::remove(&path).await?,
            Err(e) => {
                tracing::error!(
                    plugin_id = %marker.plugin_id,
                    phase = ?marker.phase,
                    "reconciliation failed, marker kept: {e}"
                );
                report.failed.push(marker.plugin_id.clone());
            }
        }
    }

    if report.markers > 0 {
        tracing::info!(
            markers = report.markers,
            restored = report.restored.len(),
            removed = report.removed.len(),
            finalized = report.finalized.len(),
            failed = report.failed.len(),
            "plugin reconciliation finished"
        );
    }
    Ok(report)
}

async fn reconcile_one(
    config: &PipelineConfig,
    registry: &PluginRegistry,
    marker: &InflightMarker,
    report: &mut ReconcileReport,
) -> Result<(), PluginError> {
    let id = marker.plugin_id.as_str();
    let live = config.live_path(id);
    let backup = config.backup_path(id);

    remove_dir_if_exists(&config.staging_path(id)).await?;
    remove_dir_if_exists(&config.incoming_path(id)).await?;
    if let Some(download) = &marker.download_path {
        if let Err(e) = tokio::fs::remove_file(download).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }

    let recorded = registry.get_installed(id).await?;

    match marker.operation {
        Operation::Install | Operation::Update => {
            let registered = match (&recorded, &marker.target_version) {
                (Some(row), Some(target)) => crate::version::compare(&row.version, target).is_eq(),
                _ => false,
            };

            // A matching registry row only proves the swap finished once the
            // marker reached `Promoted` and the new directory is in place.
            let promoted = matches!(
                marker.phase,
                InstallState::Promoted | InstallState::Registered
            ) && tokio::fs::try_exists(&live).await?;

            if tokio::fs::try_exists(&backup).await? {
                if registered && promoted {
                    remove_dir_if_exists(&backup).await?;
                    report.finalized.push(id.to_string());
                } else {
                    remove_dir_if_exists(&live).await?;
                    tokio::fs::rename(&backup, &live).await?;
                    tracing::warn!(plugin_id = id, "restored previous plugin version");
                    report.restored.push(id.to_string());
                }
            } else if marker.fresh_install && recorded.is_none() {
                if tokio::fs::try_exists(&live).await? {
                    remove_dir_if_exists(&live).await?;
                    tracing::warn!(plugin_id = id, "removed unregistered plugin directory");
                    report.removed.push(id.to_string());
                }
            } else {
                report.finalized.push(id.to_string());
            }
        }
        Operation::Uninstall => {
            if recorded.is_none() {
                remove_dir_if_exists(&live).await?;
                remove_dir_if_exists(&backup).await?;
                report.finalized.push(id.to_string());
            } else if !tokio::fs::try_exists(&live).await? && tokio::fs::try_exists(&backup).await? {
                tokio::fs::rename(&backup, &live).await?;
                report.restored.push(id.to_string());
            } else {
                report.finalized.push(id.to_string());
            }
        }
    }

    tracing::debug!(plugin_id = id, phase = ?marker.phase, "in-flight marker reconciled");
    Ok(())
}
