//! Package extraction and structural validation.
//!
//! A verified artifact is a zip archive. It is unpacked into the staging
//! area after a pre-scan of every entry, and the result must contain the
//! bootstrap module, `plugin.json`, a `src/` and an `assets/` directory.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};

use crate::config::PipelineConfig;
use crate::error::PluginError;
use crate::metadata::{PluginMetadata, METADATA_FILE};

/// WASM magic bytes: `\0asm`.
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Import namespaces a bootstrap module may use. WASI is deliberately absent.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &["env", "extism:host/env"];

pub const SOURCE_DIR: &str = "src";
pub const ASSETS_DIR: &str = "assets";
pub const DEFAULT_SETTINGS_FILE: &str = "config/settings.json";

/// Unix file type bits for a symbolic link.
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy)]
pub struct PackageLimits {
    pub max_files: usize,
    pub max_extracted_size: u64,
    pub max_wasm_size: u64,
}

impl PackageLimits {
    pub fn from_config(config: &PipelineConfig, max_wasm_size: u64) -> Self {
        Self {
            max_files: config.max_package_files,
            max_extracted_size: config.max_extracted_size,
            max_wasm_size,
        }
    }
}

/// A package unpacked into staging that passed structural checks.
#[derive(Debug, Clone)]
pub struct StagedPackage {
    pub root: PathBuf,
    pub metadata: PluginMetadata,
    pub bootstrap_path: PathBuf,
    /// Contents of `config/settings.json`, or empty.
    pub default_settings: Map<String, Value>,
}

/// Unpack `archive_path` into `dest`, which must not exist yet.
///
/// Extraction happens in a scratch directory next to `dest` and is renamed
/// into place, so `dest` only ever appears fully populated.
pub async fn extract(
    archive_path: &Path,
    dest: &Path,
    limits: PackageLimits,
) -> Result<(), PluginError> {
    let archive_path = archive_path.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive_path, &dest, limits))
        .await
        .map_err(|e| PluginError::Io(std::io::Error::other(e.to_string())))?
}

fn extract_blocking(
    archive_path: &Path,
    dest: &Path,
    limits: PackageLimits,
) -> Result<(), PluginError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    // Pre-scan: nothing is written unless every entry is acceptable.
    if archive.len() > limits.max_files {
        return Err(PluginError::Structure(format!(
            "archive has {} entries, limit is {}",
            archive.len(),
            limits.max_files
        )));
    }
    let mut declared_total: u64 = 0;
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        check_entry_name(entry.name())?;
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            return Err(PluginError::Structure(format!(
                "archive contains a symbolic link: '{}'",
                entry.name()
            )));
        }
        declared_total = declared_total.saturating_add(entry.size());
    }
    if declared_total > limits.max_extracted_size {
        return Err(PluginError::Structure(format!(
            "archive expands to {declared_total} bytes, limit is {}",
            limits.max_extracted_size
        )));
    }

    let parent = dest
        .parent()
        .ok_or_else(|| PluginError::Structure(format!("no parent for {}", dest.display())))?;
    std::fs::create_dir_all(parent)?;
    let scratch = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)?;
    let scratch_root = scratch.path().to_path_buf();

    let mut written: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel_path) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(PluginError::Structure(format!(
                "unsafe entry path: '{}'",
                entry.name()
            )));
        };
        let out_path = scratch_root.join(&rel_path);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(dir) = out_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        // Header sizes can lie; cap what is actually inflated.
        let budget = limits.max_extracted_size.saturating_sub(written);
        let copied = std::io::copy(&mut (&mut entry).take(budget.saturating_add(1)), &mut out)?;
        written += copied;
        if written > limits.max_extracted_size {
            return Err(PluginError::Structure(format!(
                "archive expands beyond {} bytes",
                limits.max_extracted_size
            )));
        }
    }

    let root = package_root(&scratch_root)?;
    std::fs::rename(&root, dest)?;

    tracing::debug!(
        archive = %archive_path.display(),
        dest = %dest.display(),
        entries = archive.len(),
        bytes = written,
        "package extracted"
    );
    Ok(())
}

/// Reject absolute paths, `..` components and NUL bytes.
fn check_entry_name(name: &str) -> Result<(), PluginError> {
    if name.contains('\0') {
        return Err(PluginError::Structure(
            "archive entry name contains a NUL byte".into(),
        ));
    }
    let normalized = name.replace('\\', "/");
    let path = Path::new(&normalized);
    let has_drive = normalized.len() >= 2 && normalized.as_bytes()[1] == b':';
    if normalized.starts_with('/') || path.is_absolute() || has_drive {
        return Err(PluginError::Structure(format!(
            "archive entry has an absolute path: '{name}'"
        )));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(PluginError::Structure(format!(
            "archive entry escapes the package: '{name}'"
        )));
    }
    Ok(())
}

/// The extracted root, or its single top-level directory when that holds `plugin.json`.
fn package_root(extracted: &Path) -> Result<PathBuf, PluginError> {
    if extracted.join(METADATA_FILE).is_file() {
        return Ok(extracted.to_path_buf());
    }
    let entries: Vec<_> = std::fs::read_dir(extracted)?.collect::<Result<_, _>>()?;
    if let [only] = entries.as_slice() {
        let candidate = only.path();
        if candidate.is_dir() && candidate.join(METADATA_FILE).is_file() {
            return Ok(candidate);
        }
    }
    Ok(extracted.to_path_buf())
}

/// Check the layout of an extracted package and load what the pipeline needs from it.
pub async fn inspect(root: &Path, limits: PackageLimits) -> Result<StagedPackage, PluginError> {
    if !root.join(METADATA_FILE).is_file() {
        return Err(PluginError::Structure(format!("missing {METADATA_FILE}")));
    }
    let metadata = PluginMetadata::load(root).await?;

    let bootstrap_path = root.join(&metadata.bootstrap);
    if !bootstrap_path.is_file() {
        return Err(PluginError::Structure(format!(
            "missing bootstrap entry point '{}'",
            metadata.bootstrap
        )));
    }
    for dir in [SOURCE_DIR, ASSETS_DIR] {
        if !root.join(dir).is_dir() {
            return Err(PluginError::Structure(format!("missing {dir}/ directory")));
        }
    }

    validate_wasm(&bootstrap_path, limits.max_wasm_size).await?;
    let default_settings = read_default_settings(root).await?;

    Ok(StagedPackage {
        root: root.to_path_buf(),
        metadata,
        bootstrap_path,
        default_settings,
    })
}

/// Default settings shipped in the package, or an empty map when none are declared.
pub async fn read_default_settings(root: &Path) -> Result<Map<String, Value>, PluginError> {
    let path = root.join(DEFAULT_SETTINGS_FILE);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(PluginError::Structure(format!(
            "{DEFAULT_SETTINGS_FILE} must contain a JSON object"
        ))),
        Err(e) => Err(PluginError::Structure(format!(
            "{DEFAULT_SETTINGS_FILE} is not valid JSON: {e}"
        ))),
    }
}

/// Size limit, magic bytes, then import namespaces.
pub async fn validate_wasm(wasm_path: &Path, max_size: u64) -> Result<(), PluginError> {
    let size = tokio::fs::metadata(wasm_path).await?.len();
    if size > max_size {
        return Err(PluginError::Structure(format!(
            "bootstrap module too large: {size} bytes (max: {max_size} bytes)"
        )));
    }

    let wasm_bytes = tokio::fs::read(wasm_path).await?;
    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(PluginError::Structure(
            "bootstrap is not a WebAssembly module: magic bytes mismatch".into(),
        ));
    }

    validate_wasm_imports(&wasm_bytes)
}

fn validate_wasm_imports(wasm_bytes: &[u8]) -> Result<(), PluginError> {
    use wasmparser::{Parser, Payload};

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| PluginError::Structure(format!("failed to parse bootstrap: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    PluginError::Structure(format!("failed to read bootstrap import: {e}"))
                })?;
                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(PluginError::SandboxValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}'); \
                         allowed namespaces: {:?}",
                        import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                    )));
                }
            }
        }
    }

    Ok(())
}

// ─── Test fixtures ──────────────────────────────────────────────────────
