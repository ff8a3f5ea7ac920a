//! Folio Plugin Pipeline
//!
//! Acquires third-party plugins from the marketplace, verifies their digest,
//! stages and structurally checks the package, trial-runs the bootstrap in an
//! Extism (wasmtime) sandbox, then atomically promotes the directory and
//! registers it in the database. Any failure leaves the previous state intact.

pub mod config;
pub mod dependency;
pub mod descriptor;
pub mod error;
pub mod lock;
pub mod marketplace;
pub mod metadata;
pub mod orchestrator;
pub mod package;
pub mod reconcile;
pub mod registry;
pub mod sandbox;
pub mod verifier;
pub mod version;

pub use config::PipelineConfig;
pub use descriptor::{LicenseType, PluginDescriptor};
pub use error::{ErrorKind, PluginError};
pub use lock::PluginLocks;
pub use marketplace::MarketplaceClient;
pub use metadata::PluginMetadata;
pub use orchestrator::{InstallOrchestrator, InstallResult, InstallState, Operation, UpdateInfo};
pub use reconcile::ReconcileReport;
pub use registry::{InstalledPlugin, PluginRegistry};
pub use sandbox::{
    BootstrapLoader, PluginCapabilities, SandboxConfig, SandboxExecutor, WasmBootstrapLoader,
};
pub use verifier::PackageVerifier;
pub use version::VersionConstraint;
