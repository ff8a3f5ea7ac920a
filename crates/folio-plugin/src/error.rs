//! Plugin pipeline error types.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("incompatible plugin: {0}")]
    Incompatible(String),

    #[error("license required: {0}")]
    LicenseRequired(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("package verification failed: {0}")]
    Verification(String),

    #[error("malformed package: {0}")]
    Structure(String),

    #[error("invalid plugin metadata: {0}")]
    InvalidMetadata(String),

    #[error("sandbox validation failed: {0}")]
    SandboxValidation(String),

    #[error("plugin {id} is already up to date (installed {installed}, available {available})")]
    AlreadyUpToDate {
        id: String,
        installed: String,
        available: String,
    },

    #[error("unsatisfied dependency '{dependency}': {reason}")]
    UnsatisfiedDependency { dependency: String, reason: String },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("concurrent operation in progress for plugin {0}")]
    ConcurrentOperation(String),

    #[error("promotion rollback failed for plugin {id}: {reason}")]
    PromotionRollback { id: String, reason: String },

    #[error("marketplace unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Copyable classification of a [`PluginError`], reported back to callers
/// inside an install result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Incompatibility,
    LicenseRequired,
    Download,
    Verification,
    Structure,
    SandboxValidation,
    AlreadyUpToDate,
    UnsatisfiedDependency,
    DependencyCycle,
    Registration,
    ConcurrentOperation,
    PromotionRollback,
    RegistryUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Incompatibility => "IncompatibilityError",
            ErrorKind::LicenseRequired => "LicenseRequiredError",
            ErrorKind::Download => "DownloadError",
            ErrorKind::Verification => "VerificationError",
            ErrorKind::Structure => "StructureError",
            ErrorKind::SandboxValidation => "SandboxValidationError",
            ErrorKind::AlreadyUpToDate => "AlreadyUpToDateError",
            ErrorKind::UnsatisfiedDependency => "UnsatisfiedDependencyError",
            ErrorKind::DependencyCycle => "DependencyCycleError",
            ErrorKind::Registration => "RegistrationError",
            ErrorKind::ConcurrentOperation => "ConcurrentOperationError",
            ErrorKind::PromotionRollback => "PromotionRollbackError",
            ErrorKind::RegistryUnavailable => "RegistryUnavailableError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::NotFound(_) => ErrorKind::NotFound,
            PluginError::Incompatible(_) | PluginError::Semver(_) => ErrorKind::Incompatibility,
            PluginError::LicenseRequired(_) => ErrorKind::LicenseRequired,
            PluginError::Download(_) => ErrorKind::Download,
            PluginError::Verification(_) => ErrorKind::Verification,
            PluginError::Structure(_)
            | PluginError::InvalidMetadata(_)
            | PluginError::Archive(_) => ErrorKind::Structure,
            PluginError::SandboxValidation(_) => ErrorKind::SandboxValidation,
            PluginError::AlreadyUpToDate { .. } => ErrorKind::AlreadyUpToDate,
            PluginError::UnsatisfiedDependency { .. } => ErrorKind::UnsatisfiedDependency,
            PluginError::DependencyCycle(_) => ErrorKind::DependencyCycle,
            PluginError::Registration(_) => ErrorKind::Registration,
            PluginError::ConcurrentOperation(_) => ErrorKind::ConcurrentOperation,
            PluginError::PromotionRollback { .. } => ErrorKind::PromotionRollback,
            PluginError::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            PluginError::Database(_) | PluginError::Io(_) | PluginError::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }
}
