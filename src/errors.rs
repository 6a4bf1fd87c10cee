use crate::services::{
    PipelineError, blob_store::BlobError, inspector::InspectError, registry::RegistryError,
};
use std::{fmt, process::ExitCode};

/// Broad failure classes surfaced to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad caller input.
    Validation,
    /// A uniqueness conflict in the registry.
    Conflict,
    NotFound,
    /// Credential or ACL failure; never retried.
    Permission,
    /// Backend hiccup that persisted through the retries.
    Transient,
    /// Every item of a batch failed.
    BatchFailed,
    Internal,
}

impl ErrorKind {
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::Validation => 2,
            ErrorKind::Conflict => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::Permission => 5,
            ErrorKind::Transient => 6,
            ErrorKind::BatchFailed => 7,
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific kind and message.
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.kind.exit_code())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<InspectError> for AppError {
    fn from(err: InspectError) -> Self {
        let kind = match err {
            InspectError::NotFound(_) => ErrorKind::NotFound,
            InspectError::Unreadable { .. } => ErrorKind::Internal,
        };
        AppError::new(kind, err.to_string())
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        let kind = match err {
            BlobError::InvalidUri(_)
            | BlobError::SchemeMismatch { .. }
            | BlobError::UnsupportedScheme(_)
            | BlobError::Config(_) => ErrorKind::Validation,
            BlobError::NotFound(_) => ErrorKind::NotFound,
            BlobError::Permission { .. } => ErrorKind::Permission,
            BlobError::Transient { .. } => ErrorKind::Transient,
            BlobError::Backend { .. } | BlobError::Tags { .. } | BlobError::Io(_) => {
                ErrorKind::Internal
            }
        };
        AppError::new(kind, err.to_string())
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        let kind = match err {
            RegistryError::InvalidQuery(_)
            | RegistryError::Validation(_)
            | RegistryError::UnsupportedEndpoint(_) => ErrorKind::Validation,
            RegistryError::DatasetExists { .. }
            | RegistryError::FileExists { .. }
            | RegistryError::ConstraintViolation(_) => ErrorKind::Conflict,
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::Corrupt(_) | RegistryError::Sqlx(_) | RegistryError::Io(_) => {
                ErrorKind::Internal
            }
        };
        AppError::new(kind, err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Inspect(err) => err.into(),
            PipelineError::Blob(err) => err.into(),
            PipelineError::Registry(err) => err.into(),
            PipelineError::EmptySource(_) | PipelineError::Validation(_) => {
                AppError::validation(err.to_string())
            }
            PipelineError::SourceNotFound(_) => AppError::not_found(err.to_string()),
            PipelineError::BatchFailed { .. } => {
                AppError::new(ErrorKind::BatchFailed, err.to_string())
            }
            PipelineError::Export { .. } | PipelineError::Io(_) => {
                AppError::internal(err.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(format!("{err:#}"))
    }
}
