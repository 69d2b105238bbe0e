use std::path::PathBuf;

use gguf_parser::GGUFError;
use serde::Serialize;
use thiserror::Error;

use crate::digest::Digest;

/// Where in an import the failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Staging,
    Verifying,
    Committing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Staging => "staging",
            Stage::Verifying => "verifying",
            Stage::Committing => "committing",
        })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on '{}': {source}", path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob {0} not found")]
    BlobNotFound(Digest),

    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    #[error("Integrity check failed for {digest}: {detail}")]
    Integrity { digest: Digest, detail: String },

    #[error("Invalid model file: {0}")]
    InvalidModelFile(#[from] GGUFError),

    #[error("Model '{0}' already exists")]
    DuplicateModel(String),

    #[error("Invalid model name '{name}': {reason}")]
    InvalidModelName { name: String, reason: String },

    #[error("Corrupt manifest '{}': {reason}", path.display())]
    CorruptManifest { path: PathBuf, reason: String },

    #[error("Export of '{name}' failed: {source}")]
    ExportFailed {
        name: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Import of '{name}' failed while {stage}: {source}")]
    ImportFailed {
        name: String,
        stage: Stage,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification used by callers that map errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StorageIo,
    NotFound,
    Integrity,
    Format,
    Conflict,
    InvalidInput,
    Cancelled,
}

/// Terminal notification category handed to the presentation layer for
/// localisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKey {
    LoadFailure,
    ExportFailure,
    ImportFailure,
    Success,
    Cancelled,
}

impl MessageKey {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKey::LoadFailure => "load_failure",
            MessageKey::ExportFailure => "export_failure",
            MessageKey::ImportFailure => "import_failure",
            MessageKey::Success => "success",
            MessageKey::Cancelled => "cancelled",
        }
    }
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::StorageIo {
            path: path.into(),
            source,
        }
    }

    /// Classification of the innermost cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::StorageIo { .. } => ErrorKind::StorageIo,
            StoreError::BlobNotFound(_) | StoreError::ModelNotFound(_) => ErrorKind::NotFound,
            StoreError::Integrity { .. } | StoreError::CorruptManifest { .. } => {
                ErrorKind::Integrity
            }
            StoreError::InvalidModelFile(GGUFError::Io(_)) => ErrorKind::StorageIo,
            StoreError::InvalidModelFile(_) => ErrorKind::Format,
            StoreError::DuplicateModel(_) => ErrorKind::Conflict,
            StoreError::InvalidModelName { .. } => ErrorKind::InvalidInput,
            StoreError::ExportFailed { source, .. } | StoreError::ImportFailed { source, .. } => {
                source.kind()
            }
            StoreError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Disk failures may succeed on retry; nothing else will.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StorageIo
    }

    pub fn message_key(&self) -> MessageKey {
        match self {
            StoreError::Cancelled => MessageKey::Cancelled,
            StoreError::ExportFailed { .. } => MessageKey::ExportFailure,
            StoreError::ImportFailed { .. } | StoreError::DuplicateModel(_) => {
                MessageKey::ImportFailure
            }
            _ => MessageKey::LoadFailure,
        }
    }

    /// The wrapped cause of an `ExportFailed`/`ImportFailed`, or `self`.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::ExportFailed { source, .. } | StoreError::ImportFailed { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
