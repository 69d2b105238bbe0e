//! Model storage and transfer engine.
//!
//! Manages the serving runtime's on-disk model store (content-addressed
//! blobs plus per-name manifests) and moves models in and out of it as
//! standalone GGUF files.
//!
//! * [`BlobStore`]: SHA-256 addressed blobs with streaming verification
//!   and in-memory reference counts.
//! * [`ManifestStore`]: per-name manifests, committed atomically under a
//!   per-name lock.
//! * [`Engine`]: import/export with progress, cancellation and cleanup
//!   of staged blobs on any failure.

pub mod blob;
pub mod catalog;
pub mod digest;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod name;
pub mod session;

pub use blob::{BlobStore, PruneReport};
pub use catalog::{ModelDetails, ModelEntry, human_parameter_size};
pub use digest::Digest;
pub use engine::{Engine, EngineOptions, ImportRequest};
pub use error::{ErrorKind, MessageKey, Result, Stage, StoreError};
pub use layout::{MODELS_ENV, StoreLayout};
pub use manifest::{Layer, LayerRole, Manifest, ManifestRecord, ManifestStore, ModelConfig};
pub use name::ModelName;
pub use session::{
    ProgressSink, SessionId, SessionRegistry, TransferKind, TransferSession, TransferSnapshot,
    TransferState,
};
