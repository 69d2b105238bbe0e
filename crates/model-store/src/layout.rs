//! On-disk layout of the serving runtime's model directory.
//!
//! ```text
//! <root>/blobs/sha256-<hex>
//! <root>/manifests/<host>/<namespace>/<model>/<tag>
//! ```

use std::path::{Path, PathBuf};

use crate::digest::Digest;
use crate::name::ModelName;

/// Environment variable the runtime itself honours for the models root.
pub const MODELS_ENV: &str = "OLLAMA_MODELS";

#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$OLLAMA_MODELS`, else `~/.ollama/models`.
    pub fn default_root() -> PathBuf {
        if let Ok(dir) = std::env::var(MODELS_ENV)
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ollama")
            .join("models")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.file_name())
    }

    pub fn manifest_path(&self, name: &ModelName) -> PathBuf {
        self.manifests_dir()
            .join(name.host())
            .join(name.namespace())
            .join(name.model())
            .join(name.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_runtime_layout() {
        let layout = StoreLayout::new("/models");
        let name: ModelName = "demo".parse().unwrap();
        assert_eq!(
            layout.manifest_path(&name),
            PathBuf::from("/models/manifests/registry.ollama.ai/library/demo/latest")
        );
        let d = Digest::of(b"abc");
        assert_eq!(
            layout.blob_path(&d),
            PathBuf::from(format!("/models/blobs/sha256-{}", d.hex()))
        );
    }
}
