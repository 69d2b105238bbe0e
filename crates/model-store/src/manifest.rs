//! Model manifests: Docker v2-style JSON records mapping a model name to
//! its config blob and ordered layer blobs.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, PruneReport};
use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::fsutil::{self, TEMP_PREFIX};
use crate::layout::StoreLayout;
use crate::lock::NameLocks;
use crate::name::ModelName;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_GGUF_HEADER: &str = "application/vnd.ollama.image.gguf.header";
pub const MEDIA_TYPE_GGUF_TENSOR: &str = "application/vnd.ollama.image.gguf.tensor";
pub const MEDIA_TYPE_MODEL: &str = "application/vnd.ollama.image.model";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Layer,
    pub layers: Vec<Layer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// What a layer contributes to an exported GGUF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerRole {
    /// GGUF header, metadata table and tensor index.
    Metadata,
    /// One tensor's payload.
    Tensor,
    /// A complete GGUF file in a single blob.
    Model,
    /// Template, params, license and the like.
    Other,
}

impl Layer {
    pub fn new(media_type: &str, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            from: None,
        }
    }

    pub fn role(&self) -> LayerRole {
        match self.media_type.as_str() {
            MEDIA_TYPE_GGUF_HEADER => LayerRole::Metadata,
            MEDIA_TYPE_GGUF_TENSOR => LayerRole::Tensor,
            MEDIA_TYPE_MODEL => LayerRole::Model,
            _ => LayerRole::Other,
        }
    }
}

impl Manifest {
    pub fn new(config: Layer, layers: Vec<Layer>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config,
            layers,
        }
    }

    /// Config digest followed by every layer digest, with repeats.
    pub fn digests(&self) -> impl Iterator<Item = &Digest> {
        std::iter::once(&self.config.digest).chain(self.layers.iter().map(|l| &l.digest))
    }

    /// Config plus layer sizes.
    pub fn total_size(&self) -> u64 {
        self.config.size + self.layers.iter().map(|l| l.size).sum::<u64>()
    }

    pub fn count_role(&self, role: LayerRole) -> usize {
        self.layers.iter().filter(|l| l.role() == role).count()
    }
}

/// Contents of the config blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_format: String,
    #[serde(default)]
    pub model_family: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_families: Vec<String>,
    /// Human parameter size, e.g. `7.2B`.
    #[serde(default)]
    pub model_type: String,
    /// Quantisation name, e.g. `Q4_K_M`.
    #[serde(default)]
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_count: Option<u64>,
    #[serde(default)]
    pub rootfs: RootFs,
    /// Fields written by other tools, preserved as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".into(),
            diff_ids: Vec::new(),
        }
    }
}

/// A manifest as found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestRecord {
    pub name: ModelName,
    /// First 12 hex characters of the manifest file's SHA-256.
    pub id: String,
    pub modified: DateTime<Utc>,
    pub manifest: Manifest,
}

pub struct ManifestStore {
    layout: StoreLayout,
    blobs: Arc<BlobStore>,
    locks: NameLocks,
}

impl ManifestStore {
    pub fn open(layout: StoreLayout, blobs: Arc<BlobStore>) -> Result<Self> {
        let dir = layout.manifests_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self {
            layout,
            blobs,
            locks: NameLocks::default(),
        })
    }

    /// Every readable manifest, sorted by full name. Unreadable files are
    /// skipped with a warning.
    pub fn list(&self) -> Result<Vec<ManifestRecord>> {
        let mut out = Vec::new();
        for (name, path) in self.scan()? {
            match load(&name, &path) {
                Ok(record) => out.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable manifest"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn get(&self, name: &ModelName) -> Result<ManifestRecord> {
        load(name, &self.layout.manifest_path(name))
    }

    pub fn exists(&self, name: &ModelName) -> bool {
        self.layout.manifest_path(name).is_file()
    }

    /// Read `name`'s manifest and take a reference on every blob it names,
    /// atomically with respect to `create`/`delete` on the same name.
    /// The caller owns the references and must release them.
    pub fn get_pinned(&self, name: &ModelName) -> Result<ManifestRecord> {
        let _guard = self.locks.lock(&name.key());
        let record = self.get(name)?;
        let mut pinned = Vec::new();
        for digest in record.manifest.digests() {
            if let Err(e) = self.blobs.retain(digest) {
                warn!(
                    model = %name.short(),
                    %digest,
                    error = %e,
                    "pin failed, releasing earlier pins"
                );
                self.release_blobs(pinned);
                return Err(e);
            }
            pinned.push(digest);
        }
        Ok(record)
    }

    /// Commit `manifest` under `name`.
    ///
    /// The caller's references on the manifest's blobs pass to the stored
    /// manifest. With `overwrite`, the replaced manifest's references are
    /// released only after the new one is durable.
    pub fn create(
        &self,
        name: &ModelName,
        manifest: &Manifest,
        overwrite: bool,
    ) -> Result<ManifestRecord> {
        let _guard = self.locks.lock(&name.key());
        let path = self.layout.manifest_path(name);

        let previous = if path.is_file() {
            if !overwrite {
                return Err(StoreError::DuplicateModel(name.short()));
            }
            Some(load(name, &path)?)
        } else {
            None
        };

        for digest in manifest.digests() {
            if !self.blobs.exists(digest) {
                return Err(StoreError::BlobNotFound(*digest));
            }
        }

        let json = serde_json::to_vec_pretty(manifest).map_err(|e| StoreError::CorruptManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fsutil::atomic_write(&path, &json)?;
        info!(model = %name.short(), layers = manifest.layers.len(), "manifest committed");

        if let Some(old) = previous {
            self.release_blobs(old.manifest.digests());
        }
        load(name, &path)
    }

    /// Remove `name`'s manifest, then release every blob it referenced.
    pub fn delete(&self, name: &ModelName) -> Result<Manifest> {
        let _guard = self.locks.lock(&name.key());
        let path = self.layout.manifest_path(name);
        let record = load(name, &path)?;

        fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        if let Some(parent) = path.parent() {
            fsutil::remove_empty_parents(parent, &self.layout.manifests_dir());
        }
        info!(model = %name.short(), "manifest deleted");

        self.release_blobs(record.manifest.digests());
        Ok(record.manifest)
    }

    /// Drop one reference per digest and delete the blobs nothing uses
    /// any more.
    ///
    /// A blob this process no longer holds is deleted only if no manifest
    /// on disk names it, including manifests written by other tools since
    /// the store was opened. Failures are logged and leave blobs in place
    /// for a later prune.
    pub fn release_blobs<'a>(&self, digests: impl IntoIterator<Item = &'a Digest>) {
        let candidates: Vec<Digest> = digests
            .into_iter()
            .filter(|d| self.blobs.release(d))
            .copied()
            .collect();
        if candidates.is_empty() {
            return;
        }
        let on_disk = match self.reference_counts() {
            Ok(counts) => counts,
            Err(e) => {
                warn!(blobs = candidates.len(), error = %e, "manifest scan failed, keeping released blobs");
                return;
            }
        };
        match self.blobs.remove_unreferenced(&candidates, &on_disk) {
            Ok(removed) => debug!(candidates = candidates.len(), removed, "released blobs swept"),
            Err(e) => warn!(error = %e, "failed to remove released blobs"),
        }
    }

    /// Rescan the manifests on disk, then prune the blob directory
    /// against them.
    pub fn prune(&self) -> Result<PruneReport> {
        let on_disk = self.reference_counts()?;
        self.blobs.prune(&on_disk)
    }

    /// Count every blob reference across all manifests, with multiplicity.
    ///
    /// Manifests that fail to parse still protect the digests that appear
    /// in their text.
    pub fn reference_counts(&self) -> Result<HashMap<Digest, u64>> {
        let mut counts = HashMap::new();
        for (name, path) in self.scan()? {
            match load(&name, &path) {
                Ok(record) => {
                    for d in record.manifest.digests() {
                        *counts.entry(*d).or_insert(0) += 1;
                    }
                }
                Err(_) => {
                    let text = fs::read_to_string(&path).unwrap_or_default();
                    for d in digests_in_text(&text) {
                        *counts.entry(d).or_insert(0) += 1;
                    }
                }
            }
        }
        debug!(blobs = counts.len(), "reference counts computed");
        Ok(counts)
    }

    /// All `<host>/<namespace>/<model>/<tag>` files under `manifests/`.
    fn scan(&self) -> Result<Vec<(ModelName, PathBuf)>> {
        let root = self.layout.manifests_dir();
        let mut out = Vec::new();
        for host in subdirs(&root)? {
            for ns in subdirs(&host)? {
                for model in subdirs(&ns)? {
                    let entries = fs::read_dir(&model).map_err(|e| StoreError::io(&model, e))?;
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if !path.is_file() {
                            continue;
                        }
                        match name_from_path(&root, &path) {
                            Some(name) => out.push((name, path)),
                            None => debug!(path = %path.display(), "ignoring non-manifest file"),
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    Ok(entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect())
}

fn name_from_path(root: &Path, path: &Path) -> Option<ModelName> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel.iter().map(|p| p.to_str()).collect::<Option<_>>()?;
    let [host, ns, model, tag] = parts.as_slice() else {
        return None;
    };
    if tag.starts_with(TEMP_PREFIX) {
        return None;
    }
    format!("{host}/{ns}/{model}:{tag}").parse().ok()
}

fn load(name: &ModelName, path: &Path) -> Result<ManifestRecord> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::ModelNotFound(name.short()));
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let manifest: Manifest =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(ManifestRecord {
        name: name.clone(),
        id: Digest::of(&bytes).hex()[..12].to_string(),
        modified,
        manifest,
    })
}

fn digests_in_text(text: &str) -> Vec<Digest> {
    text.match_indices("sha256:")
        .filter_map(|(i, _)| text.get(i..i + 71))
        .filter_map(|s| s.parse().ok())
        .collect()
}
