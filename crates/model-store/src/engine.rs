//! Import/export orchestration over the blob and manifest stores.
//!
//! Import splits a GGUF file into one metadata blob (everything before the
//! tensor-data region) plus one blob per tensor, then commits a manifest.
//! Export resolves a manifest back into a single GGUF file, re-serialising
//! split models and copying single-blob models verbatim. Either way the
//! result becomes visible only in its final step: manifest commit on
//! import, rename of the output file on export.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gguf_parser::ParsedModel;
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, PruneReport};
use crate::catalog::{self, ModelDetails, ModelEntry};
use crate::digest::Digest;
use crate::error::{Result, Stage, StoreError};
use crate::fsutil;
use crate::layout::StoreLayout;
use crate::manifest::{
    Layer, LayerRole, MEDIA_TYPE_CONFIG, MEDIA_TYPE_GGUF_HEADER, MEDIA_TYPE_GGUF_TENSOR, Manifest,
    ManifestRecord, ManifestStore, ModelConfig, RootFs,
};
use crate::name::ModelName;
use crate::session::{
    ProgressSink, SessionId, SessionRegistry, TransferKind, TransferSession, TransferState,
};

const WRITE_BUF: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Remove unreferenced blobs and stale temporaries on open.
    pub prune_on_open: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            prune_on_open: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub path: PathBuf,
    /// Explicit model name; otherwise derived from the file.
    pub name: Option<String>,
    /// Replace an existing model of the same name.
    pub overwrite: bool,
}

impl ImportRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            overwrite: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Name shown for the session before the model name is known.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

pub struct Engine {
    layout: StoreLayout,
    blobs: Arc<BlobStore>,
    manifests: ManifestStore,
    sessions: SessionRegistry,
}

impl Engine {
    /// Open the store at `root`, rebuild blob reference counts from the
    /// manifests and optionally prune.
    pub fn open(root: impl Into<PathBuf>, options: EngineOptions) -> Result<Self> {
        let layout = StoreLayout::new(root);
        let blobs = Arc::new(BlobStore::open(layout.clone())?);
        let manifests = ManifestStore::open(layout.clone(), Arc::clone(&blobs))?;
        blobs.rebuild_refs(manifests.reference_counts()?);

        let engine = Self {
            layout,
            blobs,
            manifests,
            sessions: SessionRegistry::default(),
        };
        if options.prune_on_open
            && let Err(e) = engine.manifests.prune()
        {
            warn!(error = %e, "start-up prune failed");
        }
        info!(root = %engine.layout.root().display(), "model store opened");
        Ok(engine)
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    //  Catalog

    pub fn list(&self) -> Result<Vec<ModelEntry>> {
        Ok(self
            .manifests
            .list()?
            .iter()
            .map(|r| {
                let config = catalog::read_config(&self.blobs, &r.manifest);
                catalog::entry(r, config.as_ref())
            })
            .collect())
    }

    pub fn show(&self, name: &str) -> Result<ModelDetails> {
        let name: ModelName = name.parse()?;
        let record = self.manifests.get(&name)?;
        let config = catalog::read_config(&self.blobs, &record.manifest);
        Ok(ModelDetails {
            entry: catalog::entry(&record, config.as_ref()),
            manifest: record.manifest,
            config,
        })
    }

    pub fn delete(&self, name: &str) -> Result<Manifest> {
        let name: ModelName = name.parse()?;
        self.manifests.delete(&name)
    }

    pub fn prune(&self) -> Result<PruneReport> {
        self.manifests.prune()
    }

    //  Sessions

    /// Register a new session so it can be observed and cancelled before
    /// the transfer starts running.
    pub fn begin(&self, kind: TransferKind, label: impl Into<String>) -> Arc<TransferSession> {
        let session = Arc::new(TransferSession::new(kind, label));
        self.sessions.insert(Arc::clone(&session));
        session
    }

    pub fn cancel(&self, id: SessionId) -> bool {
        self.sessions.cancel(id)
    }

    fn finish<T>(&self, session: &TransferSession, result: Result<T>) -> Result<T> {
        let state = match &result {
            Ok(_) => TransferState::Done,
            Err(StoreError::Cancelled) => TransferState::Cancelled,
            Err(_) => TransferState::Failed,
        };
        session.set_state(state);
        self.sessions.remove(session.id());
        match &result {
            Ok(_) => info!(session = %session.id(), label = session.label(), "transfer done"),
            Err(StoreError::Cancelled) => {
                info!(session = %session.id(), label = session.label(), "transfer cancelled")
            }
            Err(e) => warn!(session = %session.id(), label = session.label(), error = %e, "transfer failed"),
        }
        result
    }

    //  Import

    pub fn import(&self, req: &ImportRequest, sink: &dyn ProgressSink) -> Result<ManifestRecord> {
        let session = self.begin(TransferKind::Import, req.label());
        self.import_with(&session, req, sink)
    }

    /// Run an import on a session obtained from [`Engine::begin`].
    pub fn import_with(
        &self,
        session: &TransferSession,
        req: &ImportRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ManifestRecord> {
        let mut stage = Stage::Staging;
        let result = self.run_import(session, req, sink, &mut stage);
        let result = match result {
            Ok(record) => Ok(record),
            Err(e) => {
                self.manifests.release_blobs(&session.take_staged());
                Err(match e {
                    StoreError::Cancelled => StoreError::Cancelled,
                    e => StoreError::ImportFailed {
                        name: req.label(),
                        stage,
                        source: Box::new(e),
                    },
                })
            }
        };
        self.finish(session, result)
    }

    fn run_import(
        &self,
        session: &TransferSession,
        req: &ImportRequest,
        sink: &dyn ProgressSink,
        stage: &mut Stage,
    ) -> Result<ManifestRecord> {
        session.checkpoint()?;
        session.set_state(TransferState::Staging);
        let file = File::open(&req.path).map_err(|e| StoreError::io(&req.path, e))?;
        let mut src = BufReader::new(file);
        let model = gguf_parser::parse(&mut src)?;

        let name = match &req.name {
            Some(n) => n.parse::<ModelName>()?,
            None => ModelName::derive(&req.path, model.name())?,
        };
        if !req.overwrite && self.manifests.exists(&name) {
            return Err(StoreError::DuplicateModel(name.short()));
        }
        info!(
            model = %name.short(),
            tensors = model.tensors.len(),
            bytes = model.data_offset + model.tensor_bytes(),
            "importing"
        );
        session.set_total(model.data_offset + model.tensor_bytes());

        *stage = Stage::Verifying;
        session.set_state(TransferState::Verifying);

        session.checkpoint()?;
        let header = self.stage_range(session, &mut src, &req.path, 0, model.data_offset)?;
        session.advance(model.data_offset, sink);

        let mut layers = vec![Layer::new(MEDIA_TYPE_GGUF_HEADER, header, model.data_offset)];
        for t in &model.tensors {
            session.checkpoint()?;
            let range = model.tensor_range(t);
            let digest = self.stage_range(session, &mut src, &req.path, range.start, t.size)?;
            debug!(tensor = %t.name, %digest, bytes = t.size, "tensor staged");
            layers.push(Layer::new(MEDIA_TYPE_GGUF_TENSOR, digest, t.size));
            session.advance(t.size, sink);
        }

        session.checkpoint()?;
        let config = config_for(&model, &layers);
        let config_json = serde_json::to_vec(&config).map_err(|e| {
            StoreError::io(&req.path, std::io::Error::other(e))
        })?;
        let config_digest = self.blobs.write(&config_json)?;
        session.stage(config_digest);
        let manifest = Manifest::new(
            Layer::new(MEDIA_TYPE_CONFIG, config_digest, config_json.len() as u64),
            layers,
        );

        session.checkpoint()?;
        *stage = Stage::Committing;
        session.set_state(TransferState::Committing);
        let record = self.manifests.create(&name, &manifest, req.overwrite)?;
        // References now belong to the manifest.
        session.take_staged();
        Ok(record)
    }

    /// Copy `len` bytes at `start` into a blob and stage its reference.
    fn stage_range<R: Read + Seek>(
        &self,
        session: &TransferSession,
        src: &mut R,
        path: &Path,
        start: u64,
        len: u64,
    ) -> Result<Digest> {
        src.seek(SeekFrom::Start(start))
            .map_err(|e| StoreError::io(path, e))?;
        let (digest, got) = self.blobs.write_from(&mut src.by_ref().take(len), None)?;
        session.stage(digest);
        if got != len {
            return Err(StoreError::InvalidModelFile(gguf_parser::GGUFError::TensorRange {
                name: path.display().to_string(),
                offset: start,
                size: len,
                region_len: got,
            }));
        }
        Ok(digest)
    }

    //  Export

    pub fn export(&self, name: &str, target: &Path, sink: &dyn ProgressSink) -> Result<u64> {
        let session = self.begin(TransferKind::Export, name);
        self.export_with(&session, name, target, sink)
    }

    /// Run an export on a session obtained from [`Engine::begin`].
    pub fn export_with(
        &self,
        session: &TransferSession,
        name: &str,
        target: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<u64> {
        let result = name
            .parse::<ModelName>()
            .and_then(|name| self.run_export(session, &name, target, sink))
            .map_err(|e| match e {
                StoreError::Cancelled => StoreError::Cancelled,
                e => StoreError::ExportFailed {
                    name: name.to_string(),
                    source: Box::new(e),
                },
            });
        self.finish(session, result)
    }

    fn run_export(
        &self,
        session: &TransferSession,
        name: &ModelName,
        target: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<u64> {
        session.checkpoint()?;
        session.set_state(TransferState::Staging);
        let record = self.manifests.get_pinned(name)?;
        let result = self.write_export(session, name, &record.manifest, target, sink);
        self.manifests.release_blobs(record.manifest.digests());
        result
    }

    fn write_export(
        &self,
        session: &TransferSession,
        name: &ModelName,
        manifest: &Manifest,
        target: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<u64> {
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = fsutil::temp_in(dir)?;
        let mut out = BufWriter::with_capacity(WRITE_BUF, tmp);

        session.set_state(TransferState::Verifying);
        let written = match manifest.layers.iter().find(|l| l.role() == LayerRole::Model) {
            Some(model) => {
                session.set_total(model.size);
                session.checkpoint()?;
                let n = self.blobs.copy_to(&model.digest, &mut out)?;
                session.advance(n, sink);
                n
            }
            None => self.write_split(session, name, manifest, &mut out, sink)?,
        };

        session.checkpoint()?;
        session.set_state(TransferState::Committing);
        let tmp = out
            .into_inner()
            .map_err(|e| StoreError::io(target, e.into_error()))?;
        fsutil::commit(tmp, target)?;
        info!(model = %name.short(), target = %target.display(), bytes = written, "exported");
        Ok(written)
    }

    fn write_split(
        &self,
        session: &TransferSession,
        name: &ModelName,
        manifest: &Manifest,
        out: &mut BufWriter<tempfile::NamedTempFile>,
        sink: &dyn ProgressSink,
    ) -> Result<u64> {
        let corrupt = |reason: String| StoreError::CorruptManifest {
            path: self.layout.manifest_path(name),
            reason,
        };
        let mut headers = manifest
            .layers
            .iter()
            .filter(|l| l.role() == LayerRole::Metadata);
        let (Some(header), None) = (headers.next(), headers.next()) else {
            return Err(corrupt("expected exactly one GGUF metadata layer".into()));
        };
        let tensors: Vec<&Layer> = manifest
            .layers
            .iter()
            .filter(|l| l.role() == LayerRole::Tensor)
            .collect();

        session.set_total(header.size + tensors.iter().map(|l| l.size).sum::<u64>());
        session.checkpoint()?;
        let header_bytes = self.blobs.read(&header.digest)?;
        let model: ParsedModel = gguf_parser::parse_index(&mut header_bytes.as_slice())?;
        if model.tensors.len() != tensors.len() {
            return Err(corrupt(format!(
                "metadata lists {} tensors but the manifest has {} tensor layers",
                model.tensors.len(),
                tensors.len()
            )));
        }
        session.advance(header.size, sink);

        gguf_parser::serialize(out, &model, |i, _, w| {
            session.checkpoint()?;
            let n = self.blobs.copy_to(&tensors[i].digest, w)?;
            session.advance(n, sink);
            Ok::<_, StoreError>(())
        })
    }
}

fn config_for(model: &ParsedModel, layers: &[Layer]) -> ModelConfig {
    let family = model.architecture().unwrap_or_default().to_string();
    let params = model.parameter_count();
    ModelConfig {
        model_format: "gguf".into(),
        model_families: if family.is_empty() {
            Vec::new()
        } else {
            vec![family.clone()]
        },
        model_family: family,
        model_type: catalog::human_parameter_size(params),
        file_type: model.quantization().unwrap_or_default().to_string(),
        parameter_count: Some(params),
        rootfs: RootFs {
            diff_ids: layers.iter().map(|l| l.digest).collect(),
            ..RootFs::default()
        },
        extra: Default::default(),
    }
}
