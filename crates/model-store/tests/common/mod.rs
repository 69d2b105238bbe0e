#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use gguf_parser::{GGMLType, GGUFError, GGUFMetadataKV, GGUFValue, ParsedModel, TensorInfo};
use model_store::{Engine, EngineOptions};
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub engine: Engine,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path().join("models"), EngineOptions::default()).unwrap();
        Self { dir, engine }
    }

    pub fn reopen(self) -> Self {
        let Fixture { dir, engine } = self;
        drop(engine);
        let engine = Engine::open(dir.path().join("models"), EngineOptions::default()).unwrap();
        Self { dir, engine }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.path().join(file)
    }

    /// Write a GGUF file whose tensors are F32 vectors with the given payloads.
    pub fn gguf(&self, file: &str, general_name: &str, tensors: &[(&str, Vec<u8>)]) -> PathBuf {
        let path = self.path(file);
        fs::write(&path, gguf_bytes(general_name, tensors)).unwrap();
        path
    }

    /// Number of `sha256-*` files in the blob directory.
    pub fn blob_files(&self) -> usize {
        fs::read_dir(self.engine.layout().blobs_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("sha256-"))
            .count()
    }
}

pub fn gguf_bytes(general_name: &str, tensors: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let metadata = vec![
        GGUFMetadataKV::new("general.architecture", GGUFValue::String("llama".into())),
        GGUFMetadataKV::new("general.name", GGUFValue::String(general_name.into())),
        GGUFMetadataKV::new("general.file_type", GGUFValue::Uint32(0)),
        GGUFMetadataKV::new("llama.context_length", GGUFValue::Uint32(2048)),
    ];
    let infos = tensors
        .iter()
        .map(|(name, data)| {
            assert_eq!(data.len() % 4, 0, "F32 payloads are whole floats");
            TensorInfo::new(*name, vec![data.len() as u64 / 4], GGMLType::F32).unwrap()
        })
        .collect();
    let model = ParsedModel::new(3, metadata, infos).unwrap();

    let mut out = Vec::new();
    gguf_parser::serialize(&mut out, &model, |i, _, w| {
        w.write_all(&tensors[i].1)?;
        Ok::<_, GGUFError>(())
    })
    .unwrap();
    out
}

/// Deterministic payload of `floats` f32 values seeded by `seed`.
pub fn payload(seed: u8, floats: usize) -> Vec<u8> {
    (0..floats * 4)
        .map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed))
        .collect()
}

pub fn demo_tensors() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("token_embd.weight", payload(1, 40)),
        ("blk.0.attn_q.weight", payload(2, 9)),
        ("output.weight", payload(3, 17)),
    ]
}

pub fn leftover_temps(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
        .count()
}
