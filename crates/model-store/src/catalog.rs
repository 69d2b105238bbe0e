//! Read-only listing of installed models.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::blob::BlobStore;
use crate::manifest::{LayerRole, Manifest, ManifestRecord, ModelConfig};

/// One row of the model listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    /// Short display name, e.g. `demo:latest`.
    pub name: String,
    pub full_name: String,
    pub id: String,
    /// Config plus all layers, in bytes.
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub architecture: Option<String>,
    pub quantization: Option<String>,
    pub parameter_size: Option<String>,
    pub layer_count: usize,
    pub tensor_count: usize,
}

/// Everything `show` reports about one model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDetails {
    pub entry: ModelEntry,
    pub manifest: Manifest,
    pub config: Option<ModelConfig>,
}

/// Decode a manifest's config blob. Missing or undecodable configs yield
/// `None`; the listing must not fail because of one bad model.
pub fn read_config(blobs: &BlobStore, manifest: &Manifest) -> Option<ModelConfig> {
    let bytes = match blobs.read(&manifest.config.digest) {
        Ok(b) => b,
        Err(e) => {
            warn!(digest = %manifest.config.digest, error = %e, "config blob unreadable");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(digest = %manifest.config.digest, error = %e, "config blob is not valid JSON");
            None
        }
    }
}

pub fn entry(record: &ManifestRecord, config: Option<&ModelConfig>) -> ModelEntry {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    let m = &record.manifest;
    ModelEntry {
        name: record.name.short(),
        full_name: record.name.to_string(),
        id: record.id.clone(),
        size: m.total_size(),
        modified: record.modified,
        architecture: config.and_then(|c| non_empty(&c.model_family)),
        quantization: config.and_then(|c| non_empty(&c.file_type)),
        parameter_size: config.and_then(|c| {
            non_empty(&c.model_type).or_else(|| c.parameter_count.map(human_parameter_size))
        }),
        layer_count: m.layers.len(),
        tensor_count: m.count_role(LayerRole::Tensor),
    }
}

/// `7241732096` → `7.2B`, `494032768` → `494.03M`, `78` → `78`.
pub fn human_parameter_size(n: u64) -> String {
    const THOUSAND: f64 = 1e3;
    const MILLION: f64 = 1e6;
    const BILLION: f64 = 1e9;

    let f = n as f64;
    let (value, unit, decimals) = if f >= BILLION {
        (f / BILLION, "B", 1)
    } else if f >= MILLION {
        (f / MILLION, "M", 2)
    } else if f >= THOUSAND {
        (f / THOUSAND, "K", 1)
    } else {
        return n.to_string();
    };
    if value.fract() == 0.0 {
        format!("{value:.0}{unit}")
    } else {
        format!("{value:.decimals$}{unit}")
    }
}
