//! In-memory view of a GGUF file: everything except the tensor payloads.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::tensor::TensorInfo;
use crate::types::*;

/// Header, metadata and tensor index of a GGUF file, plus the location of
/// its tensor-data region.
///
/// Payload bytes are never held here; `data_offset`/`data_len` describe
/// where they live in the source stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedModel {
    pub header: GGUFHeader,
    pub metadata: Vec<GGUFMetadataKV>,
    pub tensors: Vec<TensorInfo>,
    pub alignment: u64,
    /// Absolute stream offset of the (aligned) tensor-data region.
    pub data_offset: u64,
    /// Bytes available in the tensor-data region.
    pub data_len: u64,
}

impl ParsedModel {
    /// Assemble a model from scratch. Offsets, counts and the data region
    /// are filled in by the writer.
    pub fn new(
        version: u32,
        metadata: Vec<GGUFMetadataKV>,
        tensors: Vec<TensorInfo>,
    ) -> Result<Self, GGUFError> {
        let alignment = alignment_of(&metadata)?;
        Ok(Self {
            header: GGUFHeader {
                version,
                tensor_count: tensors.len() as u64,
                metadata_kv_count: metadata.len() as u64,
            },
            metadata,
            tensors,
            alignment,
            data_offset: 0,
            data_len: 0,
        })
    }

    pub fn get(&self, key: &str) -> Option<&GGUFValue> {
        self.metadata
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| &kv.value)
    }

    pub fn architecture(&self) -> Option<&str> {
        self.get("general.architecture").and_then(|v| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.get("general.name").and_then(|v| v.as_str())
    }

    pub fn file_type(&self) -> Option<u32> {
        self.get("general.file_type").and_then(|v| v.as_u32())
    }

    pub fn quantization(&self) -> Option<&'static str> {
        self.file_type().map(file_type_name)
    }

    /// `<arch>.<suffix>` lookup, e.g. `context_length`.
    pub fn arch_u32(&self, suffix: &str) -> Option<u32> {
        let arch = self.architecture().unwrap_or("llama");
        self.get(&format!("{arch}.{suffix}"))
            .and_then(|v| v.as_u32())
    }

    /// Total element count across all tensors.
    pub fn parameter_count(&self) -> u64 {
        self.tensors.iter().map(TensorInfo::n_elements).sum()
    }

    /// Sum of tensor payload sizes (padding excluded).
    pub fn tensor_bytes(&self) -> u64 {
        self.tensors.iter().map(|t| t.size).sum()
    }

    /// Absolute byte range of `tensor` inside the source stream.
    pub fn tensor_range(&self, tensor: &TensorInfo) -> Range<u64> {
        let start = self.data_offset + tensor.offset;
        start..start + tensor.size
    }
}

/// Resolve the tensor-data alignment declared in `metadata`.
pub(crate) fn alignment_of(metadata: &[GGUFMetadataKV]) -> Result<u64, GGUFError> {
    let Some(kv) = metadata.iter().find(|kv| kv.key == ALIGNMENT_KEY) else {
        return Ok(GGUF_DEFAULT_ALIGNMENT);
    };
    match kv.value {
        GGUFValue::Uint32(a) if a != 0 && a.is_power_of_two() => Ok(a as u64),
        ref other => Err(GGUFError::MalformedMetadata(format!(
            "{ALIGNMENT_KEY} must be a non-zero power-of-two u32, got {other:?}"
        ))),
    }
}
