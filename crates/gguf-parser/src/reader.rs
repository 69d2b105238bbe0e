//! GGUF file reader: full index parse plus a quick-scan summary.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ParsedModel, alignment_of};
use crate::tensor::{GGMLType, GGML_MAX_DIMS, TensorInfo};
use crate::types::*;

/// Longest string accepted in the key/value table or tensor index.
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Longest metadata array accepted.
const MAX_ARRAY_LEN: u64 = 10_000_000;

/// Deepest array nesting accepted.
const MAX_ARRAY_DEPTH: u32 = 8;

//  Public entry points

/// Parse a complete GGUF stream: header, metadata, tensor index, and the
/// bounds of the tensor-data region.
///
/// Tensor payloads are not read; every descriptor is checked to lie
/// inside the region that follows the index.
pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<ParsedModel, GGUFError> {
    let stream_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut model = parse_index(reader)?;
    model.data_len = stream_len.saturating_sub(model.data_offset);

    for t in &model.tensors {
        let end = t.offset.checked_add(t.size);
        if end.is_none_or(|end| end > model.data_len) {
            return Err(GGUFError::TensorRange {
                name: t.name.clone(),
                offset: t.offset,
                size: t.size,
                region_len: model.data_len,
            });
        }
    }

    debug!(
        version = model.header.version,
        tensors = model.tensors.len(),
        kvs = model.metadata.len(),
        data_offset = model.data_offset,
        data_len = model.data_len,
        "parsed GGUF stream"
    );
    Ok(model)
}

/// Parse a GGUF file on disk.
pub fn parse_file(path: &Path) -> Result<ParsedModel, GGUFError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    parse(&mut reader)
}

/// Parse only the header, metadata and tensor index.
///
/// Reads sequentially and stops at the end of the index; `data_offset` is
/// the aligned position where tensor data would start and `data_len` is 0.
pub fn parse_index<R: Read>(reader: &mut R) -> Result<ParsedModel, GGUFError> {
    let mut r = Tracked { inner: reader, pos: 0 };

    let header = Section::Header.wrap(read_header(&mut r))?;
    let metadata = Section::Metadata.wrap(read_metadata(&mut r, header.metadata_kv_count))?;
    let alignment = alignment_of(&metadata)?;
    let tensors =
        Section::TensorIndex.wrap(read_tensor_index(&mut r, header.tensor_count, alignment))?;

    let data_offset = checked_align_up(r.pos, alignment).ok_or_else(|| {
        GGUFError::MalformedTensorIndex("tensor-data offset overflows".into())
    })?;

    Ok(ParsedModel {
        header,
        metadata,
        tensors,
        alignment,
        data_offset,
        data_len: 0,
    })
}

fn read_header(r: &mut impl Read) -> Result<GGUFHeader, GGUFError> {
    let magic = read_u32(r)?;
    if magic != GGUF_MAGIC {
        return Err(GGUFError::UnsupportedFormat(format!(
            "invalid magic 0x{magic:08X}"
        )));
    }
    let version = read_u32(r)?;
    if !(GGUF_VERSION_MIN..=GGUF_VERSION_MAX).contains(&version) {
        return Err(GGUFError::UnsupportedFormat(format!(
            "GGUF version {version} (supported: {GGUF_VERSION_MIN}..={GGUF_VERSION_MAX})"
        )));
    }
    Ok(GGUFHeader {
        version,
        tensor_count: read_u64(r)?,
        metadata_kv_count: read_u64(r)?,
    })
}

fn read_metadata(r: &mut impl Read, count: u64) -> Result<Vec<GGUFMetadataKV>, GGUFError> {
    let mut seen = HashSet::new();
    let mut metadata = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let kv = read_kv(r)?;
        if !seen.insert(kv.key.clone()) {
            return Err(GGUFError::MalformedMetadata(format!(
                "duplicate key '{}'",
                kv.key
            )));
        }
        metadata.push(kv);
    }
    Ok(metadata)
}

fn read_tensor_index(
    r: &mut impl Read,
    count: u64,
    alignment: u64,
) -> Result<Vec<TensorInfo>, GGUFError> {
    let mut seen = HashSet::new();
    let mut tensors = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let t = read_tensor_info(r)?;
        if t.offset % alignment != 0 {
            return Err(GGUFError::MalformedTensorIndex(format!(
                "tensor '{}' offset {} is not aligned to {alignment}",
                t.name, t.offset
            )));
        }
        if !seen.insert(t.name.clone()) {
            return Err(GGUFError::MalformedTensorIndex(format!(
                "duplicate tensor '{}'",
                t.name
            )));
        }
        tensors.push(t);
    }
    Ok(tensors)
}

//  Quick scan

/// Summary of a single `.gguf` file, for display before import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickScanResult {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub header: GGUFHeader,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub file_type: Option<u32>,
    pub file_type_name: Option<String>,
    pub context_length: Option<u32>,
    pub embedding_length: Option<u32>,
    pub parameter_count: u64,
    pub tensor_bytes: u64,
    pub alignment: u64,
    pub data_offset: u64,
    pub metadata_keys: Vec<String>,
}

/// Parse `path` and summarise the well-known metadata keys.
pub fn quick_scan(path: &Path) -> Result<QuickScanResult, GGUFError> {
    let file_size = fs::metadata(path)?.len();
    let model = parse_file(path)?;

    debug!(path = %path.display(), architecture = ?model.architecture(), name = ?model.name(), "quick scan complete");

    Ok(QuickScanResult {
        file_path: path.to_path_buf(),
        file_size,
        header: model.header.clone(),
        architecture: model.architecture().map(String::from),
        name: model.name().map(String::from),
        file_type: model.file_type(),
        file_type_name: model.quantization().map(String::from),
        context_length: model.arch_u32("context_length"),
        embedding_length: model.arch_u32("embedding_length"),
        parameter_count: model.parameter_count(),
        tensor_bytes: model.tensor_bytes(),
        alignment: model.alignment,
        data_offset: model.data_offset,
        metadata_keys: model.metadata.iter().map(|kv| kv.key.clone()).collect(),
    })
}

//  Internal helpers

/// Which part of the stream is being decoded; decides how a premature
/// end of stream is reported.
#[derive(Clone, Copy)]
enum Section {
    Header,
    Metadata,
    TensorIndex,
}

impl Section {
    fn wrap<T>(self, res: Result<T, GGUFError>) -> Result<T, GGUFError> {
        res.map_err(|e| match e {
            GGUFError::Io(ref io) if io.kind() == io::ErrorKind::UnexpectedEof => match self {
                Self::Header => {
                    GGUFError::UnsupportedFormat("stream too short for a GGUF header".into())
                }
                Self::Metadata => {
                    GGUFError::MalformedMetadata("stream ends inside the key/value table".into())
                }
                Self::TensorIndex => {
                    GGUFError::MalformedTensorIndex("stream ends inside the tensor index".into())
                }
            },
            other => other,
        })
    }
}

/// Reader that remembers how many bytes it has handed out.
struct Tracked<'a, R> {
    inner: &'a mut R,
    pos: u64,
}

impl<R: Read> Read for Tracked<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

fn checked_align_up(n: u64, align: u64) -> Option<u64> {
    n.checked_add(align - 1).map(|v| v & !(align - 1))
}

//  Binary reading primitives

fn read_bytes<const N: usize>(r: &mut impl Read) -> Result<[u8; N], GGUFError> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u8(r: &mut impl Read) -> Result<u8, GGUFError> {
    Ok(read_bytes::<1>(r)?[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32, GGUFError> {
    Ok(u32::from_le_bytes(read_bytes(r)?))
}

fn read_u64(r: &mut impl Read) -> Result<u64, GGUFError> {
    Ok(u64::from_le_bytes(read_bytes(r)?))
}

/// Length-prefixed UTF-8 string. `malformed` builds the section's error.
fn read_string(
    r: &mut impl Read,
    malformed: fn(String) -> GGUFError,
) -> Result<String, GGUFError> {
    let len = read_u64(r)?;
    if len > MAX_STRING_LEN {
        return Err(malformed(format!("string length {len} too large")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| malformed(format!("string is not UTF-8: {e}")))
}

fn read_value(
    r: &mut impl Read,
    vtype: GGUFValueType,
    depth: u32,
) -> Result<GGUFValue, GGUFError> {
    let value = match vtype {
        GGUFValueType::Uint8 => GGUFValue::Uint8(read_u8(r)?),
        GGUFValueType::Int8 => GGUFValue::Int8(i8::from_le_bytes(read_bytes(r)?)),
        GGUFValueType::Uint16 => GGUFValue::Uint16(u16::from_le_bytes(read_bytes(r)?)),
        GGUFValueType::Int16 => GGUFValue::Int16(i16::from_le_bytes(read_bytes(r)?)),
        GGUFValueType::Uint32 => GGUFValue::Uint32(read_u32(r)?),
        GGUFValueType::Int32 => GGUFValue::Int32(i32::from_le_bytes(read_bytes(r)?)),
        GGUFValueType::Float32 => GGUFValue::Float32(f32::from_le_bytes(read_bytes(r)?)),
        GGUFValueType::Bool => match read_u8(r)? {
            0 => GGUFValue::Bool(false),
            1 => GGUFValue::Bool(true),
            b => {
                return Err(GGUFError::MalformedMetadata(format!(
                    "bool byte must be 0 or 1, got {b}"
                )));
            }
        },
        GGUFValueType::String => GGUFValue::String(read_string(r, GGUFError::MalformedMetadata)?),
        GGUFValueType::Array => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(GGUFError::MalformedMetadata(
                    "arrays nested too deeply".into(),
                ));
            }
            let elem_type = GGUFValueType::try_from(read_u32(r)?)?;
            let count = read_u64(r)?;
            if count > MAX_ARRAY_LEN {
                return Err(GGUFError::MalformedMetadata(format!(
                    "array length {count} too large"
                )));
            }
            let mut values = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                values.push(read_value(r, elem_type, depth + 1)?);
            }
            GGUFValue::Array { elem_type, values }
        }
        GGUFValueType::Uint64 => GGUFValue::Uint64(read_u64(r)?),
        GGUFValueType::Int64 => GGUFValue::Int64(i64::from_le_bytes(read_bytes(r)?)),
        GGUFValueType::Float64 => GGUFValue::Float64(f64::from_le_bytes(read_bytes(r)?)),
    };
    Ok(value)
}

fn read_kv(r: &mut impl Read) -> Result<GGUFMetadataKV, GGUFError> {
    let key = read_string(r, GGUFError::MalformedMetadata)?;
    let vtype = GGUFValueType::try_from(read_u32(r)?)?;
    let value = read_value(r, vtype, 0)?;
    Ok(GGUFMetadataKV { key, value })
}

fn read_tensor_info(r: &mut impl Read) -> Result<TensorInfo, GGUFError> {
    let name = read_string(r, GGUFError::MalformedTensorIndex)?;
    let n_dims = read_u32(r)?;
    if !(1..=GGML_MAX_DIMS).contains(&n_dims) {
        return Err(GGUFError::MalformedTensorIndex(format!(
            "tensor '{name}' declares {n_dims} dimensions"
        )));
    }
    let mut dims = Vec::with_capacity(n_dims as usize);
    for _ in 0..n_dims {
        dims.push(read_u64(r)?);
    }
    let ggml_type = GGMLType::try_from(read_u32(r)?)?;
    let offset = read_u64(r)?;

    let mut info = TensorInfo::new(name, dims, ggml_type)?;
    info.offset = offset;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn header(magic: u32, version: u32, tensors: u64, kvs: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&magic.to_le_bytes());
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(&tensors.to_le_bytes());
        buf.extend_from_slice(&kvs.to_le_bytes());
        buf
    }

    fn push_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = header(0xDEAD_BEEF, 3, 0, 0);
        let err = parse(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::UnsupportedFormat(_)), "{err}");
    }

    #[test]
    fn rejects_future_version() {
        let bytes = header(GGUF_MAGIC, GGUF_VERSION_MAX + 1, 0, 0);
        let err = parse(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::UnsupportedFormat(_)), "{err}");
    }

    #[test]
    fn short_stream_is_unsupported() {
        let err = parse(&mut Cursor::new(b"GGU".to_vec())).unwrap_err();
        assert!(matches!(err, GGUFError::UnsupportedFormat(_)), "{err}");
    }

    #[test]
    fn unknown_value_tag_is_malformed_metadata() {
        let mut bytes = header(GGUF_MAGIC, 3, 0, 1);
        push_string(&mut bytes, "general.name");
        bytes.extend_from_slice(&42u32.to_le_bytes());
        let err = parse(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::MalformedMetadata(_)), "{err}");
    }

    #[test]
    fn truncated_metadata_is_malformed() {
        let mut bytes = header(GGUF_MAGIC, 3, 0, 2);
        push_string(&mut bytes, "general.name");
        bytes.extend_from_slice(&(GGUFValueType::String as u32).to_le_bytes());
        push_string(&mut bytes, "demo");
        // second KV missing
        let err = parse(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::MalformedMetadata(_)), "{err}");
    }

    #[test]
    fn misaligned_tensor_offset_is_rejected() {
        let mut bytes = header(GGUF_MAGIC, 3, 1, 0);
        push_string(&mut bytes, "w");
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&8u64.to_le_bytes());
        bytes.extend_from_slice(&(GGMLType::F32 as u32).to_le_bytes());
        bytes.extend_from_slice(&7u64.to_le_bytes());
        let err = parse(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::MalformedTensorIndex(_)), "{err}");
    }

    #[test]
    fn zero_dimension_tensor_is_rejected() {
        let mut bytes = header(GGUF_MAGIC, 3, 1, 0);
        push_string(&mut bytes, "w");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&(GGMLType::F32 as u32).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.resize(96, 0);
        let err = parse(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::MalformedTensorIndex(_)), "{err}");
    }

    #[test]
    fn tensor_past_end_of_region_is_range_error() {
        let mut bytes = header(GGUF_MAGIC, 3, 1, 0);
        push_string(&mut bytes, "w");
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&8u64.to_le_bytes());
        bytes.extend_from_slice(&(GGMLType::F32 as u32).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.resize(checked_align_up(bytes.len() as u64, 32).unwrap() as usize, 0);
        bytes.extend_from_slice(&[0u8; 16]); // tensor needs 32
        let err = parse(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::TensorRange { .. }), "{err}");
    }

    #[test]
    fn bad_alignment_value_is_malformed_metadata() {
        let mut bytes = header(GGUF_MAGIC, 3, 0, 1);
        push_string(&mut bytes, ALIGNMENT_KEY);
        bytes.extend_from_slice(&(GGUFValueType::Uint32 as u32).to_le_bytes());
        bytes.extend_from_slice(&24u32.to_le_bytes());
        let err = parse(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GGUFError::MalformedMetadata(_)), "{err}");
    }
}
