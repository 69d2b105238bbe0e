//! GGUF writer: the inverse of [`crate::reader::parse`].
//!
//! Tensor offsets are always recomputed: tensors are laid out in index
//! order, each starting on an alignment boundary, and every payload is
//! zero-padded up to the next boundary.

use std::io::{self, Read, Write};

use tracing::debug;

use crate::model::{ParsedModel, alignment_of};
use crate::tensor::TensorInfo;
use crate::types::*;

/// Return a copy of `model` with counts, tensor offsets and the data
/// region recomputed exactly as [`serialize`] will write them.
pub fn canonical_layout(model: &ParsedModel) -> Result<ParsedModel, GGUFError> {
    let alignment = alignment_of(&model.metadata)?;

    let mut tensors = model.tensors.clone();
    let mut offset = 0u64;
    for t in &mut tensors {
        t.offset = offset;
        offset = t
            .size
            .checked_add(alignment - 1)
            .and_then(|end| offset.checked_add(end & !(alignment - 1)))
            .ok_or_else(|| GGUFError::MalformedTensorIndex("tensor layout overflows".into()))?;
    }

    let mut out = ParsedModel {
        header: GGUFHeader {
            version: model.header.version,
            tensor_count: tensors.len() as u64,
            metadata_kv_count: model.metadata.len() as u64,
        },
        metadata: model.metadata.clone(),
        tensors,
        alignment,
        data_offset: 0,
        data_len: offset,
    };
    out.data_offset = align_up(encode_index(&out)?.len() as u64, alignment);
    Ok(out)
}

/// Encode header, metadata and tensor index exactly as stored in `model`
/// (no padding, offsets taken verbatim).
pub fn encode_index(model: &ParsedModel) -> Result<Vec<u8>, GGUFError> {
    let mut buf = Vec::new();
    buf.write_all(&GGUF_MAGIC.to_le_bytes())?;
    buf.write_all(&model.header.version.to_le_bytes())?;
    buf.write_all(&(model.tensors.len() as u64).to_le_bytes())?;
    buf.write_all(&(model.metadata.len() as u64).to_le_bytes())?;

    for kv in &model.metadata {
        write_string(&mut buf, &kv.key)?;
        buf.write_all(&(kv.value.value_type() as u32).to_le_bytes())?;
        write_value(&mut buf, &kv.value)?;
    }

    for t in &model.tensors {
        write_string(&mut buf, &t.name)?;
        buf.write_all(&(t.dims.len() as u32).to_le_bytes())?;
        for d in &t.dims {
            buf.write_all(&d.to_le_bytes())?;
        }
        buf.write_all(&(t.ggml_type as u32).to_le_bytes())?;
        buf.write_all(&t.offset.to_le_bytes())?;
    }
    Ok(buf)
}

/// Write `model` as a standalone GGUF stream.
///
/// `tensor_data` is called once per tensor, in index order, and must
/// write exactly `tensor.size` bytes of payload. Returns the total number
/// of bytes written.
pub fn serialize<W, E, F>(out: &mut W, model: &ParsedModel, mut tensor_data: F) -> Result<u64, E>
where
    W: Write,
    E: From<GGUFError>,
    F: FnMut(usize, &TensorInfo, &mut dyn Write) -> Result<(), E>,
{
    let layout = canonical_layout(model)?;
    let index = encode_index(&layout)?;

    let mut out = Counting { inner: out, written: 0 };
    out.write_all(&index).map_err(GGUFError::from)?;
    pad(&mut out, layout.data_offset - index.len() as u64)?;

    for (i, t) in layout.tensors.iter().enumerate() {
        let start = out.written;
        tensor_data(i, t, &mut out)?;
        let got = out.written - start;
        if got != t.size {
            return Err(GGUFError::TensorRange {
                name: t.name.clone(),
                offset: t.offset,
                size: got,
                region_len: t.size,
            }
            .into());
        }
        pad(&mut out, align_up(t.size, layout.alignment) - t.size)?;
    }
    out.flush().map_err(GGUFError::from)?;

    debug!(
        tensors = layout.tensors.len(),
        bytes = out.written,
        "serialized GGUF stream"
    );
    Ok(out.written)
}

/// Serialize with payloads copied from `source`, a stream laid out as
/// described by `model` (typically the original file).
pub fn serialize_from<W, R>(out: &mut W, model: &ParsedModel, source: &mut R) -> Result<u64, GGUFError>
where
    W: Write,
    R: Read + io::Seek,
{
    serialize(out, model, |i, _, w| {
        let range = model.tensor_range(&model.tensors[i]);
        source.seek(io::SeekFrom::Start(range.start))?;
        io::copy(&mut source.by_ref().take(range.end - range.start), w)?;
        Ok::<_, GGUFError>(())
    })
}

//  Internal helpers

struct Counting<'a, W> {
    inner: &'a mut W,
    written: u64,
}

impl<W: Write> Write for Counting<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn pad(out: &mut impl Write, n: u64) -> Result<(), GGUFError> {
    io::copy(&mut io::repeat(0).take(n), out)?;
    Ok(())
}

fn write_string(w: &mut impl Write, s: &str) -> Result<(), GGUFError> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn write_value(w: &mut impl Write, value: &GGUFValue) -> Result<(), GGUFError> {
    match value {
        GGUFValue::Uint8(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Int8(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Uint16(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Int16(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Uint32(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Int32(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Float32(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Bool(v) => w.write_all(&[u8::from(*v)])?,
        GGUFValue::String(s) => write_string(w, s)?,
        GGUFValue::Array { elem_type, values } => {
            w.write_all(&(*elem_type as u32).to_le_bytes())?;
            w.write_all(&(values.len() as u64).to_le_bytes())?;
            for v in values {
                if v.value_type() != *elem_type {
                    return Err(GGUFError::MalformedMetadata(format!(
                        "array of {elem_type:?} holds a {:?}",
                        v.value_type()
                    )));
                }
                write_value(w, v)?;
            }
        }
        GGUFValue::Uint64(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Int64(v) => w.write_all(&v.to_le_bytes())?,
        GGUFValue::Float64(v) => w.write_all(&v.to_le_bytes())?,
    }
    Ok(())
}
