//! Pure-Rust GGUF file format codec.
//!
//! Reads a `.gguf` stream into its header, ordered metadata table and
//! tensor index **without** loading tensor payloads, and writes the
//! inverse with payloads pulled from a caller-supplied provider:
//!
//! * **parse**: full structural validation; payloads stay in the source
//!   stream and are addressed by byte range.
//! * **serialize**: canonical layout (offsets recomputed, every payload
//!   aligned), so `parse(serialize(m))` reproduces `m`'s metadata and
//!   descriptors.
//! * **quick scan**: a display summary of a single file.

pub mod model;
pub mod reader;
pub mod tensor;
pub mod types;
pub mod writer;

pub use model::ParsedModel;
pub use reader::{QuickScanResult, parse, parse_file, parse_index, quick_scan};
pub use tensor::{GGMLType, TensorInfo};
pub use types::{
    GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUFError, GGUFHeader, GGUFMetadataKV, GGUFValue,
    GGUFValueType, file_type_name,
};
pub use writer::{canonical_layout, encode_index, serialize, serialize_from};
