//! Tensor descriptors and the ggml element-type table.

use serde::{Deserialize, Serialize};

use crate::types::GGUFError;

/// Maximum number of dimensions a ggml tensor may declare.
pub const GGML_MAX_DIMS: u32 = 4;

/// ggml tensor element types, with the ids used in the tensor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum GGMLType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q8_1 = 9,
    Q2K = 10,
    Q3K = 11,
    Q4K = 12,
    Q5K = 13,
    Q6K = 14,
    Q8K = 15,
    IQ2XXS = 16,
    IQ2XS = 17,
    IQ3XXS = 18,
    IQ1S = 19,
    IQ4NL = 20,
    IQ3S = 21,
    IQ2S = 22,
    IQ4XS = 23,
    I8 = 24,
    I16 = 25,
    I32 = 26,
    I64 = 27,
    F64 = 28,
    IQ1M = 29,
    BF16 = 30,
    Q4_0_4_4 = 31,
    Q4_0_4_8 = 32,
    Q4_0_8_8 = 33,
    TQ1_0 = 34,
    TQ2_0 = 35,
}

impl TryFrom<u32> for GGMLType {
    type Error = GGUFError;
    fn try_from(v: u32) -> Result<Self, Self::Error> {
        let t = match v {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2K,
            11 => Self::Q3K,
            12 => Self::Q4K,
            13 => Self::Q5K,
            14 => Self::Q6K,
            15 => Self::Q8K,
            16 => Self::IQ2XXS,
            17 => Self::IQ2XS,
            18 => Self::IQ3XXS,
            19 => Self::IQ1S,
            20 => Self::IQ4NL,
            21 => Self::IQ3S,
            22 => Self::IQ2S,
            23 => Self::IQ4XS,
            24 => Self::I8,
            25 => Self::I16,
            26 => Self::I32,
            27 => Self::I64,
            28 => Self::F64,
            29 => Self::IQ1M,
            30 => Self::BF16,
            31 => Self::Q4_0_4_4,
            32 => Self::Q4_0_4_8,
            33 => Self::Q4_0_8_8,
            34 => Self::TQ1_0,
            35 => Self::TQ2_0,
            _ => {
                return Err(GGUFError::MalformedTensorIndex(format!(
                    "unknown ggml type id {v}"
                )));
            }
        };
        Ok(t)
    }
}

impl GGMLType {
    /// Elements per quantisation block.
    pub fn block_size(self) -> u64 {
        match self {
            Self::F32
            | Self::F16
            | Self::BF16
            | Self::F64
            | Self::I8
            | Self::I16
            | Self::I32
            | Self::I64 => 1,
            Self::Q4_0
            | Self::Q4_1
            | Self::Q5_0
            | Self::Q5_1
            | Self::Q8_0
            | Self::Q8_1
            | Self::IQ4NL
            | Self::Q4_0_4_4
            | Self::Q4_0_4_8
            | Self::Q4_0_8_8 => 32,
            Self::Q2K
            | Self::Q3K
            | Self::Q4K
            | Self::Q5K
            | Self::Q6K
            | Self::Q8K
            | Self::IQ2XXS
            | Self::IQ2XS
            | Self::IQ3XXS
            | Self::IQ1S
            | Self::IQ3S
            | Self::IQ2S
            | Self::IQ4XS
            | Self::IQ1M
            | Self::TQ1_0
            | Self::TQ2_0 => 256,
        }
    }

    /// Bytes per block.
    pub fn type_size(self) -> u64 {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::F64 => 8,
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::I64 => 8,
            Self::Q4_0 | Self::IQ4NL => 18,
            Self::Q4_0_4_4 | Self::Q4_0_4_8 | Self::Q4_0_8_8 => 18,
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => 34,
            Self::Q8_1 => 36,
            Self::Q2K => 84,
            Self::Q3K => 110,
            Self::Q4K => 144,
            Self::Q5K => 176,
            Self::Q6K => 210,
            Self::Q8K => 292,
            Self::IQ2XXS => 66,
            Self::IQ2XS => 74,
            Self::IQ3XXS => 98,
            Self::IQ1S => 50,
            Self::IQ3S => 110,
            Self::IQ2S => 82,
            Self::IQ4XS => 136,
            Self::IQ1M => 56,
            Self::TQ1_0 => 54,
            Self::TQ2_0 => 66,
        }
    }

    /// Byte length of a tensor with shape `dims` (innermost first).
    ///
    /// Rows are quantised independently, so the innermost dimension must be
    /// a whole number of blocks.
    pub fn byte_size(self, dims: &[u64]) -> Result<u64, GGUFError> {
        let block = self.block_size();
        let ne0 = dims.first().copied().unwrap_or(1);
        if ne0 % block != 0 {
            return Err(GGUFError::MalformedTensorIndex(format!(
                "row length {ne0} is not a multiple of the {self:?} block size {block}"
            )));
        }
        let rows = element_count(dims.get(1..).unwrap_or(&[]));
        rows.and_then(|rows| (ne0 / block).checked_mul(self.type_size())?.checked_mul(rows))
            .ok_or_else(|| GGUFError::MalformedTensorIndex("tensor byte size overflows".into()))
    }
}

/// One entry of the tensor index.
///
/// `offset` is relative to the start of the tensor-data region; `size` is
/// the exact payload length derived from `dims` and `ggml_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub ggml_type: GGMLType,
    pub offset: u64,
    pub size: u64,
}

impl TensorInfo {
    /// Build a descriptor, deriving its byte size. The offset is left at
    /// zero; the writer assigns real offsets.
    pub fn new(
        name: impl Into<String>,
        dims: Vec<u64>,
        ggml_type: GGMLType,
    ) -> Result<Self, GGUFError> {
        let name = name.into();
        if dims.is_empty() || dims.len() as u32 > GGML_MAX_DIMS {
            return Err(GGUFError::MalformedTensorIndex(format!(
                "tensor '{name}' has {} dimensions",
                dims.len()
            )));
        }
        if element_count(&dims).is_none() {
            return Err(GGUFError::MalformedTensorIndex(format!(
                "tensor '{name}' element count overflows"
            )));
        }
        let size = ggml_type.byte_size(&dims)?;
        Ok(Self {
            name,
            dims,
            ggml_type,
            offset: 0,
            size,
        })
    }

    pub fn n_elements(&self) -> u64 {
        element_count(&self.dims).unwrap_or(0)
    }
}

fn element_count(dims: &[u64]) -> Option<u64> {
    dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
}
