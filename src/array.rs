//! Numeric arrays handed to the bridge.
//!
//! Image normalization happens upstream; the bridge only needs a row-major
//! array with one element type, which it copies byte-for-byte into a shared
//! buffer.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Element type of a shared array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Uint16,
    Int32,
    Float32,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::Uint8 => 1,
            Self::Uint16 => 2,
            Self::Int32 | Self::Float32 => 4,
        }
    }

    /// numpy type code with explicit byte order.
    pub const fn numpy_code(self) -> &'static str {
        match self {
            Self::Uint8 => "|u1",
            Self::Uint16 => "<u2",
            Self::Int32 => "<i4",
            Self::Float32 => "<f4",
        }
    }

    /// Whether the type can hold label values.
    pub const fn is_integer(self) -> bool {
        !matches!(self, Self::Float32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint8 => write!(f, "uint8"),
            Self::Uint16 => write!(f, "uint16"),
            Self::Int32 => write!(f, "int32"),
            Self::Float32 => write!(f, "float32"),
        }
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uint8" | "u8" => Ok(Self::Uint8),
            "uint16" | "u16" => Ok(Self::Uint16),
            "int32" | "i32" => Ok(Self::Int32),
            "float32" | "f32" => Ok(Self::Float32),
            _ => Err(format!(
                "Unknown dtype: '{}'. Valid options: uint8, uint16, int32, float32",
                s
            )),
        }
    }
}

/// A dense array with a single element type.
#[derive(Debug, Clone, PartialEq)]
pub enum NdArray {
    Uint8(ArrayD<u8>),
    Uint16(ArrayD<u16>),
    Int32(ArrayD<i32>),
    Float32(ArrayD<f32>),
}

impl NdArray {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Uint8(_) => DType::Uint8,
            Self::Uint16(_) => DType::Uint16,
            Self::Int32(_) => DType::Int32,
            Self::Float32(_) => DType::Float32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Uint8(a) => a.shape(),
            Self::Uint16(a) => a.shape(),
            Self::Int32(a) => a.shape(),
            Self::Float32(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().width()
    }

    /// Copy the elements into `dest` in row-major order, little-endian.
    ///
    /// Iteration follows the logical index order, so arrays with transposed or
    /// strided memory layouts are written the same way as contiguous ones.
    pub fn write_le_bytes(&self, dest: &mut [u8]) -> Result<()> {
        if dest.len() != self.byte_len() {
            return Err(BridgeError::InvalidInput(format!(
                "destination holds {} bytes, array needs {}",
                dest.len(),
                self.byte_len()
            )));
        }
        match self {
            Self::Uint8(a) => {
                for (slot, v) in dest.iter_mut().zip(a.iter()) {
                    *slot = *v;
                }
            }
            Self::Uint16(a) => {
                for (chunk, v) in dest.chunks_exact_mut(2).zip(a.iter()) {
                    chunk.copy_from_slice(&v.to_le_bytes());
                }
            }
            Self::Int32(a) => {
                for (chunk, v) in dest.chunks_exact_mut(4).zip(a.iter()) {
                    chunk.copy_from_slice(&v.to_le_bytes());
                }
            }
            Self::Float32(a) => {
                for (chunk, v) in dest.chunks_exact_mut(4).zip(a.iter()) {
                    chunk.copy_from_slice(&v.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Serialize to a fresh little-endian byte vector.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.byte_len()];
        // Length always matches.
        let _ = self.write_le_bytes(&mut out);
        out
    }

    /// Rebuild an array from raw little-endian bytes plus shape and type.
    ///
    /// This is the inverse of [`NdArray::write_le_bytes`] and mirrors what the
    /// worker does with a shared buffer.
    pub fn from_le_bytes(bytes: &[u8], shape: &[usize], dtype: DType) -> Result<Self> {
        let count: usize = shape.iter().product();
        if bytes.len() != count * dtype.width() {
            return Err(BridgeError::InvalidInput(format!(
                "{} bytes cannot hold a {} array of shape {:?}",
                bytes.len(),
                dtype,
                shape
            )));
        }
        let dim = IxDyn(shape);
        let shape_err = |e: ndarray::ShapeError| BridgeError::InvalidInput(e.to_string());
        let array = match dtype {
            DType::Uint8 => {
                Self::Uint8(ArrayD::from_shape_vec(dim, bytes.to_vec()).map_err(shape_err)?)
            }
            DType::Uint16 => Self::Uint16(
                ArrayD::from_shape_vec(
                    dim,
                    bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                )
                .map_err(shape_err)?,
            ),
            DType::Int32 => Self::Int32(
                ArrayD::from_shape_vec(
                    dim,
                    bytes
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
                .map_err(shape_err)?,
            ),
            DType::Float32 => Self::Float32(
                ArrayD::from_shape_vec(
                    dim,
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
                .map_err(shape_err)?,
            ),
        };
        Ok(array)
    }

    /// Integer view of the elements in row-major order.
    ///
    /// Returns `None` for floating-point arrays.
    pub fn integer_values(&self) -> Option<Vec<i64>> {
        match self {
            Self::Uint8(a) => Some(a.iter().map(|v| i64::from(*v)).collect()),
            Self::Uint16(a) => Some(a.iter().map(|v| i64::from(*v)).collect()),
            Self::Int32(a) => Some(a.iter().map(|v| i64::from(*v)).collect()),
            Self::Float32(_) => None,
        }
    }
}

impl From<ArrayD<u8>> for NdArray {
    fn from(a: ArrayD<u8>) -> Self {
        Self::Uint8(a)
    }
}

impl From<ArrayD<u16>> for NdArray {
    fn from(a: ArrayD<u16>) -> Self {
        Self::Uint16(a)
    }
}

impl From<ArrayD<i32>> for NdArray {
    fn from(a: ArrayD<i32>) -> Self {
        Self::Int32(a)
    }
}

impl From<ArrayD<f32>> for NdArray {
    fn from(a: ArrayD<f32>) -> Self {
        Self::Float32(a)
    }
}
