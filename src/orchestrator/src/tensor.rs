//! Tensor descriptors exchanged with the host.

use memory_manager::MemoryType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a request or response tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean, one byte per element.
    #[serde(rename = "TYPE_BOOL")]
    Bool,
    /// Unsigned 8-bit integer.
    #[serde(rename = "TYPE_UINT8")]
    Uint8,
    /// Unsigned 16-bit integer.
    #[serde(rename = "TYPE_UINT16")]
    Uint16,
    /// Unsigned 32-bit integer.
    #[serde(rename = "TYPE_UINT32")]
    Uint32,
    /// Unsigned 64-bit integer.
    #[serde(rename = "TYPE_UINT64")]
    Uint64,
    /// Signed 8-bit integer.
    #[serde(rename = "TYPE_INT8")]
    Int8,
    /// Signed 16-bit integer.
    #[serde(rename = "TYPE_INT16")]
    Int16,
    /// Signed 32-bit integer.
    #[serde(rename = "TYPE_INT32")]
    Int32,
    /// Signed 64-bit integer.
    #[serde(rename = "TYPE_INT64")]
    Int64,
    /// IEEE half precision float.
    #[serde(rename = "TYPE_FP16")]
    Fp16,
    /// IEEE single precision float.
    #[serde(rename = "TYPE_FP32")]
    Fp32,
    /// IEEE double precision float.
    #[serde(rename = "TYPE_FP64")]
    Fp64,
    /// bfloat16.
    #[serde(rename = "TYPE_BF16")]
    Bf16,
    /// Variable-length byte strings.
    #[serde(rename = "TYPE_STRING")]
    Bytes,
}

impl DataType {
    /// Bytes per element, `None` for variable-length types.
    pub fn element_size(self) -> Option<usize> {
        Some(match self {
            DataType::Bool | DataType::Uint8 | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 | DataType::Fp16 | DataType::Bf16 => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Fp32 => 4,
            DataType::Uint64 | DataType::Int64 | DataType::Fp64 => 8,
            DataType::Bytes => return None,
        })
    }

    /// Whether the type is an integer type.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::Uint8
                | DataType::Uint16
                | DataType::Uint32
                | DataType::Uint64
                | DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
        )
    }

    /// Parse a configuration name such as `TYPE_FP32`.
    pub fn from_config_str(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataType::Bool => "BOOL",
            DataType::Uint8 => "UINT8",
            DataType::Uint16 => "UINT16",
            DataType::Uint32 => "UINT32",
            DataType::Uint64 => "UINT64",
            DataType::Int8 => "INT8",
            DataType::Int16 => "INT16",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Fp16 => "FP16",
            DataType::Fp32 => "FP32",
            DataType::Fp64 => "FP64",
            DataType::Bf16 => "BF16",
            DataType::Bytes => "BYTES",
        })
    }
}

/// Byte size of a dense tensor, `None` for variable-length types or
/// negative dimensions.
pub fn byte_size(dtype: DataType, shape: &[i64]) -> Option<usize> {
    let mut count = 1usize;
    for &dim in shape {
        if dim < 0 {
            return None;
        }
        count = count.checked_mul(dim as usize)?;
    }
    count.checked_mul(dtype.element_size()?)
}

/// Name, type, shape and placement of one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    /// Declared tensor name.
    pub name: String,
    /// Element type.
    pub dtype: DataType,
    /// Extent of every dimension.
    pub shape: Vec<i64>,
    /// Where the data lives.
    pub memory_type: MemoryType,
    /// Device id for device memory.
    pub memory_type_id: i32,
}

impl TensorDescriptor {
    /// Dense byte size of the described tensor.
    pub fn byte_size(&self) -> Option<usize> {
        byte_size(self.dtype, &self.shape)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_names() {
        assert_eq!(DataType::from_config_str("TYPE_FP32"), Some(DataType::Fp32));
        assert_eq!(DataType::from_config_str("TYPE_STRING"), Some(DataType::Bytes));
        assert_eq!(DataType::from_config_str("FP32"), None);
        assert_eq!(DataType::Int64.to_string(), "INT64");
        assert_eq!(
            serde_json::to_string(&DataType::Uint16).unwrap(),
            "\"TYPE_UINT16\""
        );
    }

    #[test]
    fn test_byte_size() {
        assert_eq!(byte_size(DataType::Fp32, &[6, 3, 2]), Some(144));
        assert_eq!(byte_size(DataType::Int8, &[]), Some(1));
        assert_eq!(byte_size(DataType::Fp64, &[0, 4]), Some(0));
        assert_eq!(byte_size(DataType::Fp32, &[-1, 4]), None);
        assert_eq!(byte_size(DataType::Bytes, &[2]), None);
        let descriptor = TensorDescriptor {
            name: "x__0".to_string(),
            dtype: DataType::Fp16,
            shape: vec![2, 2],
            memory_type: MemoryType::Cpu,
            memory_type_id: 0,
        };
        assert_eq!(descriptor.byte_size(), Some(8));
        assert!(DataType::Uint64.is_integer());
        assert!(!DataType::Bool.is_integer());
    }
}
