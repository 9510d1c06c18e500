//! Strided tensors over shared [`Memory`].

use crate::Error;
use memory_manager::{Memory, MemoryType};
use std::{fmt, sync::Arc};

/// Element types a module can consume and produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// 1-byte boolean.
    Bool,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE half precision.
    Float16,
    /// IEEE single precision.
    Float32,
    /// IEEE double precision.
    Float64,
}

impl ScalarType {
    /// Bytes per element.
    pub fn element_size(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::Uint8 | ScalarType::Int8 => 1,
            ScalarType::Int16 | ScalarType::Float16 => 2,
            ScalarType::Int32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::Float64 => 8,
        }
    }

    /// Type code used across the shared-library boundary.
    pub fn code(self) -> i32 {
        match self {
            ScalarType::Uint8 => 0,
            ScalarType::Int8 => 1,
            ScalarType::Int16 => 2,
            ScalarType::Int32 => 3,
            ScalarType::Int64 => 4,
            ScalarType::Float16 => 5,
            ScalarType::Float32 => 6,
            ScalarType::Float64 => 7,
            ScalarType::Bool => 11,
        }
    }

    /// Inverse of [`ScalarType::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ScalarType::Uint8,
            1 => ScalarType::Int8,
            2 => ScalarType::Int16,
            3 => ScalarType::Int32,
            4 => ScalarType::Int64,
            5 => ScalarType::Float16,
            6 => ScalarType::Float32,
            7 => ScalarType::Float64,
            11 => ScalarType::Bool,
            _ => return None,
        })
    }
}

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Host memory.
    Cpu,
    /// Device memory of the given device.
    Cuda(i32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

/// Rust types that map onto a [`ScalarType`].
pub trait Element: Copy {
    /// The matching scalar type.
    const SCALAR_TYPE: ScalarType;
    /// Append the native-endian bytes of `self`.
    fn write_ne(self, out: &mut Vec<u8>);
    /// Read one value from exactly `element_size` native-endian bytes.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! element {
    ($t:ty, $scalar:ident) => {
        impl Element for $t {
            const SCALAR_TYPE: ScalarType = ScalarType::$scalar;
            fn write_ne(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }
            fn read_ne(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }
        }
    };
}

element!(u8, Uint8);
element!(i8, Int8);
element!(i16, Int16);
element!(i32, Int32);
element!(i64, Int64);
element!(f32, Float32);
element!(f64, Float64);

impl Element for bool {
    const SCALAR_TYPE: ScalarType = ScalarType::Bool;
    fn write_ne(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

fn contiguous_strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1].max(1);
    }
    strides
}

/// A strided view over a shared buffer. Strides and offset count elements.
#[derive(Clone)]
pub struct Tensor {
    dtype: ScalarType,
    shape: Vec<i64>,
    strides: Vec<i64>,
    offset: usize,
    storage: Arc<Memory>,
}

impl Tensor {
    /// A contiguous tensor over the whole of `memory`.
    pub fn from_memory(memory: Memory, dtype: ScalarType, shape: &[i64]) -> Result<Self, Error> {
        Tensor::from_parts(
            Arc::new(memory),
            dtype,
            shape.to_vec(),
            contiguous_strides(shape),
            0,
        )
    }

    /// A strided view over shared storage.
    pub fn from_parts(
        storage: Arc<Memory>,
        dtype: ScalarType,
        shape: Vec<i64>,
        strides: Vec<i64>,
        offset: usize,
    ) -> Result<Self, Error> {
        if shape.len() != strides.len() {
            return Err(Error::Tensor(format!(
                "shape {:?} and strides {:?} differ in rank",
                shape, strides
            )));
        }
        if shape.iter().chain(&strides).any(|&v| v < 0) {
            return Err(Error::Tensor(format!(
                "negative extent in shape {:?} or strides {:?}",
                shape, strides
            )));
        }
        let tensor = Tensor {
            dtype,
            shape,
            strides,
            offset,
            storage,
        };
        if tensor.numel() > 0 {
            let last = tensor.offset as i64
                + tensor
                    .shape
                    .iter()
                    .zip(&tensor.strides)
                    .map(|(n, s)| (n - 1) * s)
                    .sum::<i64>();
            let needed = (last as usize + 1) * dtype.element_size();
            if needed > tensor.storage.size() {
                return Err(Error::Tensor(format!(
                    "view needs {} bytes but storage holds {}",
                    needed,
                    tensor.storage.size()
                )));
            }
        }
        Ok(tensor)
    }

    /// A host tensor holding `data`.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[i64]) -> Result<Self, Error> {
        let mut bytes = Vec::with_capacity(data.len() * T::SCALAR_TYPE.element_size());
        for value in data {
            value.write_ne(&mut bytes);
        }
        Tensor::from_bytes(bytes, T::SCALAR_TYPE, shape)
    }

    /// A host tensor over raw native-endian bytes.
    pub fn from_bytes(bytes: Vec<u8>, dtype: ScalarType, shape: &[i64]) -> Result<Self, Error> {
        let expected = shape.iter().product::<i64>().max(0) as usize * dtype.element_size();
        if bytes.len() != expected {
            return Err(Error::Tensor(format!(
                "{} bytes do not match shape {:?} of {:?}",
                bytes.len(),
                shape,
                dtype
            )));
        }
        Tensor::from_memory(Memory::from_vec(bytes), dtype, shape)
    }

    /// Element type.
    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    /// Extent of every dimension.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Element stride of every dimension.
    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product::<i64>() as usize
    }

    /// Bytes covered by the elements of this view.
    pub fn byte_size(&self) -> usize {
        self.numel() * self.dtype.element_size()
    }

    /// Offset of the first element into the storage, in bytes.
    pub fn byte_offset(&self) -> usize {
        self.offset * self.dtype.element_size()
    }

    /// The underlying buffer.
    pub fn memory(&self) -> &Memory {
        &self.storage
    }

    /// Placement of the storage.
    pub fn device(&self) -> Device {
        match self.storage.memory_type() {
            MemoryType::Gpu => Device::Cuda(self.storage.memory_type_id()),
            MemoryType::Cpu | MemoryType::CpuPinned => Device::Cpu,
        }
    }

    /// Whether elements are laid out densely in row-major order.
    pub fn is_contiguous(&self) -> bool {
        if self.numel() == 0 {
            return true;
        }
        let mut expected = 1;
        for (&n, &s) in self.shape.iter().zip(&self.strides).rev() {
            if n != 1 && s != expected {
                return false;
            }
            expected *= n;
        }
        true
    }

    /// Swap two dimensions without moving data.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self, Error> {
        if dim0 >= self.shape.len() || dim1 >= self.shape.len() {
            return Err(Error::Tensor(format!(
                "cannot transpose dims {} and {} of a rank {} tensor",
                dim0,
                dim1,
                self.shape.len()
            )));
        }
        let mut tensor = self.clone();
        tensor.shape.swap(dim0, dim1);
        tensor.strides.swap(dim0, dim1);
        Ok(tensor)
    }

    /// A contiguous tensor with the same values. Host tensors are repacked,
    /// device tensors must already be contiguous.
    pub fn contiguous(&self) -> Result<Self, Error> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let bytes = self.storage.as_slice().ok_or_else(|| {
            Error::Tensor(format!(
                "cannot repack a non-contiguous tensor on {}",
                self.device()
            ))
        })?;
        let size = self.dtype.element_size();
        let mut packed = Vec::with_capacity(self.byte_size());
        let mut index = vec![0i64; self.shape.len()];
        for _ in 0..self.numel() {
            let element = self.offset as i64
                + index
                    .iter()
                    .zip(&self.strides)
                    .map(|(i, s)| i * s)
                    .sum::<i64>();
            let start = element as usize * size;
            packed.extend_from_slice(&bytes[start..start + size]);
            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        Tensor::from_bytes(packed, self.dtype, &self.shape)
    }

    /// Bytes of a contiguous host tensor.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        if !self.is_contiguous() {
            return None;
        }
        let start = self.byte_offset();
        self.storage
            .as_slice()
            .map(|bytes| &bytes[start..start + self.byte_size()])
    }

    /// Copy the values of a host tensor out in row-major order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, Error> {
        if T::SCALAR_TYPE != self.dtype {
            return Err(Error::Tensor(format!(
                "cannot read {:?} elements as {:?}",
                self.dtype,
                T::SCALAR_TYPE
            )));
        }
        let packed = self.contiguous()?;
        let bytes = packed.as_bytes().ok_or_else(|| {
            Error::Tensor(format!("cannot read tensor on {}", self.device()))
        })?;
        Ok(bytes
            .chunks_exact(self.dtype.element_size())
            .map(T::read_ne)
            .collect())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("device", &self.device())
            .finish()
    }
}
