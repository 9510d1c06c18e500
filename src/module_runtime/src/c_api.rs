//! C ABI shared with model libraries.
//!
//! A model library exports
//!
//! ```c
//! int32_t batch_module_forward(const RawTensor *inputs, size_t num_inputs,
//!                              RawTensor *outputs, size_t max_outputs,
//!                              size_t *num_outputs);
//! void batch_module_release(uint64_t data);
//! const char *batch_module_last_error(void); /* optional */
//! ```
//!
//! Output buffers are owned by the library until handed back through
//! `batch_module_release`.

use crate::{Device, Error, ScalarType, Tensor};
use std::os::raw::c_char;

pub(crate) const MAX_DIMS: usize = 8;
pub(crate) const MAX_OUTPUTS: usize = 16;

pub(crate) const DEVICE_CPU: i32 = 1;
pub(crate) const DEVICE_GPU: i32 = 2;

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct RawTensor {
    pub data: u64,
    pub byte_size: u64,
    pub device_type: i32,
    pub device_id: i32,
    pub dtype: i32,
    pub ndim: i32,
    pub shape: [i64; MAX_DIMS],
}

impl Default for RawTensor {
    fn default() -> Self {
        RawTensor {
            data: 0,
            byte_size: 0,
            device_type: DEVICE_CPU,
            device_id: 0,
            dtype: 0,
            ndim: 0,
            shape: [0; MAX_DIMS],
        }
    }
}

impl RawTensor {
    /// Describe a contiguous tensor. The tensor must outlive the call.
    pub fn describe(tensor: &Tensor) -> Result<Self, Error> {
        if tensor.shape().len() > MAX_DIMS {
            return Err(Error::Tensor(format!(
                "rank {} exceeds the {} dimensions a module library accepts",
                tensor.shape().len(),
                MAX_DIMS
            )));
        }
        let memory = tensor.memory();
        let base = match tensor.device() {
            Device::Cpu => memory.as_slice().map(|bytes| bytes.as_ptr() as usize as u64),
            Device::Cuda(_) => memory.device_ptr(),
        }
        .ok_or_else(|| Error::Tensor("tensor storage has no address".to_string()))?;
        let (device_type, device_id) = match tensor.device() {
            Device::Cpu => (DEVICE_CPU, 0),
            Device::Cuda(id) => (DEVICE_GPU, id),
        };
        let mut shape = [0; MAX_DIMS];
        shape[..tensor.shape().len()].copy_from_slice(tensor.shape());
        Ok(RawTensor {
            data: base + tensor.byte_offset() as u64,
            byte_size: tensor.byte_size() as u64,
            device_type,
            device_id,
            dtype: tensor.dtype().code(),
            ndim: tensor.shape().len() as i32,
            shape,
        })
    }

    pub fn dims(&self) -> Result<&[i64], Error> {
        if self.ndim < 0 || self.ndim as usize > MAX_DIMS {
            return Err(Error::Execution(format!(
                "module returned a tensor of rank {}",
                self.ndim
            )));
        }
        Ok(&self.shape[..self.ndim as usize])
    }

    pub fn scalar_type(&self) -> Result<ScalarType, Error> {
        ScalarType::from_code(self.dtype).ok_or_else(|| {
            Error::Execution(format!("module returned unknown type code {}", self.dtype))
        })
    }
}

pub(crate) type ForwardFn = unsafe extern "C" fn(
    inputs: *const RawTensor,
    num_inputs: usize,
    outputs: *mut RawTensor,
    max_outputs: usize,
    num_outputs: *mut usize,
) -> i32;

pub(crate) type ReleaseFn = unsafe extern "C" fn(data: u64);

pub(crate) type LastErrorFn = unsafe extern "C" fn() -> *const c_char;
