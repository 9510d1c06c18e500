//! Driver-level helpers for device memory, pinned host memory and streams.
//! Everything here assumes `cuInit` succeeded, see [`init`].

use crate::Error;
use cuda_driver_sys::{self as cuda, cudaError_enum};
use std::{collections::HashMap, ffi::c_void};

pub(crate) trait ToResult {
    fn to_result(&self) -> Result<(), Error>;
}

impl ToResult for cudaError_enum {
    fn to_result(&self) -> Result<(), Error> {
        match self {
            cudaError_enum::CUDA_SUCCESS => Ok(()),
            cudaError_enum::CUDA_ERROR_DEINITIALIZED => {
                log::warn!("CUDA already deinitialized, maybe the main thread is exited");
                Ok(())
            }
            &err => {
                log::warn!("Cuda Error {:?}", err);
                Err(Error::Cuda(format!("{:?}", err)))
            }
        }
    }
}

pub(crate) fn init() -> Result<(), Error> {
    unsafe { cuda::cuInit(0).to_result() }
}

/// A retained primary context of one device.
pub(crate) struct DeviceContext {
    device: cuda::CUdevice,
    context: cuda::CUcontext,
}

// SAFETY: a primary context may be made current on any thread.
unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl DeviceContext {
    pub fn retain(device_id: i32) -> Result<Self, Error> {
        init()?;
        unsafe {
            let mut device: cuda::CUdevice = 0;
            cuda::cuDeviceGet(&mut device as *mut _, device_id).to_result()?;
            let mut context = std::ptr::null_mut();
            cuda::cuDevicePrimaryCtxRetain(&mut context as *mut _, device).to_result()?;
            Ok(DeviceContext { device, context })
        }
    }

    pub fn set_current(&self) -> Result<(), Error> {
        unsafe { cuda::cuCtxSetCurrent(self.context).to_result() }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = cuda::cuDevicePrimaryCtxRelease(self.device).to_result();
        }
    }
}

/// Device allocations of one device, with the size-keyed cache used by
/// `GpuPool` allocations.
pub(crate) struct DevicePool {
    context: DeviceContext,
    cached: HashMap<usize, Vec<u64>>,
}

impl DevicePool {
    pub fn new(device_id: i32) -> Result<Self, Error> {
        Ok(DevicePool {
            context: DeviceContext::retain(device_id)?,
            cached: HashMap::new(),
        })
    }

    pub fn allocate(&mut self, size: usize) -> Result<u64, Error> {
        self.context.set_current()?;
        let mut pointer = 0u64;
        unsafe {
            cuda::cuMemAlloc_v2(&mut pointer as *mut _, size.max(1)).to_result()?;
        }
        Ok(pointer)
    }

    pub fn take_cached(&mut self, size: usize) -> Option<u64> {
        self.cached.get_mut(&size).and_then(|cache| cache.pop())
    }

    pub fn take_any(&mut self) -> Option<u64> {
        self.cached.values_mut().find_map(|cache| cache.pop())
    }

    pub fn cache(&mut self, size: usize, pointer: u64) {
        self.cached.entry(size).or_insert_with(Vec::new).push(pointer);
    }

    pub fn free(&self, pointer: u64) {
        if self.context.set_current().is_ok() {
            unsafe {
                let _ = cuda::cuMemFree_v2(pointer).to_result();
            }
        }
    }
}

impl Drop for DevicePool {
    fn drop(&mut self) {
        let pointers: Vec<u64> = self.cached.drain().flat_map(|(_, v)| v).collect();
        for pointer in pointers {
            self.free(pointer);
        }
    }
}

pub(crate) fn alloc_pinned(size: usize) -> Result<*mut u8, Error> {
    init()?;
    let mut pointer: *mut c_void = std::ptr::null_mut();
    unsafe {
        cuda::cuMemAllocHost_v2(&mut pointer as *mut _, size.max(1)).to_result()?;
    }
    Ok(pointer as *mut u8)
}

pub(crate) fn free_pinned(pointer: *mut u8) {
    unsafe {
        let _ = cuda::cuMemFreeHost(pointer as *mut c_void).to_result();
    }
}

/// A non-blocking stream on one device.
pub(crate) struct DeviceStream {
    context: DeviceContext,
    inner: cuda::CUstream,
}

unsafe impl Send for DeviceStream {}

impl DeviceStream {
    pub fn new(device_id: i32) -> Result<Self, Error> {
        let context = DeviceContext::retain(device_id)?;
        context.set_current()?;
        let mut inner = std::ptr::null_mut();
        unsafe {
            cuda::cuStreamCreate(&mut inner as *mut _, 0x1).to_result()?;
        }
        Ok(DeviceStream { context, inner })
    }

    /// # Safety
    /// `src` must stay readable and `dst` allocated until the stream is
    /// synchronized.
    pub unsafe fn host_to_device(&self, dst: u64, src: *const u8, len: usize) -> Result<(), Error> {
        self.context.set_current()?;
        cuda::cuMemcpyHtoDAsync_v2(dst, src as *const c_void, len, self.inner).to_result()
    }

    /// # Safety
    /// `dst` must stay writable until the stream is synchronized.
    pub unsafe fn device_to_host(&self, dst: *mut u8, src: u64, len: usize) -> Result<(), Error> {
        self.context.set_current()?;
        cuda::cuMemcpyDtoHAsync_v2(dst as *mut c_void, src, len, self.inner).to_result()
    }

    /// # Safety
    /// Both pointers must stay allocated until the stream is synchronized.
    pub unsafe fn device_to_device(&self, dst: u64, src: u64, len: usize) -> Result<(), Error> {
        self.context.set_current()?;
        cuda::cuMemcpyDtoDAsync_v2(dst, src, len, self.inner).to_result()
    }

    pub fn synchronize(&self) -> Result<(), Error> {
        self.context.set_current()?;
        unsafe { cuda::cuStreamSynchronize(self.inner).to_result() }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        if self.context.set_current().is_ok() {
            unsafe {
                let _ = cuda::cuStreamDestroy_v2(self.inner).to_result();
            }
        }
    }
}
