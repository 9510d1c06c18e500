//! Buffers handed out by [`MemoryManager`](crate::MemoryManager).
//! A `Memory` knows where it lives and gives its bytes back to the manager's
//! caches when dropped.

use crate::memory_manager::Pools;
use crate::{AllocationType, MemoryType};
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

type Release = Box<dyn FnOnce() + Send + Sync>;

pub(crate) enum Storage {
    Host(Vec<u8>),
    #[cfg(feature = "cuda")]
    Pinned(*mut u8),
    #[cfg(feature = "cuda")]
    Device(u64),
    // host address or device pointer, owned by somebody else
    Foreign {
        address: u64,
        release: Option<Release>,
    },
}

/// A contiguous buffer in host or device memory.
pub struct Memory {
    memory_type: MemoryType,
    memory_type_id: i32,
    allocation_type: Option<AllocationType>,
    size: usize,
    storage: Storage,
    owner: Option<Arc<Mutex<Pools>>>,
}

// SAFETY: raw pointers inside `Storage` are exclusively owned by this value,
// foreign release callbacks are required to be Send + Sync.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    pub(crate) fn allocated(
        allocation_type: AllocationType,
        memory_type_id: i32,
        size: usize,
        storage: Storage,
        owner: Arc<Mutex<Pools>>,
    ) -> Self {
        Memory {
            memory_type: allocation_type.memory_type(),
            memory_type_id,
            allocation_type: Some(allocation_type),
            size,
            storage,
            owner: Some(owner),
        }
    }

    /// Wrap bytes that already live in pageable host memory.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Memory {
            memory_type: MemoryType::Cpu,
            memory_type_id: 0,
            allocation_type: None,
            size: bytes.len(),
            storage: Storage::Host(bytes),
            owner: None,
        }
    }

    /// Wrap memory owned by a third party. `release` runs once, when the
    /// returned value is dropped.
    ///
    /// # Safety
    ///
    /// `address` must point to `size` bytes of `memory_type` memory on
    /// device `memory_type_id` that stay valid until `release` runs. Host
    /// addresses must be valid for reads and writes from any thread.
    pub unsafe fn from_raw_parts(
        memory_type: MemoryType,
        memory_type_id: i32,
        address: u64,
        size: usize,
        release: Option<Box<dyn FnOnce() + Send + Sync>>,
    ) -> Self {
        Memory {
            memory_type,
            memory_type_id,
            allocation_type: None,
            size,
            storage: Storage::Foreign { address, release },
            owner: None,
        }
    }

    /// Memory type of the buffer.
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Device id for device memory, 0 for host memory.
    pub fn memory_type_id(&self) -> i32 {
        self.memory_type_id
    }

    /// How the buffer was obtained, `None` for wrapped memory.
    pub fn allocation_type(&self) -> Option<AllocationType> {
        self.allocation_type
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the buffer holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The bytes of a host buffer, `None` for device memory.
    pub fn as_slice(&self) -> Option<&[u8]> {
        if !self.memory_type.is_host() {
            return None;
        }
        if self.size == 0 {
            return Some(&[]);
        }
        match &self.storage {
            Storage::Host(bytes) => Some(&bytes[..self.size]),
            #[cfg(feature = "cuda")]
            Storage::Pinned(ptr) => Some(unsafe { std::slice::from_raw_parts(*ptr, self.size) }),
            #[cfg(feature = "cuda")]
            Storage::Device(_) => None,
            Storage::Foreign { address, .. } => Some(unsafe {
                std::slice::from_raw_parts(*address as usize as *const u8, self.size)
            }),
        }
    }

    /// Mutable bytes of a host buffer, `None` for device memory.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.memory_type.is_host() {
            return None;
        }
        if self.size == 0 {
            return Some(&mut []);
        }
        let size = self.size;
        match &mut self.storage {
            Storage::Host(bytes) => Some(&mut bytes[..size]),
            #[cfg(feature = "cuda")]
            Storage::Pinned(ptr) => Some(unsafe { std::slice::from_raw_parts_mut(*ptr, size) }),
            #[cfg(feature = "cuda")]
            Storage::Device(_) => None,
            Storage::Foreign { address, .. } => Some(unsafe {
                std::slice::from_raw_parts_mut(*address as usize as *mut u8, size)
            }),
        }
    }

    /// Device pointer of a device buffer, `None` for host memory.
    pub fn device_ptr(&self) -> Option<u64> {
        if self.memory_type.is_host() {
            return None;
        }
        match &self.storage {
            #[cfg(feature = "cuda")]
            Storage::Device(ptr) => Some(*ptr),
            Storage::Foreign { address, .. } => Some(*address),
            _ => None,
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let storage = std::mem::replace(&mut self.storage, Storage::Host(Vec::new()));
        match storage {
            Storage::Foreign { release, .. } => {
                if let Some(release) = release {
                    release();
                }
            }
            Storage::Host(bytes) => {
                if let Some(owner) = &self.owner {
                    let mut pools = owner.lock().unwrap_or_else(PoisonError::into_inner);
                    pools.recycle_host(bytes);
                }
            }
            #[cfg(feature = "cuda")]
            Storage::Pinned(ptr) => match &self.owner {
                Some(owner) => {
                    let mut pools = owner.lock().unwrap_or_else(PoisonError::into_inner);
                    pools.recycle_pinned(self.size, ptr);
                }
                None => crate::cuda::free_pinned(ptr),
            },
            #[cfg(feature = "cuda")]
            Storage::Device(ptr) => {
                if let (Some(owner), Some(allocation_type)) = (&self.owner, self.allocation_type) {
                    let mut pools = owner.lock().unwrap_or_else(PoisonError::into_inner);
                    pools.release_device(self.memory_type_id, allocation_type, self.size, ptr);
                }
            }
        }
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("memory_type", &self.memory_type)
            .field("memory_type_id", &self.memory_type_id)
            .field("allocation_type", &self.allocation_type)
            .field("size", &self.size)
            .finish()
    }
}
