//! MemoryManager serves allocation requests from an ordered preference list
//! and keeps freed buffers in size-keyed caches for the next batch.

#[cfg(feature = "cuda")]
use crate::cuda::{self, DevicePool};
use crate::memory::{Memory, Storage};
use crate::{AllocationType, Error};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

const DEFAULT_CACHE_LIMIT: usize = 256 << 20;

#[cfg(feature = "cuda")]
struct PinnedPtr(*mut u8);

pub(crate) struct Pools {
    cache_limit: usize,
    cached_bytes: usize,
    host: HashMap<usize, Vec<Vec<u8>>>,
    #[cfg(feature = "cuda")]
    pinned: HashMap<usize, Vec<PinnedPtr>>,
    #[cfg(feature = "cuda")]
    devices: HashMap<i32, DevicePool>,
}

// SAFETY: cached pinned pointers are not aliased, they are handed out to a
// single `Memory` at a time.
unsafe impl Send for Pools {}

impl Pools {
    fn new(cache_limit: usize) -> Self {
        Pools {
            cache_limit,
            cached_bytes: 0,
            host: HashMap::new(),
            #[cfg(feature = "cuda")]
            pinned: HashMap::new(),
            #[cfg(feature = "cuda")]
            devices: HashMap::new(),
        }
    }

    fn has_room(&self, size: usize) -> bool {
        self.cached_bytes + size <= self.cache_limit
    }

    fn take_host(&mut self, size: usize) -> Option<Vec<u8>> {
        let bytes = self.host.get_mut(&size)?.pop()?;
        self.cached_bytes -= size;
        Some(bytes)
    }

    pub(crate) fn recycle_host(&mut self, bytes: Vec<u8>) {
        let size = bytes.len();
        if size > 0 && self.has_room(size) {
            self.cached_bytes += size;
            self.host.entry(size).or_insert_with(Vec::new).push(bytes);
        }
    }

    #[cfg(feature = "cuda")]
    fn take_pinned(&mut self, size: usize) -> Option<*mut u8> {
        let pointer = self.pinned.get_mut(&size)?.pop()?;
        self.cached_bytes -= size;
        Some(pointer.0)
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn recycle_pinned(&mut self, size: usize, pointer: *mut u8) {
        if self.has_room(size) {
            self.cached_bytes += size;
            self.pinned
                .entry(size)
                .or_insert_with(Vec::new)
                .push(PinnedPtr(pointer));
        } else {
            cuda::free_pinned(pointer);
        }
    }

    #[cfg(feature = "cuda")]
    fn device(&mut self, device_id: i32) -> Result<&mut DevicePool, Error> {
        if !self.devices.contains_key(&device_id) {
            let pool = DevicePool::new(device_id)?;
            self.devices.insert(device_id, pool);
        }
        self.devices
            .get_mut(&device_id)
            .ok_or_else(|| Error::Cuda(format!("device {} is not available", device_id)))
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn release_device(
        &mut self,
        device_id: i32,
        allocation_type: AllocationType,
        size: usize,
        pointer: u64,
    ) {
        let cache = allocation_type == AllocationType::GpuPool && self.has_room(size);
        if let Some(pool) = self.devices.get_mut(&device_id) {
            if cache {
                pool.cache(size, pointer);
                self.cached_bytes += size;
            } else {
                pool.free(pointer);
            }
        }
    }

    fn clear(&mut self) {
        self.host.clear();
        #[cfg(feature = "cuda")]
        {
            for (_, pointers) in self.pinned.drain() {
                for pointer in pointers {
                    cuda::free_pinned(pointer.0);
                }
            }
            for pool in self.devices.values_mut() {
                while let Some(pointer) = pool.take_any() {
                    pool.free(pointer);
                }
            }
        }
        self.cached_bytes = 0;
    }
}

#[cfg(feature = "cuda")]
impl Drop for Pools {
    fn drop(&mut self) {
        for (_, pointers) in self.pinned.drain() {
            for pointer in pointers {
                cuda::free_pinned(pointer.0);
            }
        }
    }
}

/// Thread-safe allocator shared by every model instance of a process.
///
/// Cloning is cheap, clones share the same caches.
#[derive(Clone)]
pub struct MemoryManager {
    pools: Arc<Mutex<Pools>>,
}

impl Default for MemoryManager {
    fn default() -> Self {
        MemoryManager {
            pools: Arc::new(Mutex::new(Pools::new(DEFAULT_CACHE_LIMIT))),
        }
    }
}

impl MemoryManager {
    /// Create a manager with a 256 MiB cache limit.
    pub fn new() -> Self {
        MemoryManager::default()
    }

    /// Upper bound in bytes for buffers kept around after they are dropped.
    /// A limit of 0 disables recycling.
    pub fn cache_limit(self, cache_limit: usize) -> Self {
        {
            let mut pools = self.lock();
            pools.cache_limit = cache_limit;
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `size` bytes, trying every entry of `preferences` in order.
    /// `device_id` is only used by the device allocation types.
    pub fn create(
        &self,
        preferences: &[AllocationType],
        device_id: i32,
        size: usize,
    ) -> Result<Memory, Error> {
        let mut last = Error::Unsupported("empty allocation preference list".to_string());
        for &allocation_type in preferences {
            match self.allocate(allocation_type, device_id, size) {
                Ok(memory) => return Ok(memory),
                Err(err) => {
                    log::warn!(
                        "unable to allocate {} bytes of {} memory on device {}: {}",
                        size,
                        allocation_type,
                        device_id,
                        err
                    );
                    last = err;
                }
            }
        }
        let preferences = preferences
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::Exhausted {
            size,
            preferences: format!("[{}]", preferences),
            last: last.to_string(),
        })
    }

    /// Allocate `size` bytes of exactly one allocation type.
    pub fn allocate(
        &self,
        allocation_type: AllocationType,
        device_id: i32,
        size: usize,
    ) -> Result<Memory, Error> {
        match allocation_type {
            AllocationType::Cpu => {
                let cached = self.lock().take_host(size);
                let bytes = cached.unwrap_or_else(|| vec![0; size]);
                Ok(Memory::allocated(
                    allocation_type,
                    0,
                    size,
                    Storage::Host(bytes),
                    self.pools.clone(),
                ))
            }
            AllocationType::CpuPinned => self.allocate_pinned(size),
            AllocationType::Gpu | AllocationType::GpuPool => {
                self.allocate_device(allocation_type, device_id, size)
            }
        }
    }

    #[cfg(feature = "cuda")]
    fn allocate_pinned(&self, size: usize) -> Result<Memory, Error> {
        let cached = self.lock().take_pinned(size);
        let pointer = match cached {
            Some(pointer) => pointer,
            None => cuda::alloc_pinned(size)?,
        };
        Ok(Memory::allocated(
            AllocationType::CpuPinned,
            0,
            size,
            Storage::Pinned(pointer),
            self.pools.clone(),
        ))
    }

    #[cfg(not(feature = "cuda"))]
    fn allocate_pinned(&self, _size: usize) -> Result<Memory, Error> {
        Err(Error::Unsupported(
            "pinned host memory requires the `cuda` feature".to_string(),
        ))
    }

    #[cfg(feature = "cuda")]
    fn allocate_device(
        &self,
        allocation_type: AllocationType,
        device_id: i32,
        size: usize,
    ) -> Result<Memory, Error> {
        let pointer = {
            let mut pools = self.lock();
            let cached = if allocation_type == AllocationType::GpuPool {
                pools.device(device_id)?.take_cached(size)
            } else {
                None
            };
            match cached {
                Some(pointer) => {
                    pools.cached_bytes -= size;
                    pointer
                }
                None => pools.device(device_id)?.allocate(size)?,
            }
        };
        Ok(Memory::allocated(
            allocation_type,
            device_id,
            size,
            Storage::Device(pointer),
            self.pools.clone(),
        ))
    }

    #[cfg(not(feature = "cuda"))]
    fn allocate_device(
        &self,
        allocation_type: AllocationType,
        device_id: i32,
        _size: usize,
    ) -> Result<Memory, Error> {
        Err(Error::Unsupported(format!(
            "{} memory on device {} requires the `cuda` feature",
            allocation_type, device_id
        )))
    }

    /// Bytes currently held by the caches.
    pub fn cached_bytes(&self) -> usize {
        self.lock().cached_bytes
    }

    /// Free every cached buffer.
    pub fn trim(&self) {
        self.lock().clear();
    }
}
