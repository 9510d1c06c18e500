#![deny(missing_docs)]
#![warn(clippy::all)]

//! MemoryManager hands out host and device buffers for batched execution and
//! moves bytes between them through copy streams.
//!
//! Device memory and streams need the `cuda` feature. Without it every
//! device allocation type reports [`Error::Unsupported`], so a preference
//! list can still fall back to host memory.

#[cfg(feature = "cuda")]
mod cuda;
mod memory;
mod memory_manager;
mod stream;

pub use crate::memory::Memory;
pub use crate::memory_manager::MemoryManager;
pub use crate::stream::CopyStream;

use std::fmt;

/// Where a buffer physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Pageable host memory.
    Cpu,
    /// Page-locked host memory, addressable by the device for async copies.
    CpuPinned,
    /// Device memory.
    Gpu,
}

impl MemoryType {
    /// Host memory of any kind can be read and written through a slice.
    pub fn is_host(self) -> bool {
        !matches!(self, MemoryType::Gpu)
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryType::Cpu => f.write_str("CPU"),
            MemoryType::CpuPinned => f.write_str("CPU_PINNED"),
            MemoryType::Gpu => f.write_str("GPU"),
        }
    }
}

/// How [`MemoryManager::create`] should obtain a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// Host memory, recycled through the manager's size-keyed cache.
    Cpu,
    /// Page-locked host memory, recycled through the manager's cache.
    CpuPinned,
    /// Device memory allocated directly and freed on drop.
    Gpu,
    /// Device memory recycled through a per-device cache.
    GpuPool,
}

impl AllocationType {
    /// The memory type a buffer of this allocation type ends up in.
    pub fn memory_type(self) -> MemoryType {
        match self {
            AllocationType::Cpu => MemoryType::Cpu,
            AllocationType::CpuPinned => MemoryType::CpuPinned,
            AllocationType::Gpu | AllocationType::GpuPool => MemoryType::Gpu,
        }
    }
}

impl fmt::Display for AllocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationType::Cpu => f.write_str("CPU"),
            AllocationType::CpuPinned => f.write_str("CPU_PINNED"),
            AllocationType::Gpu => f.write_str("GPU"),
            AllocationType::GpuPool => f.write_str("GPU_POOL"),
        }
    }
}

/// Errors from allocation and copy calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Error code returned by the CUDA driver.
    #[error("cuda error {0}")]
    Cuda(String),
    /// The requested memory or copy kind is not available in this build.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Every entry of a preference list failed.
    #[error("failed to allocate {size} bytes from {preferences}: {last}")]
    Exhausted {
        /// Requested size in bytes.
        size: usize,
        /// The preference list that was tried, in order.
        preferences: String,
        /// Message of the last failure.
        last: String,
    },
    /// A copy reached past the end of a buffer.
    #[error("copy of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds {
        /// Offset into the buffer.
        offset: usize,
        /// Requested copy length.
        len: usize,
        /// Size of the buffer.
        size: usize,
    },
}
