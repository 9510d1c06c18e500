//! Byte copies between [`Memory`] buffers.

#[cfg(feature = "cuda")]
use crate::cuda::DeviceStream;
use crate::{Error, Memory};

/// An ordered queue of copies.
///
/// Host to host copies complete before `copy` returns. Copies touching device
/// memory are queued on the device stream and only complete after
/// [`CopyStream::synchronize`].
pub struct CopyStream {
    device_id: Option<i32>,
    #[cfg(feature = "cuda")]
    stream: Option<DeviceStream>,
}

fn check_bounds(memory: &Memory, offset: usize, len: usize) -> Result<(), Error> {
    match offset.checked_add(len) {
        Some(end) if end <= memory.size() => Ok(()),
        _ => Err(Error::OutOfBounds {
            offset,
            len,
            size: memory.size(),
        }),
    }
}

impl CopyStream {
    /// A stream that can only copy between host buffers.
    pub fn host() -> Self {
        CopyStream {
            device_id: None,
            #[cfg(feature = "cuda")]
            stream: None,
        }
    }

    /// A stream bound to one device.
    #[cfg(feature = "cuda")]
    pub fn for_device(device_id: i32) -> Result<Self, Error> {
        Ok(CopyStream {
            device_id: Some(device_id),
            stream: Some(DeviceStream::new(device_id)?),
        })
    }

    /// The device this stream is bound to.
    pub fn device_id(&self) -> Option<i32> {
        self.device_id
    }

    /// Copy `len` bytes from `src[src_offset..]` to `dst[dst_offset..]`.
    ///
    /// Returns `true` when the copy was queued asynchronously. Both buffers
    /// must then stay alive until the stream is synchronized.
    pub fn copy(
        &self,
        src: &Memory,
        src_offset: usize,
        dst: &mut Memory,
        dst_offset: usize,
        len: usize,
    ) -> Result<bool, Error> {
        check_bounds(src, src_offset, len)?;
        check_bounds(dst, dst_offset, len)?;
        if len == 0 {
            return Ok(false);
        }
        if src.memory_type().is_host() && dst.memory_type().is_host() {
            if let (Some(from), Some(to)) = (src.as_slice(), dst.as_mut_slice()) {
                to[dst_offset..dst_offset + len].copy_from_slice(&from[src_offset..src_offset + len]);
                return Ok(false);
            }
        }
        self.copy_device(src, src_offset, dst, dst_offset, len)
    }

    #[cfg(feature = "cuda")]
    fn copy_device(
        &self,
        src: &Memory,
        src_offset: usize,
        dst: &mut Memory,
        dst_offset: usize,
        len: usize,
    ) -> Result<bool, Error> {
        let stream = self.stream.as_ref().ok_or_else(|| {
            Error::Unsupported(format!(
                "copy from {} to {} memory needs a device stream",
                src.memory_type(),
                dst.memory_type()
            ))
        })?;
        let missing = || Error::Unsupported("buffer has no addressable storage".to_string());
        unsafe {
            match (src.device_ptr(), dst.device_ptr()) {
                (Some(from), Some(to)) => stream.device_to_device(
                    to + dst_offset as u64,
                    from + src_offset as u64,
                    len,
                )?,
                (None, Some(to)) => {
                    let from = src.as_slice().ok_or_else(missing)?;
                    stream.host_to_device(to + dst_offset as u64, from.as_ptr().add(src_offset), len)?
                }
                (Some(from), None) => {
                    let to = dst.as_mut_slice().ok_or_else(missing)?;
                    stream.device_to_host(to.as_mut_ptr().add(dst_offset), from + src_offset as u64, len)?
                }
                (None, None) => return Err(missing()),
            }
        }
        Ok(true)
    }

    #[cfg(not(feature = "cuda"))]
    fn copy_device(
        &self,
        src: &Memory,
        _src_offset: usize,
        dst: &mut Memory,
        _dst_offset: usize,
        _len: usize,
    ) -> Result<bool, Error> {
        Err(Error::Unsupported(format!(
            "copy from {} to {} memory requires the `cuda` feature",
            src.memory_type(),
            dst.memory_type()
        )))
    }

    /// Block until every queued copy is complete.
    pub fn synchronize(&self) -> Result<(), Error> {
        #[cfg(feature = "cuda")]
        {
            if let Some(stream) = &self.stream {
                stream.synchronize()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{AllocationType, MemoryManager, MemoryType};

    #[test]
    fn test_host_copy() {
        let stream = CopyStream::host();
        let src = Memory::from_vec(vec![1, 2, 3, 4, 5, 6]);
        let mut dst = Memory::from_vec(vec![0; 8]);
        assert_eq!(stream.copy(&src, 2, &mut dst, 4, 4), Ok(false));
        assert_eq!(dst.as_slice(), Some(&[0u8, 0, 0, 0, 3, 4, 5, 6][..]));
        stream.synchronize().unwrap();
        assert_eq!(stream.device_id(), None);
    }

    #[test]
    fn test_copy_bounds() {
        let stream = CopyStream::host();
        let src = Memory::from_vec(vec![1, 2, 3]);
        let mut dst = Memory::from_vec(vec![0; 4]);
        assert_eq!(
            stream.copy(&src, 1, &mut dst, 0, 3),
            Err(Error::OutOfBounds {
                offset: 1,
                len: 3,
                size: 3
            })
        );
        assert_eq!(
            stream.copy(&src, 0, &mut dst, 2, 3),
            Err(Error::OutOfBounds {
                offset: 2,
                len: 3,
                size: 4
            })
        );
        assert_eq!(stream.copy(&src, 3, &mut dst, 4, 0), Ok(false));
        assert_eq!(dst.as_slice(), Some(&[0u8; 4][..]));
    }

    #[test]
    fn test_copy_into_managed_memory() {
        let manager = MemoryManager::new();
        let stream = CopyStream::host();
        let mut dst = manager.create(&[AllocationType::Cpu], 0, 6).unwrap();
        let a = Memory::from_vec(vec![1, 1]);
        let b = Memory::from_vec(vec![2, 2, 2, 2]);
        stream.copy(&a, 0, &mut dst, 0, 2).unwrap();
        stream.copy(&b, 0, &mut dst, 2, 4).unwrap();
        assert_eq!(dst.as_slice(), Some(&[1u8, 1, 2, 2, 2, 2][..]));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_device_copy_unsupported() {
        let stream = CopyStream::host();
        let src = Memory::from_vec(vec![1, 2]);
        let mut dst = unsafe { Memory::from_raw_parts(MemoryType::Gpu, 0, 0x1000, 2, None) };
        assert!(matches!(
            stream.copy(&src, 0, &mut dst, 0, 2),
            Err(Error::Unsupported(_))
        ));
    }

    #[cfg(feature = "cuda")]
    mod gpu {
        use super::*;
        use serial_test::serial;

        #[test]
        #[serial]
        fn test_device_round_trip() {
            let manager = MemoryManager::new();
            let stream = CopyStream::for_device(0).unwrap();
            assert_eq!(stream.device_id(), Some(0));
            let src = Memory::from_vec((0..32).collect());
            let mut device = manager.create(&[AllocationType::Gpu], 0, 32).unwrap();
            let mut back = manager.create(&[AllocationType::CpuPinned], 0, 32).unwrap();
            assert_eq!(back.memory_type(), MemoryType::CpuPinned);
            assert_eq!(stream.copy(&src, 0, &mut device, 0, 32), Ok(true));
            assert_eq!(stream.copy(&device, 0, &mut back, 0, 32), Ok(true));
            stream.synchronize().unwrap();
            assert_eq!(back.as_slice(), src.as_slice());
        }
    }
}
