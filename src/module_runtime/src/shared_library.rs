//! Modules exported by a dynamic library through the C ABI in `c_api`.

use crate::c_api::{
    ForwardFn, LastErrorFn, RawTensor, ReleaseFn, DEVICE_CPU, DEVICE_GPU, MAX_OUTPUTS,
};
use crate::{Error, Module, ModuleOutput, Tensor};
use libloading::Library;
use memory_manager::{Memory, MemoryType};
use std::{
    ffi::CStr,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A module backed by a shared library.
pub struct SharedLibraryModule {
    path: PathBuf,
    forward: ForwardFn,
    release: ReleaseFn,
    last_error: Option<LastErrorFn>,
    library: Arc<Library>,
}

impl SharedLibraryModule {
    /// Artifact name used when a model does not name its own.
    pub const DEFAULT_FILENAME: &'static str = "model.so";

    /// Load `<repository>/<version>/<filename>`, `filename` defaulting to
    /// [`SharedLibraryModule::DEFAULT_FILENAME`].
    pub fn from_repository<P: AsRef<Path>>(
        repository: P,
        version: u64,
        filename: Option<&str>,
    ) -> Result<Self, Error> {
        let path = repository
            .as_ref()
            .join(version.to_string())
            .join(filename.unwrap_or(Self::DEFAULT_FILENAME));
        SharedLibraryModule::load(path)
    }

    /// Load a model library from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let load_error = |reason: String| Error::Load {
            path: path.display().to_string(),
            reason,
        };
        let library = Library::new(&path).map_err(|e| load_error(e.to_string()))?;
        let (forward, release, last_error) = unsafe {
            let forward = *library
                .get::<ForwardFn>(b"batch_module_forward\0")
                .map_err(|e| load_error(e.to_string()))?;
            let release = *library
                .get::<ReleaseFn>(b"batch_module_release\0")
                .map_err(|e| load_error(e.to_string()))?;
            let last_error = library
                .get::<LastErrorFn>(b"batch_module_last_error\0")
                .ok()
                .map(|symbol| *symbol);
            (forward, release, last_error)
        };
        log::info!("loaded module library {}", path.display());
        Ok(SharedLibraryModule {
            path,
            forward,
            release,
            last_error,
            library: Arc::new(library),
        })
    }

    /// Location the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn last_error(&self) -> Option<String> {
        let last_error = self.last_error?;
        unsafe {
            let message = last_error();
            if message.is_null() {
                None
            } else {
                Some(CStr::from_ptr(message).to_string_lossy().into_owned())
            }
        }
    }

    fn adopt(&self, raw: &RawTensor) -> Result<Tensor, Error> {
        let memory_type = match raw.device_type {
            DEVICE_CPU => MemoryType::Cpu,
            DEVICE_GPU => MemoryType::Gpu,
            other => {
                unsafe { (self.release)(raw.data) };
                return Err(Error::Execution(format!(
                    "module returned a tensor on unknown device type {}",
                    other
                )));
            }
        };
        let release = self.release;
        let library = self.library.clone();
        let data = raw.data;
        let release_data: Box<dyn FnOnce() + Send + Sync> = Box::new(move || {
            unsafe { release(data) };
            drop(library);
        });
        let memory = unsafe {
            Memory::from_raw_parts(
                memory_type,
                raw.device_id,
                data,
                raw.byte_size as usize,
                Some(release_data),
            )
        };
        Tensor::from_memory(memory, raw.scalar_type()?, raw.dims()?)
    }
}

impl Module for SharedLibraryModule {
    fn forward(&self, inputs: &[Tensor]) -> Result<ModuleOutput, Error> {
        let inputs = inputs
            .iter()
            .map(Tensor::contiguous)
            .collect::<Result<Vec<_>, _>>()?;
        let raw_inputs = inputs
            .iter()
            .map(RawTensor::describe)
            .collect::<Result<Vec<_>, _>>()?;
        let mut raw_outputs = [RawTensor::default(); MAX_OUTPUTS];
        let mut num_outputs = 0usize;
        let status = unsafe {
            (self.forward)(
                raw_inputs.as_ptr(),
                raw_inputs.len(),
                raw_outputs.as_mut_ptr(),
                MAX_OUTPUTS,
                &mut num_outputs as *mut _,
            )
        };
        let produced = &raw_outputs[..num_outputs.min(MAX_OUTPUTS)];
        if status != 0 {
            for raw in produced {
                unsafe { (self.release)(raw.data) };
            }
            let message = self
                .last_error()
                .unwrap_or_else(|| format!("status {}", status));
            return Err(Error::Execution(message));
        }
        // adopt everything first so every buffer gets released on error
        let adopted: Vec<_> = produced.iter().map(|raw| self.adopt(raw)).collect();
        let mut tensors = adopted.into_iter().collect::<Result<Vec<_>, _>>()?;
        log::debug!(
            "{} produced {} outputs for {} inputs",
            self.path.display(),
            tensors.len(),
            inputs.len()
        );
        if tensors.len() == 1 {
            if let Some(tensor) = tensors.pop() {
                return Ok(ModuleOutput::Tensor(tensor));
            }
        }
        Ok(ModuleOutput::Tuple(tensors))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "module_runtime_{}_{}",
            name,
            std::process::id()
        ));
        fs::create_dir_all(dir.join("1")).unwrap();
        dir
    }

    #[test]
    fn test_missing_library() {
        let dir = scratch_dir("missing");
        let err = SharedLibraryModule::from_repository(&dir, 1, None)
            .err()
            .unwrap();
        let expected = dir.join("1").join("model.so").display().to_string();
        assert_eq!(err, Error::NotFound(expected.clone()));
        assert_eq!(err.to_string(), format!("unable to find '{}'", expected));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_invalid_library() {
        let dir = scratch_dir("invalid");
        fs::write(dir.join("1").join("custom.so"), b"not a shared object").unwrap();
        let err = SharedLibraryModule::from_repository(&dir, 1, Some("custom.so"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Load { .. }));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_describe_raw_tensor() {
        let tensor = Tensor::from_vec(vec![1.5f32, 2.5, 3.5, 4.5], &[2, 2]).unwrap();
        let raw = RawTensor::describe(&tensor).unwrap();
        assert_eq!(raw.byte_size, 16);
        assert_eq!(raw.device_type, DEVICE_CPU);
        assert_eq!(raw.dims().unwrap(), &[2, 2]);
        assert_eq!(raw.scalar_type().unwrap(), crate::ScalarType::Float32);
        let host = tensor.as_bytes().unwrap();
        assert_eq!(raw.data, host.as_ptr() as usize as u64);
    }
}
