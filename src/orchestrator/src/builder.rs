//! Builder for ModelInstance, caller should provide the configuration and
//! either a module or a model repository to load it from.
use crate::{
    adapter::{to_scalar_type, ModelAdapter},
    config::{tensor_index, ModelConfig},
    instance::ModelInstance,
    sequence::resolve_controls,
    DataType, Error,
};
use memory_manager::{CopyStream, MemoryManager};
use module_runtime::{Device, Module, SharedLibraryModule};
use std::{collections::HashMap, path::Path};

/// Builder for one model instance
pub struct Builder {
    config: ModelConfig,
    device: Device,
    memory_manager: MemoryManager,
    instance_index: usize,
}

macro_rules! config {
    ($name:ident, $t: ty, $comment: literal) => {
        #[doc=$comment]
        pub fn $name(mut self, $name: $t) -> Self {
            self.$name = $name;
            self
        }
    };
}

impl Builder {
    /// Create a builder for a host instance of `config`
    pub fn new(config: ModelConfig) -> Self {
        Builder {
            config,
            device: Device::Cpu,
            memory_manager: MemoryManager::new(),
            instance_index: 0,
        }
    }

    config!(device, Device, "Device the instance runs on");
    config!(memory_manager, MemoryManager, "Allocator shared with other instances");
    config!(instance_index, usize, "Position of the instance within its model");

    fn instance_name(&self) -> String {
        format!("{}_{}", self.config.name, self.instance_index)
    }

    /// Load the module from `<repository>/<version>/<artifact>` and build
    /// the instance
    pub fn load<P: AsRef<Path>>(self, repository: P, version: u64) -> Result<ModelInstance, Error> {
        let filename = self.config.default_model_filename.as_deref();
        let module = SharedLibraryModule::from_repository(repository, version, filename)
            .map_err(|err| match err {
                module_runtime::Error::NotFound(path) => Error::Unavailable(format!(
                    "unable to find '{}' for model instance '{}'",
                    path,
                    self.instance_name()
                )),
                err => err.into(),
            })?;
        self.build(Box::new(module))
    }

    /// Validate the configuration against `module` and build the instance
    pub fn build(self, module: Box<dyn Module>) -> Result<ModelInstance, Error> {
        let name = self.instance_name();
        let model = &self.config.name;
        let controls = match &self.config.sequence_batching {
            Some(sequence_batching) => resolve_controls(model, sequence_batching)?,
            None => vec![],
        };
        let expected_input_count = self.config.input.len() + controls.len();

        let mut input_index = HashMap::new();
        let mut input_dtype = HashMap::new();
        let declared = self
            .config
            .input
            .iter()
            .map(|input| (&input.name, input.data_type));
        let synthesized = controls.iter().map(|control| (&control.name, control.dtype));
        let mut taken = vec![None; expected_input_count];
        for (input_name, dtype) in declared.chain(synthesized) {
            let index = tensor_index(input_name).ok_or_else(|| {
                Error::Internal(format!(
                    "input '{}' does not follow naming convention i.e. <name>__<index>.",
                    input_name
                ))
            })?;
            check_dtype(model, "input", input_name, dtype)?;
            match taken.get_mut(index) {
                Some(Some(other)) => {
                    return Err(Error::InvalidArg(format!(
                        "inputs '{}' and '{}' of model '{}' share index {}",
                        other, input_name, model, index
                    )))
                }
                Some(slot) => *slot = Some(input_name),
                None => {
                    return Err(Error::InvalidArg(format!(
                        "input '{}' of model '{}' refers to index {}, the model takes {} inputs",
                        input_name, model, index, expected_input_count
                    )))
                }
            }
            input_index.insert(input_name.clone(), index);
            input_dtype.insert(input_name.clone(), dtype);
        }

        let mut output_index = HashMap::new();
        let mut output_dtype = HashMap::new();
        for output in &self.config.output {
            let index = tensor_index(&output.name).ok_or_else(|| {
                Error::Internal(format!(
                    "output '{}' does not follow naming convention i.e. <name>__<index>.",
                    output.name
                ))
            })?;
            check_dtype(model, "output", &output.name, output.data_type)?;
            output_index.insert(output.name.clone(), index);
            output_dtype.insert(output.name.clone(), output.data_type);
        }

        let stream = match self.device {
            Device::Cpu => CopyStream::host(),
            Device::Cuda(device_id) => device_stream(device_id)?,
        };
        log::info!(
            "model instance '{}' on {} with {} inputs and {} outputs",
            name,
            self.device,
            expected_input_count,
            output_index.len()
        );
        Ok(ModelInstance {
            name,
            device: self.device,
            stream,
            memory_manager: self.memory_manager,
            model: ModelAdapter::new(module),
            input_index,
            input_dtype,
            output_index,
            output_dtype,
            controls,
            expected_input_count,
            config: self.config,
        })
    }
}

fn check_dtype(model: &str, io: &str, name: &str, dtype: DataType) -> Result<(), Error> {
    match to_scalar_type(dtype) {
        Some(_) => Ok(()),
        None => Err(Error::Internal(format!(
            "unsupported datatype TYPE_{} for {} '{}' for model '{}'",
            dtype, io, name, model
        ))),
    }
}

#[cfg(feature = "cuda")]
fn device_stream(device_id: i32) -> Result<CopyStream, Error> {
    Ok(CopyStream::for_device(device_id)?)
}

#[cfg(not(feature = "cuda"))]
fn device_stream(device_id: i32) -> Result<CopyStream, Error> {
    Err(Error::Unsupported(format!(
        "instances on cuda:{} require the `cuda` feature",
        device_id
    )))
}
