//! Bridge between descriptor types and the module's native tensors.

use crate::{DataType, Error};
use module_runtime::{Module, NoGradGuard, ScalarType, Tensor};
use std::panic::{self, AssertUnwindSafe};

/// Native type of a descriptor type, `None` when modules cannot hold it.
pub fn to_scalar_type(dtype: DataType) -> Option<ScalarType> {
    Some(match dtype {
        DataType::Bool => ScalarType::Bool,
        DataType::Uint8 => ScalarType::Uint8,
        DataType::Int8 => ScalarType::Int8,
        DataType::Int16 => ScalarType::Int16,
        DataType::Int32 => ScalarType::Int32,
        DataType::Int64 => ScalarType::Int64,
        DataType::Fp16 => ScalarType::Float16,
        DataType::Fp32 => ScalarType::Float32,
        DataType::Fp64 => ScalarType::Float64,
        DataType::Uint16 | DataType::Uint32 | DataType::Uint64 | DataType::Bf16 | DataType::Bytes => {
            return None
        }
    })
}

/// Descriptor type of a native type.
pub fn to_data_type(scalar_type: ScalarType) -> DataType {
    match scalar_type {
        ScalarType::Bool => DataType::Bool,
        ScalarType::Uint8 => DataType::Uint8,
        ScalarType::Int8 => DataType::Int8,
        ScalarType::Int16 => DataType::Int16,
        ScalarType::Int32 => DataType::Int32,
        ScalarType::Int64 => DataType::Int64,
        ScalarType::Float16 => DataType::Fp16,
        ScalarType::Float32 => DataType::Fp32,
        ScalarType::Float64 => DataType::Fp64,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "module panicked".to_string()
    }
}

/// Owns the loaded module and runs it once per execution.
pub(crate) struct ModelAdapter {
    module: Box<dyn Module>,
}

impl ModelAdapter {
    pub fn new(module: Box<dyn Module>) -> Self {
        ModelAdapter { module }
    }

    /// Run the module in inference-only mode. Errors and panics both come
    /// back as one compute failure.
    pub fn execute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, Error> {
        let _guard = NoGradGuard::new();
        let module = &self.module;
        let result = panic::catch_unwind(AssertUnwindSafe(|| module.forward(inputs)));
        match result {
            Ok(Ok(output)) => Ok(output.into_tensors()),
            Ok(Err(err)) => Err(Error::Internal(format!("module execute failure: {}", err))),
            Err(payload) => Err(Error::Internal(format!(
                "module execute failure: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use module_runtime::{is_grad_enabled, ModuleOutput};

    #[test]
    fn test_type_mapping() {
        for &dtype in &[
            DataType::Bool,
            DataType::Uint8,
            DataType::Int8,
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::Fp16,
            DataType::Fp32,
            DataType::Fp64,
        ] {
            let scalar = to_scalar_type(dtype).unwrap();
            assert_eq!(to_data_type(scalar), dtype);
        }
        for &dtype in &[
            DataType::Uint16,
            DataType::Uint32,
            DataType::Uint64,
            DataType::Bf16,
            DataType::Bytes,
        ] {
            assert_eq!(to_scalar_type(dtype), None);
        }
    }

    #[test]
    fn test_execute_without_grad() {
        let adapter = ModelAdapter::new(Box::new(
            |inputs: &[Tensor]| -> Result<ModuleOutput, module_runtime::Error> {
                assert!(!is_grad_enabled());
                Ok(ModuleOutput::Tuple(vec![inputs[0].clone(), inputs[0].clone()]))
            },
        ));
        let input = Tensor::from_vec(vec![1f32, 2.0], &[2]).unwrap();
        let outputs = adapter.execute(&[input]).unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(is_grad_enabled());
    }

    #[test]
    fn test_failures_become_errors() {
        let failing = ModelAdapter::new(Box::new(
            |_: &[Tensor]| -> Result<ModuleOutput, module_runtime::Error> {
                Err(module_runtime::Error::Execution("shape mismatch".to_string()))
            },
        ));
        assert_eq!(
            failing.execute(&[]).unwrap_err(),
            Error::Internal("module execute failure: shape mismatch".to_string())
        );

        let panicking = ModelAdapter::new(Box::new(
            |_: &[Tensor]| -> Result<ModuleOutput, module_runtime::Error> {
                panic!("index out of range")
            },
        ));
        assert_eq!(
            panicking.execute(&[]).unwrap_err(),
            Error::Internal("module execute failure: index out of range".to_string())
        );
        assert!(is_grad_enabled());
    }
}
