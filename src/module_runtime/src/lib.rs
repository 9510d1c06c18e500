#![deny(missing_docs)]
#![warn(clippy::all)]

//! Native tensor vocabulary and the callable capability that batched
//! execution drives: a [`Module`] takes positional input tensors and returns
//! one tensor or a tuple of tensors.

mod c_api;
mod module;
mod shared_library;
mod tensor;

pub use crate::module::{is_grad_enabled, Module, ModuleOutput, NoGradGuard};
pub use crate::shared_library::SharedLibraryModule;
pub use crate::tensor::{Device, Element, ScalarType, Tensor};

/// Errors raised by tensors and modules.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The module file does not exist.
    #[error("unable to find '{0}'")]
    NotFound(String),
    /// The module file exists but could not be loaded.
    #[error("failed to load '{path}': {reason}")]
    Load {
        /// Path of the module file.
        path: String,
        /// Loader message.
        reason: String,
    },
    /// The module failed while computing.
    #[error("{0}")]
    Execution(String),
    /// A tensor was built or used inconsistently.
    #[error("tensor error: {0}")]
    Tensor(String),
    /// Memory allocation or copy failure.
    #[error(transparent)]
    Memory(#[from] memory_manager::Error),
}
