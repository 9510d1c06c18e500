#![deny(missing_docs)]
#![warn(clippy::all)]

//! Orchestrator executes groups of inference requests as one batch on a
//! loaded model: inputs are scattered into aggregated buffers, the model runs
//! once, and its outputs are gathered back into one response per request.

pub mod adapter;
pub mod builder;
mod collector;
pub mod config;
mod error;
mod host;
mod instance;
mod request;
mod responder;
mod response;
mod sequence;
mod tensor;

pub use crate::builder::Builder;
pub use crate::config::{tensor_index, ModelConfig};
pub use crate::error::Error;
pub use crate::host::{ChannelHost, ExecutionTimestamps, HostReceivers, RequestHost, Statistics};
pub use crate::instance::ModelInstance;
pub use crate::request::{InferenceRequest, RequestInput, SequenceControl};
pub use crate::response::{InferenceResponse, ResponseOutput};
pub use crate::tensor::{byte_size, DataType, TensorDescriptor};
