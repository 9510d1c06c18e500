//! Model configuration, in the JSON layout of a model repository's
//! `config.json`.

use crate::{DataType, Error};
use module_runtime::Device;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fs, path::Path};

/// Position encoded in a `<name>__<index>` tensor name.
pub fn tensor_index(name: &str) -> Option<usize> {
    let (_, index) = name.rsplit_once("__")?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}

/// Declared input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorConfig {
    /// `<name>__<index>` tensor name.
    pub name: String,
    /// Element type.
    pub data_type: DataType,
    /// Per-sample shape, without the batch dimension.
    #[serde(default)]
    pub dims: Vec<i64>,
}

/// Kind of a sequence control tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    /// True on the first request of a sequence.
    #[serde(rename = "CONTROL_SEQUENCE_START")]
    Start,
    /// True on the last request of a sequence.
    #[serde(rename = "CONTROL_SEQUENCE_END")]
    End,
    /// True when the batch slot holds a request.
    #[serde(rename = "CONTROL_SEQUENCE_READY")]
    Ready,
    /// Correlation id of the sequence.
    #[serde(rename = "CONTROL_SEQUENCE_CORRID")]
    CorrelationId,
}

impl ControlKind {
    /// Configuration name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ControlKind::Start => "CONTROL_SEQUENCE_START",
            ControlKind::End => "CONTROL_SEQUENCE_END",
            ControlKind::Ready => "CONTROL_SEQUENCE_READY",
            ControlKind::CorrelationId => "CONTROL_SEQUENCE_CORRID",
        }
    }
}

/// One control of a control input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    /// Which sequence signal the tensor carries.
    pub kind: ControlKind,
    /// `[false, true]` encoded as FP32.
    #[serde(default)]
    pub fp32_false_true: Vec<f32>,
    /// `[false, true]` encoded as INT32.
    #[serde(default)]
    pub int32_false_true: Vec<i32>,
    /// `[false, true]` encoded as BOOL.
    #[serde(default)]
    pub bool_false_true: Vec<bool>,
    /// Element type of a correlation id control.
    #[serde(default)]
    pub data_type: Option<DataType>,
}

/// A tensor fed from sequence control values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    /// `<name>__<index>` tensor name.
    pub name: String,
    /// Controls carried by this tensor.
    pub control: Vec<Control>,
}

/// Settings of a stateful model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceBatching {
    /// Control tensors the sequence batcher fills in.
    #[serde(default)]
    pub control_input: Vec<ControlInput>,
}

/// Where instances of a group run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceKind {
    /// Instances run on the host.
    #[serde(rename = "KIND_CPU")]
    Cpu,
    /// Instances run on GPUs.
    #[serde(rename = "KIND_GPU")]
    Gpu,
}

fn one() -> u32 {
    1
}

/// A set of identical instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    /// Instances per listed device.
    #[serde(default = "one")]
    pub count: u32,
    /// Where the instances of the group run.
    pub kind: InstanceKind,
    /// Device ids of a GPU group, device 0 when empty.
    #[serde(default)]
    pub gpus: Vec<i32>,
}

fn enabled() -> bool {
    true
}

/// Toggle for pinned staging memory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinnedMemory {
    /// Defaults to true.
    #[serde(default = "enabled")]
    pub enable: bool,
}

impl Default for PinnedMemory {
    fn default() -> Self {
        PinnedMemory { enable: true }
    }
}

/// Execution tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Optimization {
    /// Stage pageable request inputs through pinned memory.
    #[serde(default)]
    pub input_pinned_memory: PinnedMemory,
    /// Prefer pinned memory for response outputs copied off a device.
    #[serde(default)]
    pub output_pinned_memory: PinnedMemory,
}

/// Configuration of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name.
    pub name: String,
    /// Largest total batch per execution, 0 for models without batching.
    #[serde(default)]
    pub max_batch_size: u32,
    /// Declared inputs.
    #[serde(default)]
    pub input: Vec<TensorConfig>,
    /// Declared outputs.
    #[serde(default)]
    pub output: Vec<TensorConfig>,
    /// Present for stateful models.
    #[serde(default)]
    pub sequence_batching: Option<SequenceBatching>,
    /// Instances to create, one CPU instance when empty.
    #[serde(default)]
    pub instance_group: Vec<InstanceGroup>,
    /// Artifact name inside a version directory.
    #[serde(default)]
    pub default_model_filename: Option<String>,
    /// Pinned memory staging of inputs and outputs.
    #[serde(default)]
    pub optimization: Optimization,
}

impl ModelConfig {
    /// Parse a configuration document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let json = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Unavailable(format!(
                "unable to read model configuration '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        ModelConfig::from_json(&json)
    }

    /// Whether the first dimension of every tensor is the batch dimension.
    pub fn supports_batching(&self) -> bool {
        self.max_batch_size > 0
    }

    /// Declared output names in declaration order.
    pub fn output_names(&self) -> Result<Vec<String>, Error> {
        let mut seen = HashSet::new();
        self.output
            .iter()
            .map(|output| {
                if output.name.is_empty() {
                    Err(Error::InvalidArg(format!(
                        "model '{}' declares an output without a name",
                        self.name
                    )))
                } else if !seen.insert(output.name.as_str()) {
                    Err(Error::InvalidArg(format!(
                        "model '{}' declares output '{}' twice",
                        self.name, output.name
                    )))
                } else {
                    Ok(output.name.clone())
                }
            })
            .collect()
    }

    /// One device per instance, in instance order. A model without
    /// instance groups gets one host instance.
    pub fn instance_devices(&self) -> Vec<Device> {
        if self.instance_group.is_empty() {
            return vec![Device::Cpu];
        }
        let mut devices = vec![];
        for group in &self.instance_group {
            match group.kind {
                InstanceKind::Cpu => {
                    devices.extend((0..group.count).map(|_| Device::Cpu));
                }
                InstanceKind::Gpu => {
                    let gpus = if group.gpus.is_empty() {
                        vec![0]
                    } else {
                        group.gpus.clone()
                    };
                    for gpu in gpus {
                        devices.extend((0..group.count).map(|_| Device::Cuda(gpu)));
                    }
                }
            }
        }
        devices
    }
}
