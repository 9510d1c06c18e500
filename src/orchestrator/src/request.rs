//! Inference requests as submitted by the host.

use crate::{tensor, DataType, Error};
use memory_manager::{AllocationType, Memory};

/// One named input of a request. Its data may be split over several
/// buffers which are concatenated in order.
#[derive(Debug)]
pub struct RequestInput {
    name: String,
    dtype: DataType,
    shape: Vec<i64>,
    buffers: Vec<Memory>,
}

impl RequestInput {
    /// An input without data.
    pub fn new<S: Into<String>>(name: S, dtype: DataType, shape: &[i64]) -> Self {
        RequestInput {
            name: name.into(),
            dtype,
            shape: shape.to_vec(),
            buffers: vec![],
        }
    }

    /// Append a data buffer.
    pub fn with_buffer(mut self, buffer: Memory) -> Self {
        self.buffers.push(buffer);
        self
    }

    /// Input name, `<name>__<index>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Shape, the batch dimension first for batching models.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Data buffers in order.
    pub fn buffers(&self) -> &[Memory] {
        &self.buffers
    }

    /// Bytes implied by type and shape.
    pub fn byte_size(&self) -> Option<usize> {
        tensor::byte_size(self.dtype, &self.shape)
    }

    /// Bytes actually held by the buffers.
    pub fn buffer_byte_size(&self) -> usize {
        self.buffers.iter().map(Memory::size).sum()
    }
}

/// Sequence state of a request to a stateful model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceControl {
    /// First request of the sequence.
    pub start: bool,
    /// Last request of the sequence.
    pub end: bool,
    /// The request carries data.
    pub ready: bool,
    /// Id shared by every request of the sequence.
    pub correlation_id: u64,
}

/// A request as handed over by the scheduler.
#[derive(Debug)]
pub struct InferenceRequest {
    id: String,
    inputs: Vec<RequestInput>,
    sequence_control: Option<SequenceControl>,
    requested_outputs: Option<Vec<String>>,
    output_preference: Vec<AllocationType>,
}

impl InferenceRequest {
    /// A request with no inputs whose outputs go to host memory.
    pub fn new<S: Into<String>>(id: S) -> Self {
        InferenceRequest {
            id: id.into(),
            inputs: vec![],
            sequence_control: None,
            requested_outputs: None,
            output_preference: vec![AllocationType::Cpu],
        }
    }

    /// Append an input.
    pub fn input(mut self, input: RequestInput) -> Self {
        self.inputs.push(input);
        self
    }

    /// Attach sequence control values.
    pub fn sequence_control(mut self, control: SequenceControl) -> Self {
        self.sequence_control = Some(control);
        self
    }

    /// Restrict the response to the named outputs.
    pub fn requested_outputs(mut self, names: Vec<String>) -> Self {
        self.requested_outputs = Some(names);
        self
    }

    /// Where response outputs should be allocated, in order of preference.
    pub fn output_preference(mut self, preference: Vec<AllocationType>) -> Self {
        self.output_preference = preference;
        self
    }

    /// Request id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Inputs in submission order.
    pub fn inputs(&self) -> &[RequestInput] {
        &self.inputs
    }

    /// Input by name.
    pub fn get_input(&self, name: &str) -> Option<&RequestInput> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// Sequence control values, for requests to stateful models.
    pub fn get_sequence_control(&self) -> Option<&SequenceControl> {
        self.sequence_control.as_ref()
    }

    /// Whether the response should carry output `name`.
    pub fn wants_output(&self, name: &str) -> bool {
        match &self.requested_outputs {
            Some(names) => names.iter().any(|n| n == name),
            None => true,
        }
    }

    /// Preferred allocation types for response outputs.
    pub fn get_output_preference(&self) -> &[AllocationType] {
        &self.output_preference
    }

    /// Leading dimension of the first input.
    pub(crate) fn leading_dimension(&self) -> Result<usize, Error> {
        let input = self.inputs.first().ok_or_else(|| {
            Error::InvalidArg(format!("request '{}' has no inputs", self.id))
        })?;
        match input.shape.first() {
            Some(&dim) if dim >= 0 => Ok(dim as usize),
            Some(&dim) => Err(Error::InvalidArg(format!(
                "input '{}' of request '{}' has negative batch dimension {}",
                input.name, self.id, dim
            ))),
            None => Err(Error::InvalidArg(format!(
                "input '{}' of request '{}' has no batch dimension",
                input.name, self.id
            ))),
        }
    }

    pub(crate) fn attach_input(&mut self, input: RequestInput) {
        self.inputs.push(input);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = InferenceRequest::new("r0")
            .input(
                RequestInput::new("x__0", DataType::Fp32, &[2, 3])
                    .with_buffer(Memory::from_vec(vec![0; 16]))
                    .with_buffer(Memory::from_vec(vec![0; 8])),
            )
            .requested_outputs(vec!["y__1".to_string()]);
        assert_eq!(request.id(), "r0");
        let input = request.get_input("x__0").unwrap();
        assert_eq!(input.byte_size(), Some(24));
        assert_eq!(input.buffer_byte_size(), 24);
        assert_eq!(input.buffers().len(), 2);
        assert!(request.get_input("y__0").is_none());
        assert!(request.wants_output("y__1"));
        assert!(!request.wants_output("y__0"));
        assert_eq!(request.get_output_preference(), &[AllocationType::Cpu]);
        assert_eq!(request.leading_dimension(), Ok(2));
        assert!(request.get_sequence_control().is_none());
    }

    #[test]
    fn test_leading_dimension_errors() {
        assert!(InferenceRequest::new("empty").leading_dimension().is_err());
        let scalar = InferenceRequest::new("scalar").input(RequestInput::new("x__0", DataType::Int32, &[]));
        assert!(scalar.leading_dimension().is_err());
        let negative =
            InferenceRequest::new("negative").input(RequestInput::new("x__0", DataType::Int32, &[-1]));
        assert!(negative.leading_dimension().is_err());
    }
}
