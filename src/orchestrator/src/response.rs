//! Responses and the per-request slots that track them during one
//! execution.

use crate::{host::RequestHost, Error, TensorDescriptor};
use memory_manager::Memory;

/// One output tensor of a response.
#[derive(Debug)]
pub struct ResponseOutput {
    /// Name, type, shape and placement of the data.
    pub descriptor: TensorDescriptor,
    /// The data, dense in row-major order.
    pub buffer: Memory,
}

/// Final answer to one request: outputs on success, an error otherwise.
#[derive(Debug)]
pub struct InferenceResponse {
    request_id: String,
    outputs: Vec<ResponseOutput>,
    error: Option<Error>,
}

impl InferenceResponse {
    /// An empty response for `request_id`.
    pub fn new<S: Into<String>>(request_id: S) -> Self {
        InferenceResponse {
            request_id: request_id.into(),
            outputs: vec![],
            error: None,
        }
    }

    /// Id of the request this response answers.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Outputs in the order they were produced.
    pub fn outputs(&self) -> &[ResponseOutput] {
        &self.outputs
    }

    /// Output by name.
    pub fn output(&self, name: &str) -> Option<&ResponseOutput> {
        self.outputs.iter().find(|o| o.descriptor.name == name)
    }

    /// The error the request failed with.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Whether the request succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn add_output(&mut self, output: ResponseOutput) {
        self.outputs.push(output);
    }

    fn fail(&mut self, error: Error) {
        self.outputs.clear();
        self.error = Some(error);
    }
}

/// State of one request's response during an execution.
#[derive(Debug)]
pub(crate) enum ResponseSlot {
    /// Not sent yet.
    Pending(InferenceResponse),
    /// An error response was already sent.
    Errored(Error),
    /// The host could not create a response, nothing will be sent.
    Unusable,
}

impl ResponseSlot {
    pub fn is_pending(&self) -> bool {
        matches!(self, ResponseSlot::Pending(_))
    }

    pub fn response_mut(&mut self) -> Option<&mut InferenceResponse> {
        match self {
            ResponseSlot::Pending(response) => Some(response),
            _ => None,
        }
    }

    /// Send `error` now if the slot is pending.
    pub fn send_error(&mut self, host: &dyn RequestHost, error: &Error) {
        if !self.is_pending() {
            return;
        }
        if let ResponseSlot::Pending(mut response) =
            std::mem::replace(self, ResponseSlot::Errored(error.clone()))
        {
            response.fail(error.clone());
            if let Err(err) = host.send_response(response) {
                log::error!("failed to send error response: {}", err);
            }
        }
    }
}

/// Send one shared error to every pending slot.
pub(crate) fn send_error_for_responses(
    slots: &mut [ResponseSlot],
    host: &dyn RequestHost,
    error: &Error,
) {
    for slot in slots.iter_mut() {
        slot.send_error(host, error);
    }
}

pub(crate) fn any_pending(slots: &[ResponseSlot]) -> bool {
    slots.iter().any(ResponseSlot::is_pending)
}
