//! What the batching core needs from the serving process around it, and a
//! channel based implementation of it.

use crate::{Error, InferenceRequest, InferenceResponse};
use crossbeam::channel;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

/// Timing marks of one execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionTimestamps {
    /// Execution entered.
    pub exec_start: Instant,
    /// Inputs ready, compute about to start.
    pub compute_start: Instant,
    /// Compute returned.
    pub compute_end: Instant,
    /// Outputs gathered.
    pub exec_end: Instant,
}

/// Collaborator that owns requests and consumes responses and statistics.
///
/// Failures of the reporting calls are logged by the caller and otherwise
/// ignored.
pub trait RequestHost {
    /// Create the response object of `request`.
    fn new_response(&self, request: &InferenceRequest) -> Result<InferenceResponse, Error>;
    /// Deliver a final response.
    fn send_response(&self, response: InferenceResponse) -> Result<(), Error>;
    /// Give a request back once nothing refers to it anymore.
    fn release_request(&self, request: InferenceRequest) -> Result<(), Error>;
    /// Record the outcome and timing of one request.
    fn report_request_statistics(
        &self,
        request: &InferenceRequest,
        success: bool,
        timestamps: &ExecutionTimestamps,
    ) -> Result<(), Error>;
    /// Record the timing of one execution.
    fn report_batch_statistics(
        &self,
        batch_size: usize,
        timestamps: &ExecutionTimestamps,
    ) -> Result<(), Error>;
}

/// A statistics record.
#[derive(Debug, Clone, PartialEq)]
pub enum Statistics {
    /// Outcome of one request.
    Request {
        /// Id of the request.
        request_id: String,
        /// Whether the request's response was sent without error.
        success: bool,
        /// Timing of the execution the request was part of.
        timestamps: ExecutionTimestamps,
    },
    /// One execution.
    Batch {
        /// Total batch size of the execution.
        batch_size: usize,
        /// Timing of the execution.
        timestamps: ExecutionTimestamps,
    },
}

/// Receiving ends of a [`ChannelHost`].
pub struct HostReceivers {
    /// Sent responses.
    pub responses: channel::Receiver<InferenceResponse>,
    /// Released requests.
    pub released: channel::Receiver<InferenceRequest>,
    /// Statistics records.
    pub statistics: channel::Receiver<Statistics>,
}

/// [`RequestHost`] that forwards everything to channels. Clones share the
/// same channels.
#[derive(Clone)]
pub struct ChannelHost {
    responses: channel::Sender<InferenceResponse>,
    released: channel::Sender<InferenceRequest>,
    statistics: channel::Sender<Statistics>,
    cancelled: Arc<Mutex<HashSet<String>>>,
}

fn disconnected(what: &str) -> Error {
    Error::Unavailable(format!("{} receiver is gone", what))
}

impl ChannelHost {
    /// Create a host and its receivers.
    pub fn new() -> (Self, HostReceivers) {
        let (responses, responses_rx) = channel::unbounded();
        let (released, released_rx) = channel::unbounded();
        let (statistics, statistics_rx) = channel::unbounded();
        (
            ChannelHost {
                responses,
                released,
                statistics,
                cancelled: Arc::new(Mutex::new(HashSet::new())),
            },
            HostReceivers {
                responses: responses_rx,
                released: released_rx,
                statistics: statistics_rx,
            },
        )
    }

    /// Refuse to create a response for `request_id` from now on.
    pub fn cancel<S: Into<String>>(&self, request_id: S) {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.into());
    }
}

impl RequestHost for ChannelHost {
    fn new_response(&self, request: &InferenceRequest) -> Result<InferenceResponse, Error> {
        let cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        if cancelled.contains(request.id()) {
            return Err(Error::Unavailable(format!(
                "request '{}' was cancelled",
                request.id()
            )));
        }
        Ok(InferenceResponse::new(request.id()))
    }

    fn send_response(&self, response: InferenceResponse) -> Result<(), Error> {
        self.responses
            .send(response)
            .map_err(|_| disconnected("response"))
    }

    fn release_request(&self, request: InferenceRequest) -> Result<(), Error> {
        self.released
            .send(request)
            .map_err(|_| disconnected("release"))
    }

    fn report_request_statistics(
        &self,
        request: &InferenceRequest,
        success: bool,
        timestamps: &ExecutionTimestamps,
    ) -> Result<(), Error> {
        self.statistics
            .send(Statistics::Request {
                request_id: request.id().to_string(),
                success,
                timestamps: *timestamps,
            })
            .map_err(|_| disconnected("statistics"))
    }

    fn report_batch_statistics(
        &self,
        batch_size: usize,
        timestamps: &ExecutionTimestamps,
    ) -> Result<(), Error> {
        self.statistics
            .send(Statistics::Batch {
                batch_size,
                timestamps: *timestamps,
            })
            .map_err(|_| disconnected("statistics"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_channel_host() {
        let (host, receivers) = ChannelHost::new();
        let request = InferenceRequest::new("a");
        let response = host.new_response(&request).unwrap();
        assert_eq!(response.request_id(), "a");
        host.send_response(response).unwrap();
        assert_eq!(receivers.responses.recv().unwrap().request_id(), "a");

        host.cancel("a");
        assert!(host.clone().new_response(&request).is_err());
        assert!(host.new_response(&InferenceRequest::new("b")).is_ok());

        let now = Instant::now();
        let timestamps = ExecutionTimestamps {
            exec_start: now,
            compute_start: now,
            compute_end: now,
            exec_end: now,
        };
        host.report_request_statistics(&request, false, &timestamps)
            .unwrap();
        host.report_batch_statistics(3, &timestamps).unwrap();
        host.release_request(request).unwrap();
        assert_eq!(
            receivers.statistics.recv().unwrap(),
            Statistics::Request {
                request_id: "a".to_string(),
                success: false,
                timestamps
            }
        );
        assert!(matches!(
            receivers.statistics.recv().unwrap(),
            Statistics::Batch { batch_size: 3, .. }
        ));
        assert_eq!(receivers.released.recv().unwrap().id(), "a");
    }

    #[test]
    fn test_dropped_receivers() {
        let (host, receivers) = ChannelHost::new();
        drop(receivers);
        let request = InferenceRequest::new("a");
        assert!(host.send_response(InferenceResponse::new("a")).is_err());
        assert!(host.release_request(request).is_err());
    }
}
