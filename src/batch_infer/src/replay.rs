//! Worker threads that each own one model instance.

use crossbeam::channel;
use orchestrator::{
    ChannelHost, Error, HostReceivers, InferenceRequest, ModelInstance, Statistics,
};
use std::{fmt, thread, time::Duration};

type Group = Vec<Option<InferenceRequest>>;

struct Worker {
    tx: channel::Sender<Group>,
    handle: thread::JoinHandle<()>,
}

/// Feeds request groups to a set of model instances, round robin.
pub struct Replayer {
    workers: Vec<Worker>,
    next: usize,
    receivers: HostReceivers,
}

/// What came back from a replay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    /// Responses without error.
    pub succeeded: usize,
    /// Responses carrying an error.
    pub failed: usize,
    /// Requests handed back by the instances.
    pub released: usize,
    /// Executions that reached the model.
    pub batches: usize,
    /// Sum of the batch sizes of those executions.
    pub batched_requests: usize,
    /// Time spent inside the model.
    pub compute: Duration,
    /// Error messages, in arrival order.
    pub errors: Vec<String>,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "succeeded/failed {}/{}, released {}, {} batches of {} samples, compute {:?}",
            self.succeeded,
            self.failed,
            self.released,
            self.batches,
            self.batched_requests,
            self.compute
        )
    }
}

impl Replayer {
    /// Start one worker thread per instance.
    pub fn new(instances: Vec<ModelInstance>) -> Self {
        let (host, receivers) = ChannelHost::new();
        let workers = instances
            .into_iter()
            .map(|mut instance| {
                let (tx, rx) = channel::unbounded::<Group>();
                let host = host.clone();
                let handle = thread::spawn(move || {
                    log::info!("worker for {} started", instance.name());
                    for group in rx {
                        instance.process_requests(group, &host);
                    }
                    log::info!("worker for {} stopped", instance.name());
                });
                Worker { tx, handle }
            })
            .collect();
        Replayer {
            workers,
            next: 0,
            receivers,
        }
    }

    /// Hand `group` to the next instance.
    pub fn submit(&mut self, group: Group) -> Result<(), Error> {
        if self.workers.is_empty() {
            return Err(Error::Unavailable("no model instance to run on".to_string()));
        }
        let worker = &self.workers[self.next % self.workers.len()];
        self.next += 1;
        worker
            .tx
            .send(group)
            .map_err(|_| Error::Unavailable("model instance worker is gone".to_string()))
    }

    /// Wait for every submitted group and summarize the outcome.
    pub fn finish(self) -> Summary {
        for worker in self.workers {
            drop(worker.tx);
            if worker.handle.join().is_err() {
                log::error!("model instance worker panicked");
            }
        }
        let mut summary = Summary::default();
        for response in self.receivers.responses.try_iter() {
            match response.error() {
                None => summary.succeeded += 1,
                Some(err) => {
                    summary.failed += 1;
                    summary.errors.push(format!("{}: {}", err.code(), err));
                }
            }
        }
        summary.released = self.receivers.released.try_iter().count();
        for record in self.receivers.statistics.try_iter() {
            if let Statistics::Batch {
                batch_size,
                timestamps,
            } = record
            {
                summary.batches += 1;
                summary.batched_requests += batch_size;
                summary.compute += timestamps.compute_end - timestamps.compute_start;
            }
        }
        summary
    }
}
