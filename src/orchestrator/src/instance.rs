//! Execution of request groups on one loaded model instance.

use crate::{
    adapter::{to_scalar_type, ModelAdapter},
    collector::InputCollector,
    config::ModelConfig,
    host::{ExecutionTimestamps, RequestHost},
    responder::OutputResponder,
    response::{any_pending, send_error_for_responses, ResponseSlot},
    sequence::ControlTensor,
    tensor, DataType, Error, InferenceRequest,
};
use memory_manager::{AllocationType, CopyStream, MemoryManager};
use module_runtime::{Device, Tensor};
use std::{collections::HashMap, time::Instant};

/// A model bound to one device, created with [`crate::Builder`].
///
/// Each call to [`ModelInstance::process_requests`] runs one group to
/// completion on the calling thread. Separate instances may run on separate
/// threads and share a [`MemoryManager`].
pub struct ModelInstance {
    pub(crate) name: String,
    pub(crate) config: ModelConfig,
    pub(crate) device: Device,
    pub(crate) stream: CopyStream,
    pub(crate) memory_manager: MemoryManager,
    pub(crate) model: ModelAdapter,
    pub(crate) input_index: HashMap<String, usize>,
    pub(crate) input_dtype: HashMap<String, DataType>,
    pub(crate) output_index: HashMap<String, usize>,
    pub(crate) output_dtype: HashMap<String, DataType>,
    pub(crate) controls: Vec<ControlTensor>,
    pub(crate) expected_input_count: usize,
}

fn new_slot(host: &dyn RequestHost, request: &InferenceRequest) -> ResponseSlot {
    match host.new_response(request) {
        Ok(response) => ResponseSlot::Pending(response),
        Err(err) => {
            log::error!(
                "failed to create response for request '{}': {}",
                request.id(),
                err
            );
            ResponseSlot::Unusable
        }
    }
}

fn release(host: &dyn RequestHost, request: InferenceRequest) {
    let id = request.id().to_string();
    if let Err(err) = host.release_request(request) {
        log::error!("failed to release request '{}': {}", id, err);
    }
}

impl ModelInstance {
    /// Instance name, `<model>_<index>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the instance was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Device the model runs on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Declared inputs plus sequence control inputs.
    pub fn expected_input_count(&self) -> usize {
        self.expected_input_count
    }

    /// Run `requests` as one batch.
    ///
    /// Every request present in the group gets exactly one response unless
    /// the host refused to create it, and is released once nothing refers
    /// to it anymore. Failures are delivered through the responses.
    pub fn process_requests(
        &mut self,
        requests: Vec<Option<InferenceRequest>>,
        host: &dyn RequestHost,
    ) {
        let exec_start = Instant::now();
        log::debug!("{}: running {} requests", self.name, requests.len());

        if requests.iter().any(Option::is_none) {
            let error = Error::Internal(format!(
                "null request given to backend for '{}'",
                self.name
            ));
            self.fail_requests(requests.into_iter().flatten().collect(), host, &error);
            return;
        }
        let mut requests: Vec<InferenceRequest> = requests.into_iter().flatten().collect();

        let batch_counts = match self.batch_counts(&requests) {
            Ok(batch_counts) => batch_counts,
            Err(err) => {
                self.fail_requests(requests, host, &err);
                return;
            }
        };
        let total = match batch_counts
            .iter()
            .try_fold(0usize, |sum, &count| sum.checked_add(count))
        {
            Some(total) => total,
            None => {
                let error = Error::Internal(format!(
                    "batch size overflows for '{}', max allowed is {}",
                    self.name, self.config.max_batch_size
                ));
                self.fail_requests(requests, host, &error);
                return;
            }
        };
        if total == 0 {
            log::debug!("{}: nothing to run", self.name);
            for request in requests {
                release(host, request);
            }
            return;
        }
        let max_batch_size = self.config.max_batch_size as usize;
        if total != 1 && total > max_batch_size {
            let error = Error::Internal(format!(
                "batch size {} for '{}', max allowed is {}",
                total, self.name, max_batch_size
            ));
            self.fail_requests(requests, host, &error);
            return;
        }

        let mut slots: Vec<ResponseSlot> = requests
            .iter()
            .map(|request| new_slot(host, request))
            .collect();
        let mut timestamps = ExecutionTimestamps {
            exec_start,
            compute_start: exec_start,
            compute_end: exec_start,
            exec_end: exec_start,
        };
        if let Err(err) = self.execute(
            &mut requests,
            &batch_counts,
            total,
            &mut slots,
            host,
            &mut timestamps,
        ) {
            log::debug!("{}: batch failed: {}", self.name, err);
            send_error_for_responses(&mut slots, host, &err);
        }
        timestamps.exec_end = Instant::now();
        self.finalize(requests, slots, total, host, &timestamps);
    }

    /// Scatter, compute and gather. An `Err` fails every pending slot and
    /// is only returned once no copy is in flight anymore.
    fn execute(
        &self,
        requests: &mut [InferenceRequest],
        batch_counts: &[usize],
        total: usize,
        slots: &mut [ResponseSlot],
        host: &dyn RequestHost,
        timestamps: &mut ExecutionTimestamps,
    ) -> Result<(), Error> {
        let batched = self.config.supports_batching();
        if !self.controls.is_empty() {
            self.attach_controls(requests, batch_counts, batched)?;
        }
        let requests = &*requests;

        let mut collector = InputCollector::new(
            &self.stream,
            &self.memory_manager,
            self.config.optimization.input_pinned_memory.enable,
        );
        let mut inputs: Vec<Option<Tensor>> = vec![None; self.expected_input_count];
        let collected =
            self.set_input_tensors(requests, total, batched, &mut collector, &mut inputs);
        let output_names = self.config.output_names();
        if collector.finalize() {
            self.stream.synchronize()?;
        }
        drop(collector);
        collected?;
        let output_names = output_names?;
        let inputs = self.ordered_inputs(inputs)?;

        if !any_pending(slots) {
            log::debug!("{}: no response left to compute", self.name);
            return Ok(());
        }
        timestamps.compute_start = Instant::now();
        let outputs = self.model.execute(&inputs);
        timestamps.compute_end = Instant::now();
        drop(inputs);
        let outputs = outputs?;
        log::debug!(
            "{}: computed {} outputs for batch of {}",
            self.name,
            outputs.len(),
            total
        );

        let layout = self.output_layout(&output_names, outputs.len())?;
        let mut responder = OutputResponder::new(
            requests,
            batch_counts,
            slots,
            host,
            batched,
            &self.stream,
            &self.memory_manager,
            self.config.optimization.output_pinned_memory.enable,
        );
        let mut gathered = Ok(());
        for (name, (index, dtype)) in output_names.iter().zip(layout) {
            gathered = responder.process_tensor(name, dtype, &outputs[index]);
            if gathered.is_err() {
                break;
            }
        }
        let drained = if responder.finalize() {
            self.stream.synchronize()
        } else {
            Ok(())
        };
        responder.send_failures();
        drained?;
        gathered
    }

    fn batch_counts(&self, requests: &[InferenceRequest]) -> Result<Vec<usize>, Error> {
        if self.config.supports_batching() {
            requests
                .iter()
                .map(InferenceRequest::leading_dimension)
                .collect()
        } else {
            Ok(vec![1; requests.len()])
        }
    }

    /// Add a tensor for every control a request does not carry itself.
    fn attach_controls(
        &self,
        requests: &mut [InferenceRequest],
        batch_counts: &[usize],
        batched: bool,
    ) -> Result<(), Error> {
        for (request, &count) in requests.iter_mut().zip(batch_counts) {
            for control in &self.controls {
                if request.get_input(&control.name).is_some() {
                    continue;
                }
                let values = request.get_sequence_control().copied().ok_or_else(|| {
                    Error::InvalidArg(format!(
                        "request '{}' for sequence model '{}' provides neither input '{}' nor sequence control values",
                        request.id(),
                        self.name,
                        control.name
                    ))
                })?;
                request.attach_input(control.synthesize(&values, count, batched));
            }
        }
        Ok(())
    }

    /// Aggregate every input of the first request into `tensors`, placed at
    /// the input's index.
    fn set_input_tensors(
        &self,
        requests: &[InferenceRequest],
        total: usize,
        batched: bool,
        collector: &mut InputCollector<'_>,
        tensors: &mut [Option<Tensor>],
    ) -> Result<(), Error> {
        let (preference, device_id): (&[AllocationType], i32) = match self.device {
            Device::Cpu => (&[AllocationType::Cpu], 0),
            Device::Cuda(id) => (&[AllocationType::GpuPool, AllocationType::Gpu], id),
        };
        let first = requests
            .first()
            .ok_or_else(|| Error::Internal(format!("empty batch for '{}'", self.name)))?;
        for template in first.inputs() {
            let name = template.name();
            let (index, expected) = match (self.input_index.get(name), self.input_dtype.get(name)) {
                (Some(&index), Some(&dtype)) => (index, dtype),
                _ => {
                    return Err(Error::InvalidArg(format!(
                        "unexpected inference input '{}' for model '{}'",
                        name, self.name
                    )))
                }
            };
            if template.dtype() != expected {
                return Err(Error::InvalidArg(format!(
                    "unexpected datatype TYPE_{} for input '{}', expecting TYPE_{}",
                    template.dtype(),
                    name,
                    expected
                )));
            }
            if tensors[index].is_some() {
                return Err(Error::InvalidArg(format!(
                    "input '{}' appears more than once in request '{}'",
                    name,
                    first.id()
                )));
            }
            let mut shape = template.shape().to_vec();
            if batched {
                match shape.first_mut() {
                    Some(dim) => *dim = total as i64,
                    None => {
                        return Err(Error::InvalidArg(format!(
                            "input '{}' of request '{}' has no batch dimension",
                            name,
                            first.id()
                        )))
                    }
                }
            }
            let size = tensor::byte_size(expected, &shape).ok_or_else(|| {
                Error::InvalidArg(format!(
                    "input '{}' of request '{}' has invalid shape {:?}",
                    name,
                    first.id(),
                    template.shape()
                ))
            })?;
            let scalar_type = to_scalar_type(expected).ok_or_else(|| {
                Error::Internal(format!(
                    "unsupported datatype TYPE_{} for input '{}' for model '{}'",
                    expected, name, self.name
                ))
            })?;
            let mut buffer = self.memory_manager.create(preference, device_id, size)?;
            if let Err(err) = collector.process_tensor(requests, template, batched, &mut buffer) {
                if collector.finalize() {
                    if let Err(sync) = self.stream.synchronize() {
                        log::error!("{}: failed to drain input copies: {}", self.name, sync);
                    }
                }
                return Err(err);
            }
            tensors[index] = Some(Tensor::from_memory(buffer, scalar_type, &shape)?);
        }
        Ok(())
    }

    fn ordered_inputs(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Tensor>, Error> {
        inputs
            .into_iter()
            .enumerate()
            .map(|(index, tensor)| {
                tensor.ok_or_else(|| {
                    Error::InvalidArg(format!(
                        "model '{}' expects {} inputs, input {} is not provided",
                        self.name, self.expected_input_count, index
                    ))
                })
            })
            .collect()
    }

    /// Index and type of every output, checked against what the module
    /// returned.
    fn output_layout(
        &self,
        names: &[String],
        available: usize,
    ) -> Result<Vec<(usize, DataType)>, Error> {
        names
            .iter()
            .map(|name| {
                let (index, dtype) = match (self.output_index.get(name), self.output_dtype.get(name)) {
                    (Some(&index), Some(&dtype)) => (index, dtype),
                    _ => {
                        return Err(Error::Internal(format!(
                            "output '{}' of model '{}' has no index",
                            name, self.name
                        )))
                    }
                };
                if index >= available {
                    return Err(Error::InvalidArg(format!(
                        "The output {} in the model configuration refers to an output index which doesn't exist. This model has {} outputs",
                        name, available
                    )));
                }
                Ok((index, dtype))
            })
            .collect()
    }

    /// Send what is still pending, then report and release every request.
    fn finalize(
        &self,
        requests: Vec<InferenceRequest>,
        slots: Vec<ResponseSlot>,
        total: usize,
        host: &dyn RequestHost,
        timestamps: &ExecutionTimestamps,
    ) {
        for (request, slot) in requests.into_iter().zip(slots) {
            let success = match slot {
                ResponseSlot::Pending(response) => {
                    if let Err(err) = host.send_response(response) {
                        log::error!(
                            "failed to send response for request '{}': {}",
                            request.id(),
                            err
                        );
                    }
                    true
                }
                ResponseSlot::Errored(error) => {
                    log::debug!("{}: request '{}' failed: {}", self.name, request.id(), error);
                    false
                }
                ResponseSlot::Unusable => false,
            };
            if let Err(err) = host.report_request_statistics(&request, success, timestamps) {
                log::error!(
                    "failed reporting statistics for request '{}': {}",
                    request.id(),
                    err
                );
            }
            release(host, request);
        }
        if let Err(err) = host.report_batch_statistics(total, timestamps) {
            log::error!("failed reporting batch statistics: {}", err);
        }
    }

    /// Send `error` to every request and release them, without statistics.
    fn fail_requests(
        &self,
        requests: Vec<InferenceRequest>,
        host: &dyn RequestHost,
        error: &Error,
    ) {
        log::error!("{}: {}", self.name, error);
        for request in requests {
            new_slot(host, &request).send_error(host, error);
            release(host, request);
        }
    }
}
