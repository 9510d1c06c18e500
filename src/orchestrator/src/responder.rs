//! Gather of aggregated outputs back into per-request responses.

use crate::{
    adapter::to_data_type,
    host::RequestHost,
    response::{ResponseOutput, ResponseSlot},
    DataType, Error, InferenceRequest, TensorDescriptor,
};
use memory_manager::{AllocationType, CopyStream, MemoryManager, MemoryType};
use module_runtime::{Device, Tensor};

/// Splits every output of one execution over the responses of its
/// requests.
pub(crate) struct OutputResponder<'a> {
    requests: &'a [InferenceRequest],
    batch_counts: &'a [usize],
    slots: &'a mut [ResponseSlot],
    host: &'a dyn RequestHost,
    batched: bool,
    stream: &'a CopyStream,
    memory_manager: &'a MemoryManager,
    pinned_enabled: bool,
    pending_async: bool,
    failures: Vec<Option<Error>>,
}

impl<'a> OutputResponder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requests: &'a [InferenceRequest],
        batch_counts: &'a [usize],
        slots: &'a mut [ResponseSlot],
        host: &'a dyn RequestHost,
        batched: bool,
        stream: &'a CopyStream,
        memory_manager: &'a MemoryManager,
        pinned_enabled: bool,
    ) -> Self {
        OutputResponder {
            requests,
            batch_counts,
            host,
            batched,
            stream,
            memory_manager,
            pinned_enabled,
            pending_async: false,
            failures: vec![None; slots.len()],
            slots,
        }
    }

    /// Copy each request's slice of output `name` into its response.
    ///
    /// An `Err` concerns the whole batch. Failing to create or fill one
    /// response's buffer only fails that response, once
    /// [`OutputResponder::send_failures`] runs.
    pub fn process_tensor(
        &mut self,
        name: &str,
        expected: DataType,
        tensor: &Tensor,
    ) -> Result<(), Error> {
        let tensor = tensor
            .contiguous()
            .map_err(|err| {
                Error::Internal(format!("output tensor '{}' is not found: {}", name, err))
            })?;
        let dtype = to_data_type(tensor.dtype());
        if dtype != expected {
            return Err(Error::InvalidArg(format!(
                "unexpected datatype TYPE_{} for inference output '{}', expecting TYPE_{}",
                dtype, name, expected
            )));
        }
        let element_size = tensor.dtype().element_size();
        let shapes = self.request_shapes(name, tensor.shape())?;
        let total: usize = shapes
            .iter()
            .map(|shape| shape.iter().product::<i64>() as usize * element_size)
            .sum();
        if total > tensor.byte_size() {
            return Err(Error::Internal(format!(
                "output '{}' holds {} bytes, the batch needs {}",
                name,
                tensor.byte_size(),
                total
            )));
        }
        let (memory_type, memory_type_id) = match tensor.device() {
            Device::Cpu => (MemoryType::Cpu, 0),
            Device::Cuda(id) => (MemoryType::Gpu, id),
        };
        let requests = self.requests;
        let mut offset = tensor.byte_offset();
        for (i, shape) in shapes.into_iter().enumerate() {
            let size = shape.iter().product::<i64>() as usize * element_size;
            let request = &requests[i];
            if self.slots[i].is_pending() && self.failures[i].is_none() && request.wants_output(name) {
                let preference = self.preference(request, memory_type);
                let descriptor = TensorDescriptor {
                    name: name.to_string(),
                    dtype,
                    shape,
                    memory_type,
                    memory_type_id,
                };
                self.respond(i, descriptor, &preference, &tensor, offset, size);
            }
            offset += size;
        }
        Ok(())
    }

    fn respond(
        &mut self,
        i: usize,
        mut descriptor: TensorDescriptor,
        preference: &[AllocationType],
        tensor: &Tensor,
        offset: usize,
        size: usize,
    ) {
        let mut buffer =
            match self
                .memory_manager
                .create(preference, descriptor.memory_type_id, size)
            {
                Ok(buffer) => buffer,
                Err(err) => {
                    let error = Error::from(err);
                    log::error!(
                        "failed to allocate output '{}' for request '{}': {}",
                        descriptor.name,
                        self.requests[i].id(),
                        error
                    );
                    self.failures[i] = Some(error);
                    return;
                }
            };
        match self.stream.copy(tensor.memory(), offset, &mut buffer, 0, size) {
            Ok(pending) => self.pending_async |= pending,
            Err(err) => {
                self.failures[i] = Some(err.into());
                return;
            }
        }
        descriptor.memory_type = buffer.memory_type();
        descriptor.memory_type_id = buffer.memory_type_id();
        if let Some(response) = self.slots[i].response_mut() {
            response.add_output(ResponseOutput { descriptor, buffer });
        }
    }

    /// Shape of every request's slice: the aggregated shape with the batch
    /// dimension replaced by the request's own batch count.
    fn request_shapes(&self, name: &str, shape: &[i64]) -> Result<Vec<Vec<i64>>, Error> {
        if self.batched && shape.is_empty() {
            return Err(Error::Internal(format!(
                "output '{}' has no batch dimension",
                name
            )));
        }
        Ok(self
            .batch_counts
            .iter()
            .map(|&count| {
                let mut shape = shape.to_vec();
                if self.batched {
                    shape[0] = count as i64;
                }
                shape
            })
            .collect())
    }

    fn preference(&self, request: &InferenceRequest, source: MemoryType) -> Vec<AllocationType> {
        let mut preference = request.get_output_preference().to_vec();
        if self.pinned_enabled
            && source == MemoryType::Gpu
            && preference.first() == Some(&AllocationType::Cpu)
        {
            preference.insert(0, AllocationType::CpuPinned);
        }
        if preference.is_empty() {
            preference.push(AllocationType::Cpu);
        }
        preference
    }

    /// Whether any copy may still be in flight on the stream.
    pub fn finalize(&self) -> bool {
        self.pending_async
    }

    /// Fail the responses whose buffers could not be created or filled.
    /// Their earlier outputs are dropped here, so the stream must be
    /// drained first.
    pub fn send_failures(self) {
        let OutputResponder {
            slots,
            failures,
            host,
            ..
        } = self;
        for (slot, failure) in slots.iter_mut().zip(failures) {
            if let Some(error) = failure {
                slot.send_error(host, &error);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ChannelHost, RequestInput};
    use memory_manager::Memory;
    use module_runtime::ScalarType;

    fn requests(counts: &[i64]) -> Vec<InferenceRequest> {
        counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                InferenceRequest::new(format!("r{}", i)).input(
                    RequestInput::new("x__0", DataType::Fp32, &[count, 2])
                        .with_buffer(Memory::from_vec(vec![0; count as usize * 8])),
                )
            })
            .collect()
    }

    fn pending(requests: &[InferenceRequest]) -> Vec<ResponseSlot> {
        requests
            .iter()
            .map(|r| ResponseSlot::Pending(crate::InferenceResponse::new(r.id())))
            .collect()
    }

    #[test]
    fn test_gather_slices() {
        let (host, receivers) = ChannelHost::new();
        let stream = CopyStream::host();
        let manager = MemoryManager::new();
        let requests = requests(&[2, 1]);
        let counts = [2, 1];
        let mut slots = pending(&requests);
        slots[1] = ResponseSlot::Unusable;
        let output = Tensor::from_vec((0..6).map(|v| v as f32).collect(), &[3, 2]).unwrap();
        {
            let mut responder = OutputResponder::new(
                &requests, &counts, &mut slots, &host, true, &stream, &manager, true,
            );
            responder
                .process_tensor("y__0", DataType::Fp32, &output)
                .unwrap();
            assert!(!responder.finalize());
        }
        let response = match &slots[0] {
            ResponseSlot::Pending(response) => response,
            other => panic!("unexpected slot {:?}", other),
        };
        let y = response.output("y__0").unwrap();
        assert_eq!(y.descriptor.shape, vec![2, 2]);
        assert_eq!(y.descriptor.memory_type, MemoryType::Cpu);
        let mut expected = vec![];
        for v in &[0f32, 1.0, 2.0, 3.0] {
            expected.extend_from_slice(&v.to_ne_bytes());
        }
        assert_eq!(y.buffer.as_slice().unwrap(), &expected[..]);
        assert!(receivers.responses.try_recv().is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let (host, _receivers) = ChannelHost::new();
        let stream = CopyStream::host();
        let manager = MemoryManager::new();
        let requests = requests(&[1]);
        let mut slots = pending(&requests);
        let output = Tensor::from_vec(vec![1i64, 2], &[1, 2]).unwrap();
        let mut responder =
            OutputResponder::new(&requests, &[1], &mut slots, &host, true, &stream, &manager, true);
        assert_eq!(
            responder.process_tensor("y__0", DataType::Fp32, &output),
            Err(Error::InvalidArg(
                "unexpected datatype TYPE_INT64 for inference output 'y__0', expecting TYPE_FP32"
                    .to_string()
            ))
        );
    }

    #[test]
    fn test_short_output_is_batch_fatal() {
        let (host, _receivers) = ChannelHost::new();
        let stream = CopyStream::host();
        let manager = MemoryManager::new();
        let requests = requests(&[2, 2]);
        let mut slots = pending(&requests);
        let output = Tensor::from_vec(vec![0f32; 6], &[3, 2]).unwrap();
        let mut responder = OutputResponder::new(
            &requests, &[2, 2], &mut slots, &host, true, &stream, &manager, true,
        );
        assert!(matches!(
            responder.process_tensor("y__0", DataType::Fp32, &output),
            Err(Error::Internal(_))
        ));
        drop(responder);
        for slot in slots.iter_mut() {
            assert!(slot.response_mut().map_or(false, |r| r.outputs().is_empty()));
        }
    }

    #[test]
    fn test_requested_outputs_and_repack() {
        let (host, _receivers) = ChannelHost::new();
        let stream = CopyStream::host();
        let manager = MemoryManager::new();
        let mut requests = requests(&[1, 1]);
        let first = std::mem::replace(&mut requests[0], InferenceRequest::new("tmp"));
        requests[0] = first.requested_outputs(vec!["z__1".to_string()]);
        let mut slots = pending(&requests);
        // [[0, 1], [2, 3]] transposed to [[0, 2], [1, 3]]
        let output = Tensor::from_vec(vec![0i32, 1, 2, 3], &[2, 2])
            .unwrap()
            .transpose(0, 1)
            .unwrap();
        let mut responder = OutputResponder::new(
            &requests, &[1, 1], &mut slots, &host, true, &stream, &manager, true,
        );
        responder
            .process_tensor("y__0", DataType::Int32, &output)
            .unwrap();
        drop(responder);
        match (&slots[0], &slots[1]) {
            (ResponseSlot::Pending(skipped), ResponseSlot::Pending(second)) => {
                assert!(skipped.outputs().is_empty());
                let y = second.output("y__0").unwrap();
                let mut expected = 1i32.to_ne_bytes().to_vec();
                expected.extend_from_slice(&3i32.to_ne_bytes());
                assert_eq!(y.buffer.as_slice().unwrap(), &expected[..]);
            }
            other => panic!("unexpected slots {:?}", other),
        }
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_output_allocation_failure_is_slot_local() {
        let (host, receivers) = ChannelHost::new();
        let stream = CopyStream::host();
        let manager = MemoryManager::new();
        let mut requests = requests(&[1, 1]);
        let first = std::mem::replace(&mut requests[0], InferenceRequest::new("tmp"));
        requests[0] = first.output_preference(vec![AllocationType::Gpu]);
        let mut slots = pending(&requests);
        let output = Tensor::from_vec(vec![0f32; 4], &[2, 2]).unwrap();
        let mut responder = OutputResponder::new(
            &requests, &[1, 1], &mut slots, &host, true, &stream, &manager, true,
        );
        responder
            .process_tensor("y__0", DataType::Fp32, &output)
            .unwrap();
        responder
            .process_tensor("z__1", DataType::Fp32, &output)
            .unwrap();
        // nothing is sent or freed before the stream is drained
        assert!(receivers.responses.try_recv().is_err());
        assert!(!responder.finalize());
        responder.send_failures();
        assert!(matches!(slots[0], ResponseSlot::Errored(_)));
        assert!(slots[1].is_pending());
        let sent = receivers.responses.try_recv().unwrap();
        assert_eq!(sent.request_id(), "r0");
        assert!(!sent.is_ok());
        assert!(receivers.responses.try_recv().is_err());
        match &slots[1] {
            ResponseSlot::Pending(response) => assert_eq!(response.outputs().len(), 2),
            other => panic!("unexpected slot {:?}", other),
        }
    }

    #[test]
    fn test_failed_slot_keeps_buffers_until_sent() {
        let (host, receivers) = ChannelHost::new();
        let stream = CopyStream::host();
        let manager = MemoryManager::new();
        let requests = requests(&[1, 1]);
        let mut slots = pending(&requests);
        let output = Tensor::from_vec(vec![0f32; 4], &[2, 2]).unwrap();
        let mut responder = OutputResponder::new(
            &requests, &[1, 1], &mut slots, &host, true, &stream, &manager, true,
        );
        responder
            .process_tensor("y__0", DataType::Fp32, &output)
            .unwrap();
        responder.failures[0] = Some(Error::Internal("copy failed".to_string()));
        responder
            .process_tensor("z__1", DataType::Fp32, &output)
            .unwrap();
        // the first output of r0 is still held by its slot
        assert_eq!(manager.cached_bytes(), 0);
        responder.send_failures();
        assert_eq!(manager.cached_bytes(), 8);
        let sent = receivers.responses.try_recv().unwrap();
        assert_eq!(sent.request_id(), "r0");
        assert!(sent.outputs().is_empty());
        match &slots[1] {
            ResponseSlot::Pending(response) => assert_eq!(response.outputs().len(), 2),
            other => panic!("unexpected slot {:?}", other),
        }
    }

    #[test]
    fn test_repack_failure_keeps_cause() {
        let (host, _receivers) = ChannelHost::new();
        let stream = CopyStream::host();
        let manager = MemoryManager::new();
        let requests = requests(&[1]);
        let mut slots = pending(&requests);
        let memory = unsafe { Memory::from_raw_parts(MemoryType::Gpu, 0, 0x1000, 24, None) };
        let output = Tensor::from_memory(memory, ScalarType::Float32, &[2, 3])
            .unwrap()
            .transpose(0, 1)
            .unwrap();
        let mut responder =
            OutputResponder::new(&requests, &[1], &mut slots, &host, true, &stream, &manager, true);
        match responder.process_tensor("y__0", DataType::Fp32, &output) {
            Err(Error::Internal(message)) => {
                assert!(message.starts_with("output tensor 'y__0' is not found: "))
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
