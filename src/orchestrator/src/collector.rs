//! Scatter of per-request inputs into one aggregated buffer per input.

use crate::{Error, InferenceRequest, RequestInput};
use memory_manager::{AllocationType, CopyStream, Memory, MemoryManager, MemoryType};

/// A host buffer waiting to be staged through pinned memory.
struct Piece<'r> {
    buffer: &'r Memory,
    offset: usize,
}

/// Copies the inputs of a request group into aggregated buffers.
///
/// Device bound copies may still be in flight when a call returns. Staging
/// buffers are kept until the collector is dropped, which must happen after
/// the stream has been synchronized.
pub(crate) struct InputCollector<'a> {
    stream: &'a CopyStream,
    memory_manager: &'a MemoryManager,
    pinned_enabled: bool,
    pending_async: bool,
    staging: Vec<Memory>,
}

impl<'a> InputCollector<'a> {
    pub fn new(
        stream: &'a CopyStream,
        memory_manager: &'a MemoryManager,
        pinned_enabled: bool,
    ) -> Self {
        InputCollector {
            stream,
            memory_manager,
            pinned_enabled,
            pending_async: false,
            staging: vec![],
        }
    }

    /// Copy input `template.name()` of every request into `destination`,
    /// request after request. Every request must match the template's type
    /// and non-batch dimensions, and together they must fill `destination`
    /// exactly.
    pub fn process_tensor(
        &mut self,
        requests: &[InferenceRequest],
        template: &RequestInput,
        batched: bool,
        destination: &mut Memory,
    ) -> Result<(), Error> {
        let name = template.name();
        let staged = self.pinned_enabled && destination.memory_type() == MemoryType::Gpu;
        let mut run: Vec<Piece<'_>> = vec![];
        let mut offset = 0;
        for request in requests {
            let input = request.get_input(name).ok_or_else(|| {
                Error::InvalidArg(format!(
                    "input '{}' is missing from request '{}'",
                    name,
                    request.id()
                ))
            })?;
            check_structure(request, input, template, batched)?;
            let expected = input.byte_size().ok_or_else(|| {
                Error::InvalidArg(format!(
                    "input '{}' of request '{}' has no fixed byte size",
                    name,
                    request.id()
                ))
            })?;
            if input.buffer_byte_size() != expected {
                return Err(Error::InvalidArg(format!(
                    "input '{}' of request '{}' holds {} bytes, expecting {}",
                    name,
                    request.id(),
                    input.buffer_byte_size(),
                    expected
                )));
            }
            for buffer in input.buffers() {
                if offset + buffer.size() > destination.size() {
                    return Err(Error::Internal(format!(
                        "input '{}' overflows its {} byte batch buffer",
                        name,
                        destination.size()
                    )));
                }
                if staged && buffer.memory_type() == MemoryType::Cpu {
                    run.push(Piece { buffer, offset });
                } else {
                    self.flush(&mut run, destination)?;
                    self.pending_async |= self.stream.copy(buffer, 0, destination, offset, buffer.size())?;
                }
                offset += buffer.size();
            }
        }
        self.flush(&mut run, destination)?;
        if offset != destination.size() {
            return Err(Error::Internal(format!(
                "requests provide {} bytes for input '{}', batch buffer holds {}",
                offset,
                name,
                destination.size()
            )));
        }
        Ok(())
    }

    /// Pack a run of consecutive pageable pieces into one pinned buffer and
    /// issue a single copy to the destination.
    fn flush(&mut self, run: &mut Vec<Piece<'_>>, destination: &mut Memory) -> Result<(), Error> {
        let (first, last) = match (run.first(), run.last()) {
            (Some(first), Some(last)) => (first.offset, last.offset + last.buffer.size()),
            _ => return Ok(()),
        };
        let size = last - first;
        match self
            .memory_manager
            .allocate(AllocationType::CpuPinned, 0, size)
        {
            Ok(mut pinned) => {
                for piece in run.iter() {
                    self.stream.copy(
                        piece.buffer,
                        0,
                        &mut pinned,
                        piece.offset - first,
                        piece.buffer.size(),
                    )?;
                }
                self.pending_async |= self.stream.copy(&pinned, 0, destination, first, size)?;
                self.staging.push(pinned);
            }
            Err(err) => {
                log::debug!("pinned staging unavailable, copying directly: {}", err);
                for piece in run.iter() {
                    self.pending_async |= self.stream.copy(
                        piece.buffer,
                        0,
                        destination,
                        piece.offset,
                        piece.buffer.size(),
                    )?;
                }
            }
        }
        run.clear();
        Ok(())
    }

    /// Whether any copy may still be in flight on the stream.
    pub fn finalize(&self) -> bool {
        self.pending_async
    }
}

fn check_structure(
    request: &InferenceRequest,
    input: &RequestInput,
    template: &RequestInput,
    batched: bool,
) -> Result<(), Error> {
    if input.dtype() != template.dtype() {
        return Err(Error::InvalidArg(format!(
            "input '{}' of request '{}' has type {}, expecting {}",
            input.name(),
            request.id(),
            input.dtype(),
            template.dtype()
        )));
    }
    let skip = if batched { 1 } else { 0 };
    let same_rank = input.shape().len() == template.shape().len();
    if !same_rank || input.shape().iter().skip(skip).ne(template.shape().iter().skip(skip)) {
        return Err(Error::InvalidArg(format!(
            "input '{}' of request '{}' has shape {:?}, incompatible with {:?}",
            input.name(),
            request.id(),
            input.shape(),
            template.shape()
        )));
    }
    Ok(())
}
