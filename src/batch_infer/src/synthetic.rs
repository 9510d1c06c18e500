//! Synthetic requests and models for replaying groups without real data.

use memory_manager::Memory;
use module_runtime::{Module, ModuleOutput, Tensor};
use orchestrator::{DataType, Error, InferenceRequest, ModelConfig, RequestInput, SequenceControl};

/// Parse a comma separated list of per-request batch counts, e.g. `2,1,3`.
pub fn parse_batch_counts(s: &str) -> Result<Vec<i64>, Error> {
    s.split(',')
        .map(|count| {
            count
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|&count| count >= 0)
                .ok_or_else(|| Error::InvalidArg(format!("invalid batch count '{}' in '{}'", count, s)))
        })
        .collect()
}

fn fill(dtype: DataType, size: usize, seed: usize) -> Vec<u8> {
    match dtype {
        DataType::Bool => (0..size).map(|i| ((seed + i) % 2) as u8).collect(),
        _ => (0..size).map(|i| ((seed + i) % 251) as u8).collect(),
    }
}

/// One request per entry of `counts`, carrying every configured input with
/// the given batch count. Variable dimensions are set to 1. Requests to a
/// sequence model carry sequence control values, with `group == 0` starting
/// the sequences.
pub fn synthetic_group(
    config: &ModelConfig,
    counts: &[i64],
    group: usize,
) -> Result<Vec<Option<InferenceRequest>>, Error> {
    let batched = config.supports_batching();
    counts
        .iter()
        .enumerate()
        .map(|(i, &count)| {
            let mut request = InferenceRequest::new(format!("g{}-r{}", group, i));
            for input in &config.input {
                let mut shape: Vec<i64> = input.dims.iter().map(|&dim| if dim < 0 { 1 } else { dim }).collect();
                if batched {
                    shape.insert(0, count);
                }
                let size = orchestrator::byte_size(input.data_type, &shape).ok_or_else(|| {
                    Error::Unsupported(format!(
                        "cannot synthesize data for input '{}' of type {}",
                        input.name, input.data_type
                    ))
                })?;
                request = request.input(
                    RequestInput::new(input.name.as_str(), input.data_type, &shape)
                        .with_buffer(Memory::from_vec(fill(input.data_type, size, group + i))),
                );
            }
            if config.sequence_batching.is_some() {
                request = request.sequence_control(SequenceControl {
                    start: group == 0,
                    end: false,
                    ready: true,
                    correlation_id: i as u64 + 1,
                });
            }
            Ok(Some(request))
        })
        .collect()
}

/// A module that returns its inputs, for configurations whose outputs
/// mirror their inputs.
pub fn identity_module() -> Box<dyn Module> {
    Box::new(
        |inputs: &[Tensor]| -> Result<ModuleOutput, module_runtime::Error> {
            match inputs {
                [single] => Ok(ModuleOutput::Tensor(single.clone())),
                _ => Ok(ModuleOutput::Tuple(inputs.to_vec())),
            }
        },
    )
}
