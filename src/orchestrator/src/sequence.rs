//! Sequence control tensors of stateful models.

use crate::config::{ControlKind, SequenceBatching};
use crate::{DataType, Error, RequestInput, SequenceControl};
use memory_manager::Memory;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Encoding {
    Fp32([f32; 2]),
    Int32([i32; 2]),
    Bool,
    CorrelationId,
}

/// A validated control input.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ControlTensor {
    pub name: String,
    pub kind: ControlKind,
    pub dtype: DataType,
    encoding: Encoding,
}

fn false_true<T: Copy>(values: &[T]) -> Option<[T; 2]> {
    match values {
        [f, t] => Some([*f, *t]),
        _ => None,
    }
}

impl ControlTensor {
    /// Build the tensor this control contributes to a request with `batch`
    /// entries.
    pub fn synthesize(&self, control: &SequenceControl, batch: usize, batched: bool) -> RequestInput {
        let flag = match self.kind {
            ControlKind::Start => control.start,
            ControlKind::End => control.end,
            ControlKind::Ready => control.ready,
            ControlKind::CorrelationId => false,
        };
        let mut element = vec![];
        match self.encoding {
            Encoding::Fp32(values) => element.extend_from_slice(&values[flag as usize].to_ne_bytes()),
            Encoding::Int32(values) => element.extend_from_slice(&values[flag as usize].to_ne_bytes()),
            Encoding::Bool => element.push(flag as u8),
            Encoding::CorrelationId => {
                let id = control.correlation_id;
                match self.dtype {
                    DataType::Int32 => element.extend_from_slice(&(id as u32).to_ne_bytes()),
                    DataType::Int16 => element.extend_from_slice(&(id as u16).to_ne_bytes()),
                    DataType::Uint8 | DataType::Int8 => element.push(id as u8),
                    _ => element.extend_from_slice(&id.to_ne_bytes()),
                }
            }
        }
        let shape = if batched { vec![batch as i64, 1] } else { vec![1] };
        let count = if batched { batch } else { 1 };
        let bytes = element.repeat(count);
        RequestInput::new(self.name.clone(), self.dtype, &shape).with_buffer(Memory::from_vec(bytes))
    }
}

/// Validate every control of `sequence_batching`. At most one tensor per
/// kind, boolean controls carry exactly one `[false, true]` list, the
/// correlation id uses an integer type.
pub(crate) fn resolve_controls(
    model: &str,
    sequence_batching: &SequenceBatching,
) -> Result<Vec<ControlTensor>, Error> {
    let mut kinds = HashSet::new();
    let mut controls = vec![];
    for input in &sequence_batching.control_input {
        for control in &input.control {
            if !kinds.insert(control.kind) {
                return Err(Error::InvalidArg(format!(
                    "sequence batching for model '{}' contains multiple control tensors for {}",
                    model,
                    control.kind.as_str()
                )));
            }
            let invalid = |what: &str| {
                Error::InvalidArg(format!(
                    "{} control '{}' of model '{}' {}",
                    control.kind.as_str(),
                    input.name,
                    model,
                    what
                ))
            };
            let (dtype, encoding) = if control.kind == ControlKind::CorrelationId {
                let dtype = control
                    .data_type
                    .ok_or_else(|| invalid("must specify a data type"))?;
                if !dtype.is_integer() {
                    return Err(invalid(&format!("uses unsupported data type {}", dtype)));
                }
                // unsigned ids travel in the signed type of the same width
                let dtype = match dtype {
                    DataType::Uint16 => DataType::Int16,
                    DataType::Uint32 => DataType::Int32,
                    DataType::Uint64 => DataType::Int64,
                    other => other,
                };
                (dtype, Encoding::CorrelationId)
            } else {
                let lists = [
                    !control.fp32_false_true.is_empty(),
                    !control.int32_false_true.is_empty(),
                    !control.bool_false_true.is_empty(),
                ];
                if lists.iter().filter(|&&set| set).count() != 1 {
                    return Err(invalid("must specify exactly one false/true list"));
                }
                let two_values = || invalid("false/true list must contain exactly 2 values");
                if lists[0] {
                    let values = false_true(&control.fp32_false_true).ok_or_else(two_values)?;
                    (DataType::Fp32, Encoding::Fp32(values))
                } else if lists[1] {
                    let values = false_true(&control.int32_false_true).ok_or_else(two_values)?;
                    (DataType::Int32, Encoding::Int32(values))
                } else {
                    if false_true(&control.bool_false_true) != Some([false, true]) {
                        return Err(invalid("bool false/true list must be [false, true]"));
                    }
                    (DataType::Bool, Encoding::Bool)
                }
            };
            controls.push(ControlTensor {
                name: input.name.clone(),
                kind: control.kind,
                dtype,
                encoding,
            });
        }
    }
    Ok(controls)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Control, ControlInput};

    fn control(kind: ControlKind) -> Control {
        Control {
            kind,
            fp32_false_true: vec![],
            int32_false_true: vec![],
            bool_false_true: vec![],
            data_type: None,
        }
    }

    fn batching(inputs: Vec<(&str, Control)>) -> SequenceBatching {
        SequenceBatching {
            control_input: inputs
                .into_iter()
                .map(|(name, control)| ControlInput {
                    name: name.to_string(),
                    control: vec![control],
                })
                .collect(),
        }
    }

    #[test]
    fn test_resolve_and_synthesize() {
        let mut start = control(ControlKind::Start);
        start.fp32_false_true = vec![0.0, 1.0];
        let mut ready = control(ControlKind::Ready);
        ready.int32_false_true = vec![0, 7];
        let mut end = control(ControlKind::End);
        end.bool_false_true = vec![false, true];
        let mut corrid = control(ControlKind::CorrelationId);
        corrid.data_type = Some(DataType::Uint64);
        let controls = resolve_controls(
            "m",
            &batching(vec![
                ("start__1", start),
                ("ready__2", ready),
                ("end__3", end),
                ("corrid__4", corrid),
            ]),
        )
        .unwrap();
        assert_eq!(controls.len(), 4);
        let values = SequenceControl {
            start: true,
            end: false,
            ready: true,
            correlation_id: 42,
        };

        let start = controls[0].synthesize(&values, 2, true);
        assert_eq!(start.shape(), &[2, 1]);
        assert_eq!(start.dtype(), DataType::Fp32);
        let mut expected = 1f32.to_ne_bytes().to_vec();
        expected.extend_from_slice(&1f32.to_ne_bytes());
        assert_eq!(start.buffers()[0].as_slice().unwrap(), &expected[..]);

        let ready = controls[1].synthesize(&values, 1, true);
        assert_eq!(ready.buffers()[0].as_slice().unwrap(), &7i32.to_ne_bytes()[..]);

        let end = controls[2].synthesize(&values, 1, false);
        assert_eq!(end.shape(), &[1]);
        assert_eq!(end.buffers()[0].as_slice().unwrap(), &[0]);

        let corrid = controls[3].synthesize(&values, 1, true);
        assert_eq!(corrid.dtype(), DataType::Int64);
        assert_eq!(corrid.buffers()[0].as_slice().unwrap(), &42u64.to_ne_bytes()[..]);
    }

    #[test]
    fn test_invalid_controls() {
        let mut a = control(ControlKind::Start);
        a.fp32_false_true = vec![0.0, 1.0];
        let b = a.clone();
        assert!(resolve_controls("m", &batching(vec![("a__0", a.clone()), ("b__1", b)])).is_err());

        let mut three = control(ControlKind::End);
        three.int32_false_true = vec![0, 1, 2];
        assert!(resolve_controls("m", &batching(vec![("e__0", three)])).is_err());

        let mut both = control(ControlKind::Ready);
        both.int32_false_true = vec![0, 1];
        both.fp32_false_true = vec![0.0, 1.0];
        assert!(resolve_controls("m", &batching(vec![("r__0", both)])).is_err());

        assert!(resolve_controls("m", &batching(vec![("r__0", control(ControlKind::Ready))])).is_err());

        let mut float_id = control(ControlKind::CorrelationId);
        float_id.data_type = Some(DataType::Fp32);
        assert!(resolve_controls("m", &batching(vec![("c__0", float_id)])).is_err());
        assert!(resolve_controls("m", &batching(vec![("c__0", control(ControlKind::CorrelationId))])).is_err());
    }
}
