//! The callable capability and the inference-only mode guard.

use crate::{Error, Tensor};
use std::{cell::Cell, marker::PhantomData};

thread_local! {
    static GRAD_ENABLED: Cell<bool> = Cell::new(true);
}

/// Whether gradient tracking is enabled on the current thread.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|enabled| enabled.get())
}

/// Disables gradient tracking on the current thread until dropped, then
/// restores the previous mode. Guards nest.
pub struct NoGradGuard {
    previous: bool,
    // the mode is per thread, so the guard must stay on this one
    _thread: PhantomData<*const ()>,
}

impl NoGradGuard {
    /// Enter inference-only mode.
    pub fn new() -> Self {
        NoGradGuard {
            previous: GRAD_ENABLED.with(|enabled| enabled.replace(false)),
            _thread: PhantomData,
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        NoGradGuard::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        GRAD_ENABLED.with(|enabled| enabled.set(previous));
    }
}

/// Result of one forward call.
#[derive(Debug, Clone)]
pub enum ModuleOutput {
    /// A single-output model.
    Tensor(Tensor),
    /// Outputs of a multi-output model, in declaration order.
    Tuple(Vec<Tensor>),
}

impl ModuleOutput {
    /// Number of produced tensors.
    pub fn len(&self) -> usize {
        match self {
            ModuleOutput::Tensor(_) => 1,
            ModuleOutput::Tuple(tensors) => tensors.len(),
        }
    }

    /// Whether no tensor was produced.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produced tensors in positional order.
    pub fn into_tensors(self) -> Vec<Tensor> {
        match self {
            ModuleOutput::Tensor(tensor) => vec![tensor],
            ModuleOutput::Tuple(tensors) => tensors,
        }
    }
}

/// A loaded model: positional tensors in, one tensor or a tuple out.
///
/// Calls are synchronous. Implementations may assume inputs are contiguous.
pub trait Module: Send {
    /// Run the model once on the whole batch.
    fn forward(&self, inputs: &[Tensor]) -> Result<ModuleOutput, Error>;
}

impl<F> Module for F
where
    F: Fn(&[Tensor]) -> Result<ModuleOutput, Error> + Send,
{
    fn forward(&self, inputs: &[Tensor]) -> Result<ModuleOutput, Error> {
        self(inputs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_no_grad_guard_nests() {
        assert!(is_grad_enabled());
        {
            let _outer = NoGradGuard::new();
            assert!(!is_grad_enabled());
            {
                let _inner = NoGradGuard::new();
                assert!(!is_grad_enabled());
            }
            assert!(!is_grad_enabled());
        }
        assert!(is_grad_enabled());
    }

    #[test]
    fn test_guard_is_thread_local() {
        let _guard = NoGradGuard::new();
        let other = std::thread::spawn(is_grad_enabled).join().unwrap();
        assert!(other);
        assert!(!is_grad_enabled());
    }

    #[test]
    fn test_closure_module() {
        let module = |inputs: &[Tensor]| -> Result<ModuleOutput, Error> {
            Ok(ModuleOutput::Tuple(inputs.iter().rev().cloned().collect()))
        };
        let a = Tensor::from_vec(vec![1i32], &[1]).unwrap();
        let b = Tensor::from_vec(vec![2i64], &[1]).unwrap();
        let output = module.forward(&[a, b]).unwrap();
        assert_eq!(output.len(), 2);
        let tensors = output.into_tensors();
        assert_eq!(tensors[0].to_vec::<i64>().unwrap(), vec![2]);
        assert_eq!(tensors[1].to_vec::<i32>().unwrap(), vec![1]);

        let boxed: Box<dyn Module> = Box::new(|inputs: &[Tensor]| -> Result<ModuleOutput, Error> {
            Ok(ModuleOutput::Tensor(inputs[0].clone()))
        });
        let single = boxed
            .forward(&[Tensor::from_vec(vec![7u8], &[1]).unwrap()])
            .unwrap();
        assert!(!single.is_empty());
        assert!(matches!(single, ModuleOutput::Tensor(_)));
    }
}
