use super::{Completion, EngineQueue};
use crate::{error::KernelError, sync::MBarrier};

/// Issue handle of a unit's matrix engine.
///
/// Matmuls execute in issue order, so a completion barrier attached to an
/// operation also certifies every matmul issued before it.
#[derive(Clone)]
pub struct MmaEngine<'a> {
    queue: EngineQueue<'a>,
}

impl<'a> MmaEngine<'a> {
    pub fn new(queue: EngineQueue<'a>) -> Self {
        Self {
            queue,
        }
    }

    pub fn issue<F>(
        &self,
        completions: &[&'a MBarrier],
        op: F,
    ) -> Result<(), KernelError>
    where
        F: FnOnce() -> Result<(), KernelError> + Send + 'a,
    {
        self.queue.submit(
            completions.iter().map(|barrier| Completion::Arrive(*barrier)).collect(),
            op,
        )
    }

    pub fn commit(
        &self,
        barriers: &[&'a MBarrier],
    ) -> Result<(), KernelError> {
        self.queue.commit(barriers)
    }
}
