mod copy;
mod mma;

use crossbeam_channel::{Receiver, Sender, unbounded};
pub use copy::CopyEngine;
pub use mma::MmaEngine;

use crate::{
    error::KernelError,
    sync::{LaunchControl, MBarrier},
};

type EngineOp<'a> = Box<dyn FnOnce() -> Result<(), KernelError> + Send + 'a>;

/// Barrier update an engine performs once an operation has finished.
pub enum Completion<'a> {
    Arrive(&'a MBarrier),
    CompleteTx(&'a MBarrier, usize),
}

impl Completion<'_> {
    fn signal(&self) {
        match self {
            Completion::Arrive(barrier) => barrier.arrive(),
            Completion::CompleteTx(barrier, bytes) => barrier.complete_tx(*bytes),
        }
    }
}

struct Command<'a> {
    op: EngineOp<'a>,
    completions: Vec<Completion<'a>>,
}

/// Issue side of an asynchronous engine. Submitting returns immediately;
/// operations run in submission order on the engine's own thread.
#[derive(Clone)]
pub struct EngineQueue<'a> {
    name: &'static str,
    sender: Sender<Command<'a>>,
}

impl<'a> EngineQueue<'a> {
    pub fn submit<F>(
        &self,
        completions: Vec<Completion<'a>>,
        op: F,
    ) -> Result<(), KernelError>
    where
        F: FnOnce() -> Result<(), KernelError> + Send + 'a,
    {
        self.sender
            .send(Command {
                op: Box::new(op),
                completions,
            })
            .map_err(|_| KernelError::EngineDisconnected(self.name))
    }

    /// Arrives on `barriers` once everything submitted before has finished.
    pub fn commit(
        &self,
        barriers: &[&'a MBarrier],
    ) -> Result<(), KernelError> {
        self.submit(
            barriers.iter().map(|barrier| Completion::Arrive(*barrier)).collect(),
            || Ok(()),
        )
    }
}

/// Execution side of an asynchronous engine; runs until every queue handle
/// has been dropped.
pub struct EngineWorker<'a> {
    name: &'static str,
    receiver: Receiver<Command<'a>>,
}

impl EngineWorker<'_> {
    pub fn run(
        self,
        control: &LaunchControl,
    ) {
        for command in self.receiver.iter() {
            if control.is_aborted() {
                continue;
            }
            match (command.op)() {
                Ok(()) => {
                    for completion in &command.completions {
                        completion.signal();
                    }
                },
                Err(error) => {
                    log::debug!("Engine {} failed: {error}", self.name);
                    control.fail(error);
                },
            }
        }
    }
}

pub fn engine<'a>(name: &'static str) -> (EngineQueue<'a>, EngineWorker<'a>) {
    let (sender, receiver) = unbounded();
    (
        EngineQueue {
            name,
            sender,
        },
        EngineWorker {
            name,
            receiver,
        },
    )
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_operations_complete_in_order_then_signal() {
        let control = LaunchControl::new(Duration::from_secs(5));
        let done = MBarrier::new("done", 1);
        let log = Mutex::new(Vec::new());
        thread::scope(|scope| {
            let (queue, worker) = engine("mma");
            scope.spawn(|| worker.run(&control));
            for step in 0..4 {
                let log = &log;
                queue
                    .submit(Vec::new(), move || {
                        log.lock().unwrap().push(step);
                        Ok(())
                    })
                    .unwrap();
            }
            queue.commit(&[&done]).unwrap();
            drop(queue);
            done.wait(0, &control).unwrap();
            assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        });
    }

    #[test]
    fn test_failed_operation_aborts_launch() {
        let control = LaunchControl::new(Duration::from_secs(5));
        let never = MBarrier::new("never", 1);
        thread::scope(|scope| {
            let (queue, worker) = engine("copy");
            scope.spawn(|| worker.run(&control));
            queue
                .submit(vec![Completion::Arrive(&never)], || {
                    Err(KernelError::SlotContention("kv[0]".to_string()))
                })
                .unwrap();
            assert_eq!(never.wait(0, &control), Err(KernelError::Aborted));
        });
        assert_eq!(never.completed_phases(), 0);
        assert_eq!(
            control.finish(),
            Err(KernelError::SlotContention("kv[0]".to_string()))
        );
    }
}
