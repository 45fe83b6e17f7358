use super::SharedSlot;
use crate::{
    error::KernelError,
    sync::{BufferPhase, LaunchControl, MBarrier},
};

/// Ring of buffer slots, each guarded by a full (producer commit) and an empty
/// (consumer release) barrier.
pub struct Pipeline<T> {
    slots: Vec<SharedSlot<T>>,
    full: Vec<MBarrier>,
    empty: Vec<MBarrier>,
}

impl<T> Pipeline<T> {
    pub fn new<F>(
        name: &str,
        buffers: usize,
        mut make_slot: F,
    ) -> Self
    where
        F: FnMut() -> T,
    {
        Self {
            slots: (0..buffers)
                .map(|index| SharedSlot::new(format!("{name}[{index}]"), make_slot()))
                .collect(),
            full: MBarrier::array(&format!("{name}_full"), buffers, 1),
            empty: MBarrier::array(&format!("{name}_empty"), buffers, 1),
        }
    }

    pub fn buffers(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(
        &self,
        at: BufferPhase,
    ) -> &SharedSlot<T> {
        &self.slots[at.index]
    }

    pub fn full(
        &self,
        at: BufferPhase,
    ) -> &MBarrier {
        &self.full[at.index]
    }

    pub fn empty(
        &self,
        at: BufferPhase,
    ) -> &MBarrier {
        &self.empty[at.index]
    }

    pub fn producer_acquire(
        &self,
        at: BufferPhase,
        control: &LaunchControl,
    ) -> Result<(), KernelError> {
        self.empty(at).wait(at.producer_phase(), control)
    }

    pub fn producer_commit(
        &self,
        at: BufferPhase,
    ) {
        self.full(at).arrive();
    }

    pub fn consumer_wait(
        &self,
        at: BufferPhase,
        control: &LaunchControl,
    ) -> Result<(), KernelError> {
        self.full(at).wait(at.phase, control)
    }

    pub fn consumer_release(
        &self,
        at: BufferPhase,
    ) {
        self.empty(at).arrive();
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::sync::PhaseCounter;

    #[test]
    fn test_ring_hands_over_in_order() {
        let control = LaunchControl::new(Duration::from_secs(5));
        let pipeline = Pipeline::new("ring", 2, || 0usize);
        let received = thread::scope(|scope| {
            scope.spawn(|| {
                let mut counter = PhaseCounter::new(pipeline.buffers());
                for value in 0..9 {
                    let at = counter.next();
                    pipeline.producer_acquire(at, &control).unwrap();
                    *pipeline.slot(at).access().unwrap() = value;
                    pipeline.producer_commit(at);
                }
            });
            let consumer = scope.spawn(|| {
                let mut counter = PhaseCounter::new(pipeline.buffers());
                let mut received = Vec::new();
                for _ in 0..9 {
                    let at = counter.next();
                    pipeline.consumer_wait(at, &control).unwrap();
                    received.push(*pipeline.slot(at).access().unwrap());
                    pipeline.consumer_release(at);
                }
                received
            });
            consumer.join().unwrap()
        });
        assert_eq!(received, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_producer_cannot_lap_the_consumer() {
        let control = LaunchControl::new(Duration::from_millis(100));
        let pipeline = Pipeline::new("ring", 2, || ());
        let mut counter = PhaseCounter::new(2);
        for _ in 0..2 {
            let at = counter.next();
            pipeline.producer_acquire(at, &control).unwrap();
            pipeline.producer_commit(at);
        }
        let at = counter.next();
        assert!(matches!(
            pipeline.producer_acquire(at, &control),
            Err(KernelError::BarrierTimeout { .. })
        ));
    }
}
