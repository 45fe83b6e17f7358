use super::{Completion, EngineQueue};
use crate::{
    DataType,
    error::KernelError,
    memory::{GlobalTensor, SharedSlot, TensorDescriptor, Tile},
    sync::MBarrier,
};

/// Issue handle of a unit's bulk-copy engine.
#[derive(Clone)]
pub struct CopyEngine<'a> {
    queue: EngineQueue<'a>,
}

impl<'a> CopyEngine<'a> {
    pub fn new(queue: EngineQueue<'a>) -> Self {
        Self {
            queue,
        }
    }

    /// Arms `full` with the byte count of one box, then copies the box into
    /// `slot` asynchronously. The phase completes once the bytes have landed.
    pub fn load<'d: 'a>(
        &self,
        descriptor: TensorDescriptor<'d>,
        slot: &'a SharedSlot<Tile>,
        row: usize,
        row_end: usize,
        head: usize,
        full: &'a MBarrier,
    ) -> Result<(), KernelError> {
        let rows = slot.access()?.nrows();
        let bytes = descriptor.box_bytes(rows);
        full.arrive_expect_tx(bytes);
        self.queue.submit(vec![Completion::CompleteTx(full, bytes)], move || {
            let mut tile = slot.access()?;
            descriptor.load_box(&mut tile, row, row_end, head);
            Ok(())
        })
    }

    /// Stores `slot` to `destination`, clipped to `row_end`, then releases the
    /// slot through `release`.
    pub fn store(
        &self,
        slot: &'a SharedSlot<Tile>,
        destination: &'a GlobalTensor,
        row: usize,
        row_end: usize,
        head: usize,
        data_type: DataType,
        release: &'a MBarrier,
    ) -> Result<(), KernelError> {
        self.queue.submit(vec![Completion::Arrive(release)], move || {
            let tile = slot.access()?;
            destination.store_rows(tile.view(), row, row_end, head, data_type);
            Ok(())
        })
    }
}
