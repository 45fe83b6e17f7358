use super::UnitContext;
use crate::{engine::CopyEngine, error::KernelError, sync::PhaseCounter};

/// Load partition: K and V once per tile, then Q and dO for every query
/// block that can see the tile.
pub(super) fn run<'a>(
    context: UnitContext<'a, '_>,
    copy: CopyEngine<'a>,
) -> Result<(), KernelError> {
    let UnitContext {
        launch,
        state,
        control,
        ..
    } = context;
    let config = launch.config;

    let mut kv_counter = PhaseCounter::new(config.num_buffers_kv);
    let mut q_counter = PhaseCounter::new(config.num_buffers_q);
    let mut do_counter = PhaseCounter::new(config.num_buffers_do);

    for tile in launch.schedule.unit(context.unit, context.units) {
        let kv_head = tile.head / launch.group_size;
        let kv_row = tile.k_begin + tile.block * config.block_n1;
        let k_end = tile.k_begin + tile.k_len;
        let q_end = tile.q_begin + tile.q_len;

        let kv_at = kv_counter.next();
        state.key.producer_acquire(kv_at, control)?;
        copy.load(
            launch.key,
            state.key.slot(kv_at),
            kv_row,
            k_end,
            kv_head,
            state.key.full(kv_at),
        )?;
        state.value.producer_acquire(kv_at, control)?;
        copy.load(
            launch.value,
            state.value.slot(kv_at),
            kv_row,
            k_end,
            kv_head,
            state.value.full(kv_at),
        )?;

        for block in tile.query_blocks(config.block_n1, config.block_m1, launch.params)
        {
            let q_row = tile.q_begin + block * config.block_m1;

            let q_at = q_counter.next();
            state.query.producer_acquire(q_at, control)?;
            copy.load(
                launch.query,
                state.query.slot(q_at),
                q_row,
                q_end,
                tile.head,
                state.query.full(q_at),
            )?;

            let do_at = do_counter.next();
            state.d_output.producer_acquire(do_at, control)?;
            copy.load(
                launch.d_output,
                state.d_output.slot(do_at),
                q_row,
                q_end,
                tile.head,
                state.d_output.full(do_at),
            )?;
        }
    }
    Ok(())
}
