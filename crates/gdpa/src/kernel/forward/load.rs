use super::UnitContext;
use crate::{
    engine::CopyEngine,
    error::KernelError,
    scheduler::TileCoord,
    sync::{BufferPhase, PhaseCounter},
};

/// Load partition: Q0, K0, Q1, V0, then K and V for every further key block.
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

    let mut q_counter = PhaseCounter::new(config.num_buffers_q);
    let mut kv_counter = PhaseCounter::new(config.num_buffers_kv);

    for tile in launch.schedule.unit(context.unit, context.units) {
        let kv_head = tile.head / launch.group_size;
        let k_end = tile.k_begin + tile.k_len;

        let q_at = q_counter.next();
        load_query_half(context, &copy, &tile, q_at, 0)?;
        for (step, block) in tile
            .key_blocks(config.block_m, config.block_n, launch.params)
            .enumerate()
        {
            let kv_row = tile.k_begin + block * config.block_n;

            let k_at = kv_counter.next();
            state.key_value.producer_acquire(k_at, control)?;
            copy.load(
                launch.key,
                state.key_value.slot(k_at),
                kv_row,
                k_end,
                kv_head,
                state.key_value.full(k_at),
            )?;

            if step == 0 {
                load_query_half(context, &copy, &tile, q_at, 1)?;
            }

            let v_at = kv_counter.next();
            state.key_value.producer_acquire(v_at, control)?;
            copy.load(
                launch.value,
                state.key_value.slot(v_at),
                kv_row,
                k_end,
                kv_head,
                state.key_value.full(v_at),
            )?;
        }
    }
    Ok(())
}

fn load_query_half<'a>(
    context: UnitContext<'a, '_>,
    copy: &CopyEngine<'a>,
    tile: &TileCoord,
    at: BufferPhase,
    half_index: usize,
) -> Result<(), KernelError> {
    let launch = context.launch;
    let query = &context.state.query[half_index];
    let row = tile.q_begin
        + tile.block * launch.config.block_m
        + half_index * launch.config.half_block_m();

    query.producer_acquire(at, context.control)?;
    copy.load(
        launch.query,
        query.slot(at),
        row,
        tile.q_begin + tile.q_len,
        tile.head,
        query.full(at),
    )
}
