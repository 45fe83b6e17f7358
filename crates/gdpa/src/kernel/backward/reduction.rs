use super::UnitContext;
use crate::{error::KernelError, sync::PhaseCounter};

/// Reduction partition: every key tile contributes a partial `dQ` for each
/// query block it sees, so the partials are added atomically.
pub(super) fn run(context: UnitContext<'_, '_>) -> Result<(), KernelError> {
    let UnitContext {
        launch,
        state,
        control,
        ..
    } = context;
    let config = launch.config;
    let mut dq_counter = PhaseCounter::new(config.num_buffers_tmem);

    for tile in launch.schedule.unit(context.unit, context.units) {
        for block in tile.query_blocks(config.block_n1, config.block_m1, launch.params)
        {
            let dq_at = dq_counter.next();
            state.d_query.consumer_wait(dq_at, control)?;
            let partial = state.d_query.slot(dq_at).access()?.clone();
            state.d_query.consumer_release(dq_at);

            launch.d_query.atomic_add_rows(
                partial.view(),
                tile.q_begin + block * config.block_m1,
                tile.q_begin + tile.q_len,
                tile.head,
            );
        }
    }
    Ok(())
}
