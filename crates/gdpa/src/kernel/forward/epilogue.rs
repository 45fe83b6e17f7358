use super::UnitContext;
use crate::{engine::CopyEngine, error::KernelError, sync::PhaseCounter};

/// Epilogue partition: stages each finished output half in shared memory and
/// stores it asynchronously. Idle when the activation partitions store the
/// output themselves.
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
    if config.merge_epilogue {
        return Ok(());
    }
    let data_type = launch.params.data_type;
    let half = config.half_block_m();

    let mut o_counter = PhaseCounter::new(config.num_buffers_o);
    let mut staging_counter = PhaseCounter::new(1);

    for tile in launch.schedule.unit(context.unit, context.units) {
        let o_at = o_counter.next();
        let staging_at = staging_counter.next();
        for (half_index, (output, staging)) in
            state.output.iter().zip(&state.output_staging).enumerate()
        {
            output.consumer_wait(o_at, control)?;
            staging.producer_acquire(staging_at, control)?;
            {
                let accumulator = output.slot(o_at).access()?;
                let mut staged = staging.slot(staging_at).access()?;
                staged.assign(&*accumulator);
                staged.mapv_inplace(|value| data_type.quantize(value));
            }
            output.consumer_release(o_at);

            copy.store(
                staging.slot(staging_at),
                launch.output,
                tile.q_begin + tile.block * config.block_m + half_index * half,
                tile.q_begin + tile.q_len,
                tile.head,
                data_type,
                staging.empty(staging_at),
            )?;
        }
    }
    Ok(())
}
