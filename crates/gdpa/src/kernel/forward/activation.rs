use super::UnitContext;
use crate::{
    error::KernelError,
    kernel::mask::ScoreMask,
    sync::PhaseCounter,
};

/// Activation partition for one query half.
///
/// Waits for raw scores, activates them in place and hands the region back
/// to the matrix partition as `P`. With ping-pong enabled the two halves take
/// turns through the activation section, half 0 first.
pub(super) fn run(
    context: UnitContext<'_, '_>,
    half_index: usize,
) -> Result<(), KernelError> {
    let UnitContext {
        launch,
        state,
        control,
        ..
    } = context;
    let config = launch.config;
    let params = launch.params;
    let data_type = params.data_type;
    let scores = &state.scores[half_index];
    let output = &state.output[half_index];
    let half = config.half_block_m();

    let mut qk_counter = PhaseCounter::new(config.num_buffers_qk);
    let mut o_counter = PhaseCounter::new(config.num_buffers_o);
    let mut turn_counter = PhaseCounter::new(1);

    for tile in launch.schedule.unit(context.unit, context.units) {
        let query_start = tile.block * config.block_m + half_index * half;

        for block in tile.key_blocks(config.block_m, config.block_n, params) {
            let qk_at = qk_counter.next();
            scores.qk_full(qk_at).wait(qk_at.phase, control)?;

            let turn_at = turn_counter.next();
            if config.pingpong {
                // Half 0 may run section k once half 1 finished k sections,
                // half 1 once half 0 finished k + 1.
                let parity = turn_at.phase ^ (1 - half_index as u32);
                state.turns[half_index].wait(parity, control)?;
            }

            {
                #[cfg(test)]
                state
                    .section_trace
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(half_index);
                let mask = ScoreMask {
                    params,
                    query_start,
                    query_len: tile.q_len,
                    key_start: block * config.block_n,
                    key_len: tile.k_len,
                };
                let mut buffer = scores.slot(qk_at).access()?;
                let activated = buffer.activate()?;
                for ((row, column), value) in activated.indexed_iter_mut() {
                    *value = if mask.is_visible(row, column) {
                        data_type.quantize(
                            params.activation.apply(*value * params.qk_scale),
                        )
                    } else {
                        0.0
                    };
                }
            }

            if config.pingpong {
                state.turns[1 - half_index].arrive();
            }
            scores.p_ready(qk_at).arrive();
        }

        if config.merge_epilogue {
            let o_at = o_counter.next();
            output.consumer_wait(o_at, control)?;
            let result = output.slot(o_at).access()?.clone();
            output.consumer_release(o_at);
            launch.output.store_rows(
                result.view(),
                tile.q_begin + query_start,
                tile.q_begin + tile.q_len,
                tile.head,
                data_type,
            );
        }
    }
    Ok(())
}
