use super::UnitContext;
use crate::{
    error::KernelError,
    kernel::mask::ScoreMask,
    sync::PhaseCounter,
};

/// Activation partition.
///
/// For every query block it turns `K·Qᵀ` into `Pᵀ` in place, then combines
/// the raw scores with `dPᵀ` into `dSᵀ`. Once a tile is done it writes the
/// key and value gradients out; query heads sharing a key/value head add
/// into the same rows.
pub(super) fn run(context: UnitContext<'_, '_>) -> Result<(), KernelError> {
    let UnitContext {
        launch,
        state,
        control,
        ..
    } = context;
    let config = launch.config;
    let params = launch.params;
    let data_type = params.data_type;
    let scale = params.qk_scale;
    let scores = &state.scores;

    let mut score_counter = PhaseCounter::new(config.num_buffers_tmem);
    let mut ds_counter = PhaseCounter::new(config.num_buffers_ds);
    let mut dkv_counter = PhaseCounter::new(1);

    for tile in launch.schedule.unit(context.unit, context.units) {
        let key_start = tile.block * config.block_n1;

        for block in tile.query_blocks(config.block_n1, config.block_m1, params) {
            let mask = ScoreMask {
                params,
                query_start: block * config.block_m1,
                query_len: tile.q_len,
                key_start,
                key_len: tile.k_len,
            };

            let score_at = score_counter.next();
            scores.qk_full(score_at).wait(score_at.phase, control)?;
            let raw = {
                let mut region = scores.slot(score_at).access()?;
                let activated = region.activate()?;
                let raw = activated.clone();
                for ((row, column), value) in activated.indexed_iter_mut() {
                    *value = if mask.is_visible(column, row) {
                        data_type.quantize(params.activation.apply(*value * scale))
                    } else {
                        0.0
                    };
                }
                raw
            };
            scores.p_ready(score_at).arrive();

            scores.dp_full(score_at).wait(score_at.phase, control)?;
            let d_probabilities =
                scores.slot(score_at).access()?.consume_score_grad()?.clone();
            scores.score_empty(score_at).arrive();

            let ds_at = ds_counter.next();
            state.d_scores.producer_acquire(ds_at, control)?;
            {
                let mut d_scores = state.d_scores.slot(ds_at).access()?;
                for ((row, column), value) in d_scores.indexed_iter_mut() {
                    *value = if mask.is_visible(column, row) {
                        let derivative =
                            params.activation.derivative(raw[[row, column]] * scale);
                        data_type.quantize(
                            derivative * d_probabilities[[row, column]] * scale,
                        )
                    } else {
                        0.0
                    };
                }
            }
            state.d_scores.producer_commit(ds_at);
        }

        let dkv_at = dkv_counter.next();
        state.d_key_value.consumer_wait(dkv_at, control)?;
        let (d_key, d_value) = {
            let gradients = state.d_key_value.slot(dkv_at).access()?;
            (gradients.d_key.clone(), gradients.d_value.clone())
        };
        state.d_key_value.consumer_release(dkv_at);

        let kv_head = tile.head / launch.group_size;
        let row = tile.k_begin + key_start;
        let row_end = tile.k_begin + tile.k_len;
        if launch.group_size > 1 {
            launch.d_key.atomic_add_rows(d_key.view(), row, row_end, kv_head);
            launch.d_value.atomic_add_rows(d_value.view(), row, row_end, kv_head);
        } else {
            launch
                .d_key
                .store_rows(d_key.view(), row, row_end, kv_head, data_type);
            launch
                .d_value
                .store_rows(d_value.view(), row, row_end, kv_head, data_type);
        }
    }
    Ok(())
}
