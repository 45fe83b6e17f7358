use super::UnitContext;
use crate::{
    engine::MmaEngine,
    error::KernelError,
    memory::matmul_into,
    sync::PhaseCounter,
};

/// Matrix partition. Per query block of a tile:
///
/// ```text
/// qkT  = K·Qᵀ              -> qk_full
/// dV  (+)= Pᵀ·dO           (after p_ready)
/// dpT  = V·dOᵀ             -> dp_full, dO free
/// dK  (+)= dsT·Q           (after ds full) -> Q free
/// dQ   = dsTᵀ·K            -> dq full, dsT free
/// ```
///
/// `dpT` overwrites `Pᵀ`; the engine runs the `dV` matmul first, so no wait
/// sits between the two. The region itself is reacquired through
/// `score_empty` once the activation partition has read `dpT`.
pub(super) fn run<'a>(
    context: UnitContext<'a, '_>,
    mma: MmaEngine<'a>,
) -> Result<(), KernelError> {
    let UnitContext {
        launch,
        state,
        control,
        ..
    } = context;
    let config = launch.config;
    let scores = &state.scores;

    let mut kv_counter = PhaseCounter::new(config.num_buffers_kv);
    let mut q_counter = PhaseCounter::new(config.num_buffers_q);
    let mut do_counter = PhaseCounter::new(config.num_buffers_do);
    let mut score_counter = PhaseCounter::new(config.num_buffers_tmem);
    let mut ds_counter = PhaseCounter::new(config.num_buffers_ds);
    let mut dq_counter = PhaseCounter::new(config.num_buffers_tmem);
    let mut dkv_counter = PhaseCounter::new(1);

    for tile in launch.schedule.unit(context.unit, context.units) {
        let kv_at = kv_counter.next();
        state.key.consumer_wait(kv_at, control)?;
        state.value.consumer_wait(kv_at, control)?;
        let dkv_at = dkv_counter.next();
        state.d_key_value.producer_acquire(dkv_at, control)?;

        let key = state.key.slot(kv_at);
        let value = state.value.slot(kv_at);
        let gradients = state.d_key_value.slot(dkv_at);

        for (step, _) in tile
            .query_blocks(config.block_n1, config.block_m1, launch.params)
            .enumerate()
        {
            let accumulate = step > 0;

            let q_at = q_counter.next();
            state.query.consumer_wait(q_at, control)?;
            let score_at = score_counter.next();
            scores
                .score_empty(score_at)
                .wait(score_at.producer_phase(), control)?;
            let query = state.query.slot(q_at);
            let region = scores.slot(score_at);
            mma.issue(&[scores.qk_full(score_at)], move || {
                let key = key.access()?;
                let query = query.access()?;
                let mut region = region.access()?;
                matmul_into(
                    key.view(),
                    query.t(),
                    region.write_scores()?,
                    false,
                );
                Ok(())
            })?;

            let do_at = do_counter.next();
            state.d_output.consumer_wait(do_at, control)?;
            scores.p_ready(score_at).wait(score_at.phase, control)?;
            let d_output = state.d_output.slot(do_at);
            mma.issue(&[], move || {
                let mut region = region.access()?;
                let d_output = d_output.access()?;
                let mut gradients = gradients.access()?;
                matmul_into(
                    region.consume_activated()?.view(),
                    d_output.view(),
                    &mut gradients.d_value,
                    accumulate,
                );
                Ok(())
            })?;
            mma.issue(
                &[scores.dp_full(score_at), state.d_output.empty(do_at)],
                move || {
                    let value = value.access()?;
                    let d_output = d_output.access()?;
                    let mut region = region.access()?;
                    matmul_into(
                        value.view(),
                        d_output.t(),
                        region.write_score_grad()?,
                        false,
                    );
                    Ok(())
                },
            )?;

            let ds_at = ds_counter.next();
            state.d_scores.consumer_wait(ds_at, control)?;
            let d_scores = state.d_scores.slot(ds_at);
            mma.issue(&[state.query.empty(q_at)], move || {
                let d_scores = d_scores.access()?;
                let query = query.access()?;
                let mut gradients = gradients.access()?;
                matmul_into(
                    d_scores.view(),
                    query.view(),
                    &mut gradients.d_key,
                    accumulate,
                );
                Ok(())
            })?;

            let dq_at = dq_counter.next();
            state.d_query.producer_acquire(dq_at, control)?;
            let d_query = state.d_query.slot(dq_at);
            mma.issue(
                &[state.d_query.full(dq_at), state.d_scores.empty(ds_at)],
                move || {
                    let d_scores = d_scores.access()?;
                    let key = key.access()?;
                    let mut d_query = d_query.access()?;
                    matmul_into(d_scores.t(), key.view(), &mut d_query, false);
                    Ok(())
                },
            )?;
        }

        mma.commit(&[
            state.d_key_value.full(dkv_at),
            state.key.empty(kv_at),
            state.value.empty(kv_at),
        ])?;
    }
    Ok(())
}
