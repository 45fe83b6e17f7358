use ndarray::s;

use super::UnitContext;
use crate::{
    engine::MmaEngine,
    error::KernelError,
    memory::{ScoreBuffer, SharedSlot, Tile, matmul_into},
    sync::{BufferPhase, MBarrier, PhaseCounter},
};

/// `qk = q · kᵀ` into a score region.
fn issue_scores<'a>(
    mma: &MmaEngine<'a>,
    query: &'a SharedSlot<Tile>,
    key: &'a SharedSlot<Tile>,
    scores: &'a SharedSlot<ScoreBuffer>,
    head_dim: usize,
    completions: &[&'a MBarrier],
) -> Result<(), KernelError> {
    mma.issue(completions, move || {
        let query = query.access()?;
        let key = key.access()?;
        let mut scores = scores.access()?;
        matmul_into(
            query.view(),
            key.slice(s![.., ..head_dim]).reversed_axes(),
            scores.write_scores()?,
            false,
        );
        Ok(())
    })
}

/// `o (+)= p · v`, consuming the activated scores.
fn issue_output<'a>(
    mma: &MmaEngine<'a>,
    scores: &'a SharedSlot<ScoreBuffer>,
    value: &'a SharedSlot<Tile>,
    output: &'a SharedSlot<Tile>,
    head_dim_v: usize,
    accumulate: bool,
    completions: &[&'a MBarrier],
) -> Result<(), KernelError> {
    mma.issue(completions, move || {
        let mut scores = scores.access()?;
        let value = value.access()?;
        let mut output = output.access()?;
        matmul_into(
            scores.consume_activated()?.view(),
            value.slice(s![.., ..head_dim_v]),
            &mut output,
            accumulate,
        );
        Ok(())
    })
}

/// Matrix partition.
///
/// Per tile the issue order is software pipelined so that the activation of
/// one query half overlaps the matmuls of the other:
///
/// ```text
/// prologue  qk0(0) qk1(0)[K0 free] | o0 = p0(0)·V0
/// step j    qk0(j) | o1 (+)= p1(j-1)·V(j-1)[V(j-1) free] | qk1(j)[Kj free]
///           | o0 += p0(j)·Vj
/// epilogue  [Q free] [o0 full] | o1 (+)= p1(last)·V(last)[o1 full, V free]
/// ```
///
/// Score regions are written without an acquire: the `P` previously held by a
/// region was waited for by this partition and handed to the in-order engine
/// before the `Q·Kᵀ` that overwrites it. Output accumulators are only written
/// here within a tile, so they are acquired once per tile, not per step.
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
    let head_dim = launch.head_dim;
    let head_dim_v = launch.head_dim_v;
    let kv = &state.key_value;
    let [q0, q1] = &state.query;
    let [s0, s1] = &state.scores;
    let [o0, o1] = &state.output;

    let mut q_counter = PhaseCounter::new(config.num_buffers_q);
    let mut kv_counter = PhaseCounter::new(config.num_buffers_kv);
    let mut qk_counter = PhaseCounter::new(config.num_buffers_qk);
    let mut o_counter = PhaseCounter::new(config.num_buffers_o);

    for tile in launch.schedule.unit(context.unit, context.units) {
        let blocks =
            tile.key_blocks(config.block_m, config.block_n, launch.params).len();
        let q_at = q_counter.next();
        let o_at = o_counter.next();

        // Prologue: first key block.
        q0.consumer_wait(q_at, control)?;
        let k_at = kv_counter.next();
        kv.consumer_wait(k_at, control)?;
        let qk_at = qk_counter.next();
        issue_scores(
            &mma,
            q0.slot(q_at),
            kv.slot(k_at),
            s0.slot(qk_at),
            head_dim,
            &[s0.qk_full(qk_at)],
        )?;
        q1.consumer_wait(q_at, control)?;
        issue_scores(
            &mma,
            q1.slot(q_at),
            kv.slot(k_at),
            s1.slot(qk_at),
            head_dim,
            &[s1.qk_full(qk_at), kv.empty(k_at)],
        )?;

        let v_at = kv_counter.next();
        kv.consumer_wait(v_at, control)?;
        o0.producer_acquire(o_at, control)?;
        s0.p_ready(qk_at).wait(qk_at.phase, control)?;
        issue_output(
            &mma,
            s0.slot(qk_at),
            kv.slot(v_at),
            o0.slot(o_at),
            head_dim_v,
            false,
            &[],
        )?;

        let mut previous: (BufferPhase, BufferPhase) = (qk_at, v_at);
        for step in 1..blocks {
            let (previous_qk, previous_v) = previous;

            let k_at = kv_counter.next();
            kv.consumer_wait(k_at, control)?;
            let qk_at = qk_counter.next();
            issue_scores(
                &mma,
                q0.slot(q_at),
                kv.slot(k_at),
                s0.slot(qk_at),
                head_dim,
                &[s0.qk_full(qk_at)],
            )?;

            o1.empty(o_at).wait_if(o_at.producer_phase(), step == 1, control)?;
            s1.p_ready(previous_qk).wait(previous_qk.phase, control)?;
            issue_output(
                &mma,
                s1.slot(previous_qk),
                kv.slot(previous_v),
                o1.slot(o_at),
                head_dim_v,
                step > 1,
                &[kv.empty(previous_v)],
            )?;

            issue_scores(
                &mma,
                q1.slot(q_at),
                kv.slot(k_at),
                s1.slot(qk_at),
                head_dim,
                &[s1.qk_full(qk_at), kv.empty(k_at)],
            )?;

            let v_at = kv_counter.next();
            kv.consumer_wait(v_at, control)?;
            s0.p_ready(qk_at).wait(qk_at.phase, control)?;
            issue_output(
                &mma,
                s0.slot(qk_at),
                kv.slot(v_at),
                o0.slot(o_at),
                head_dim_v,
                true,
                &[],
            )?;

            previous = (qk_at, v_at);
        }

        // Epilogue: every matmul reading Q has been issued, o0 is final.
        let (last_qk, last_v) = previous;
        mma.commit(&[q0.empty(q_at), q1.empty(q_at)])?;
        mma.commit(&[o0.full(o_at)])?;
        o1.empty(o_at).wait_if(o_at.producer_phase(), blocks == 1, control)?;
        s1.p_ready(last_qk).wait(last_qk.phase, control)?;
        issue_output(
            &mma,
            s1.slot(last_qk),
            kv.slot(last_v),
            o1.slot(o_at),
            head_dim_v,
            blocks > 1,
            &[o1.full(o_at), kv.empty(last_v)],
        )?;
    }
    Ok(())
}
