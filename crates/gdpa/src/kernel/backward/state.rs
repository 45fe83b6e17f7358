use crate::{
    BackwardConfig,
    memory::{Pipeline, ScoreBuffer, SharedSlot, Tile, zero_tile},
    sync::{BufferPhase, MBarrier},
};

/// Transposed score regions. Each region carries `K·Qᵀ`, then `Pᵀ`, then
/// `dPᵀ` of one query block.
///
/// ```text
/// qk_full      mma engine  -> activation   raw scores landed
/// p_ready      activation  -> mma          Pᵀ written back
/// dp_full      mma engine  -> activation   dPᵀ landed over Pᵀ
/// score_empty  activation  -> mma          dPᵀ read, region reusable
/// ```
pub struct ScoreChannel {
    slots: Vec<SharedSlot<ScoreBuffer>>,
    qk_full: Vec<MBarrier>,
    p_ready: Vec<MBarrier>,
    dp_full: Vec<MBarrier>,
    score_empty: Vec<MBarrier>,
}

impl ScoreChannel {
    fn new(
        name: &str,
        buffers: usize,
        rows: usize,
        cols: usize,
    ) -> Self {
        Self {
            slots: (0..buffers)
                .map(|index| {
                    let label = format!("{name}[{index}]");
                    SharedSlot::new(label.clone(), ScoreBuffer::new(label, rows, cols))
                })
                .collect(),
            qk_full: MBarrier::array(&format!("{name}_full"), buffers, 1),
            p_ready: MBarrier::array(&format!("{name}_p_ready"), buffers, 1),
            dp_full: MBarrier::array(&format!("{name}_dp_full"), buffers, 1),
            score_empty: MBarrier::array(&format!("{name}_empty"), buffers, 1),
        }
    }

    pub fn slot(
        &self,
        at: BufferPhase,
    ) -> &SharedSlot<ScoreBuffer> {
        &self.slots[at.index]
    }

    pub fn qk_full(
        &self,
        at: BufferPhase,
    ) -> &MBarrier {
        &self.qk_full[at.index]
    }

    pub fn p_ready(
        &self,
        at: BufferPhase,
    ) -> &MBarrier {
        &self.p_ready[at.index]
    }

    pub fn dp_full(
        &self,
        at: BufferPhase,
    ) -> &MBarrier {
        &self.dp_full[at.index]
    }

    pub fn score_empty(
        &self,
        at: BufferPhase,
    ) -> &MBarrier {
        &self.score_empty[at.index]
    }
}

/// Key and value gradient accumulators of one key tile.
pub struct KeyValueGrad {
    pub d_key: Tile,
    pub d_value: Tile,
}

/// On-chip state of one persistent unit running the backward pass.
pub struct BackwardUnit {
    /// K and V stay resident for the whole tile and share one counter.
    pub key: Pipeline<Tile>,
    pub value: Pipeline<Tile>,
    pub query: Pipeline<Tile>,
    pub d_output: Pipeline<Tile>,
    pub scores: ScoreChannel,
    pub d_scores: Pipeline<Tile>,
    pub d_query: Pipeline<Tile>,
    pub d_key_value: Pipeline<KeyValueGrad>,
}

impl BackwardUnit {
    pub fn new(
        unit: usize,
        config: &BackwardConfig,
        head_dim: usize,
        head_dim_v: usize,
    ) -> Self {
        let block_m1 = config.block_m1;
        let block_n1 = config.block_n1;
        let name = |value: &str| format!("unit{unit}.{value}");
        Self {
            key: Pipeline::new(&name("k"), config.num_buffers_kv, || {
                zero_tile(block_n1, head_dim)
            }),
            value: Pipeline::new(&name("v"), config.num_buffers_kv, || {
                zero_tile(block_n1, head_dim_v)
            }),
            query: Pipeline::new(&name("q"), config.num_buffers_q, || {
                zero_tile(block_m1, head_dim)
            }),
            d_output: Pipeline::new(&name("do"), config.num_buffers_do, || {
                zero_tile(block_m1, head_dim_v)
            }),
            scores: ScoreChannel::new(
                &name("qkT"),
                config.num_buffers_tmem,
                block_n1,
                block_m1,
            ),
            d_scores: Pipeline::new(&name("dsT"), config.num_buffers_ds, || {
                zero_tile(block_n1, block_m1)
            }),
            d_query: Pipeline::new(&name("dq"), config.num_buffers_tmem, || {
                zero_tile(block_m1, head_dim)
            }),
            d_key_value: Pipeline::new(&name("dkv"), 1, || KeyValueGrad {
                d_key: zero_tile(block_n1, head_dim),
                d_value: zero_tile(block_n1, head_dim_v),
            }),
        }
    }
}
