use crate::{
    ForwardConfig,
    memory::{Pipeline, ScoreBuffer, SharedSlot, Tile, zero_tile},
    sync::{BufferPhase, MBarrier},
};

/// Score regions of one query half with their two hand-over barriers.
///
/// There is no empty barrier: the matrix engine consumes `P` in issue order
/// before the next `Q·Kᵀ` lands in the same region (see the matrix partition).
pub struct ScoreChannel {
    slots: Vec<SharedSlot<ScoreBuffer>>,
    qk_full: Vec<MBarrier>,
    p_ready: Vec<MBarrier>,
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
}

/// On-chip state of one persistent unit running the forward pass.
pub struct ForwardUnit {
    /// Query halves, one per activation partition.
    pub query: [Pipeline<Tile>; 2],
    /// Shared key/value ring; K and V of one step occupy consecutive slots.
    pub key_value: Pipeline<Tile>,
    pub scores: [ScoreChannel; 2],
    /// Output accumulators; full is committed once per tile after the last
    /// `P·V`, empty is released by whoever stores the tile.
    pub output: [Pipeline<Tile>; 2],
    pub output_staging: [Pipeline<Tile>; 2],
    /// Turn barriers of the ping-pong schedule, indexed by the half that waits.
    pub turns: [MBarrier; 2],
    /// Halves in the order they entered the activation section.
    #[cfg(test)]
    pub section_trace: std::sync::Mutex<Vec<usize>>,
}

impl ForwardUnit {
    pub fn new(
        unit: usize,
        config: &ForwardConfig,
        head_dim: usize,
        head_dim_v: usize,
    ) -> Self {
        let half = config.half_block_m();
        let kv_width = head_dim.max(head_dim_v);
        let name = |value: &str| format!("unit{unit}.{value}");
        Self {
            query: [0, 1].map(|h| {
                Pipeline::new(&name(&format!("q{h}")), config.num_buffers_q, || {
                    zero_tile(half, head_dim)
                })
            }),
            key_value: Pipeline::new(&name("kv"), config.num_buffers_kv, || {
                zero_tile(config.block_n, kv_width)
            }),
            scores: [0, 1].map(|h| {
                ScoreChannel::new(
                    &name(&format!("qk{h}")),
                    config.num_buffers_qk,
                    half,
                    config.block_n,
                )
            }),
            output: [0, 1].map(|h| {
                Pipeline::new(&name(&format!("o{h}")), config.num_buffers_o, || {
                    zero_tile(half, head_dim_v)
                })
            }),
            output_staging: [0, 1].map(|h| {
                Pipeline::new(&name(&format!("o{h}_smem")), 1, || {
                    zero_tile(half, head_dim_v)
                })
            }),
            turns: [0, 1].map(|h| MBarrier::new(name(&format!("pingpong{h}")), 1)),
            #[cfg(test)]
            section_trace: std::sync::Mutex::new(Vec::new()),
        }
    }
}
