use std::fmt;

use gdpa::{AttentionParams, DataType, GdpaInputs, RaggedOffsets};
use itertools::iproduct;
use ndarray::Array3;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

/// One point of the attention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionShape {
    pub batch: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub max_seq_len_q: usize,
    pub max_seq_len_kv: usize,
    pub head_dim: usize,
    pub head_dim_v: usize,
    /// Draw every sequence length uniformly from `1..=max` instead of using
    /// the maximum for all of them.
    #[serde(default)]
    pub ragged: bool,
}

impl AttentionShape {
    pub fn dense(
        batch: usize,
        heads: usize,
        seq_len: usize,
        head_dim: usize,
    ) -> Self {
        Self {
            batch,
            heads,
            kv_heads: heads,
            max_seq_len_q: seq_len,
            max_seq_len_kv: seq_len,
            head_dim,
            head_dim_v: head_dim,
            ragged: false,
        }
    }

    /// Random inputs for this shape, rounded to `data_type`, plus an output
    /// gradient for backward runs.
    pub fn generate(
        &self,
        data_type: DataType,
        seed: u64,
    ) -> (GdpaInputs, Array3<f32>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let query_lengths = self.lengths(&mut rng, self.max_seq_len_q);
        let key_lengths = self.lengths(&mut rng, self.max_seq_len_kv);
        let query_offsets = RaggedOffsets::from_lengths(&query_lengths);
        let key_offsets = RaggedOffsets::from_lengths(&key_lengths);
        let total_q = query_offsets.total_rows();
        let total_kv = key_offsets.total_rows();

        let mut tensor = |shape: (usize, usize, usize)| {
            Array3::from_shape_fn(shape, |_| {
                data_type.quantize(rng.random_range(-0.5..0.5))
            })
        };
        let query = tensor((total_q, self.heads, self.head_dim));
        let key = tensor((total_kv, self.kv_heads, self.head_dim));
        let value = tensor((total_kv, self.kv_heads, self.head_dim_v));
        let d_output = tensor((total_q, self.heads, self.head_dim_v));

        let mut inputs =
            GdpaInputs::new(query, key, value, query_offsets, key_offsets);
        inputs.max_seq_len_q = self.max_seq_len_q;
        inputs.max_seq_len_kv = self.max_seq_len_kv;
        (inputs, d_output)
    }

    fn lengths(
        &self,
        rng: &mut StdRng,
        max_len: usize,
    ) -> Vec<usize> {
        (0..self.batch)
            .map(|_| {
                if self.ragged && max_len > 1 {
                    rng.random_range(1..=max_len)
                } else {
                    max_len
                }
            })
            .collect()
    }
}

impl fmt::Display for AttentionShape {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "B={} H={}/{} Lq={} Lkv={} D={}/{}{}",
            self.batch,
            self.heads,
            self.kv_heads,
            self.max_seq_len_q,
            self.max_seq_len_kv,
            self.head_dim,
            self.head_dim_v,
            if self.ragged {
                " ragged"
            } else {
                ""
            }
        )
    }
}

/// Default sweep over sequence length and batch.
pub(super) fn builtin_shapes() -> Vec<AttentionShape> {
    iproduct!([1, 4], [128, 512, 1024])
        .map(|(batch, seq_len)| AttentionShape {
            ragged: batch > 1,
            ..AttentionShape::dense(batch, 4, seq_len, 128)
        })
        .collect()
}

/// Number of (query, key) pairs whose score is visible, summed over every
/// sequence and head.
pub fn visible_pairs(
    inputs: &GdpaInputs,
    heads: usize,
    params: &AttentionParams,
) -> u64 {
    let batch = inputs.query_offsets.batch_size();
    let mut pairs = 0u64;
    for index in 0..batch {
        let q_len = inputs.query_offsets.len(index).min(inputs.max_seq_len_q);
        let k_len = inputs.key_offsets.len(index).min(inputs.max_seq_len_kv);
        if k_len == 0 {
            continue;
        }
        for query in 0..q_len {
            let mut first = 0;
            let mut last = k_len - 1;
            if params.causal {
                last = last.min(query);
            }
            if let Some(window_size) = params.window_size {
                first = query.saturating_sub(window_size);
                last = last.min(query.saturating_add(window_size));
            }
            if first <= last {
                pairs += (last - first + 1) as u64;
            }
        }
    }
    pairs * heads as u64
}
