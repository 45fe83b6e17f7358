use serde::{Deserialize, Serialize};

use crate::{Activation, DataType};

/// Per-call knobs of the attention operator.
#[derive(Debug, Serialize, Deserialize, PartialEq, Copy, Clone)]
#[serde(default)]
pub struct AttentionParams {
    pub activation: Activation,
    pub causal: bool,
    /// Keys farther than this many rows from the query are masked out.
    pub window_size: Option<usize>,
    pub qk_scale: f32,
    pub data_type: DataType,
}

impl Default for AttentionParams {
    fn default() -> Self {
        Self {
            activation: Activation::FastGelu,
            causal: false,
            window_size: None,
            qk_scale: 1.0,
            data_type: DataType::BF16,
        }
    }
}

impl AttentionParams {
    /// Whether the score at (`query`, `key`), both relative to the start of
    /// their sequences, takes part in the attention.
    pub fn is_visible(
        &self,
        query: usize,
        key: usize,
    ) -> bool {
        if self.causal && key > query {
            return false;
        }
        match self.window_size {
            Some(window_size) => query.abs_diff(key) <= window_size,
            None => true,
        }
    }
}
