pub mod backward;
pub mod forward;
mod launch;
pub mod mask;

use ndarray::Array3;

use crate::{
    AttentionParams, BackwardConfig, DeviceLimits, ForwardConfig,
    error::{GdpaError, RaggedError, ShapeError},
    memory::{GlobalTensor, TensorDescriptor},
    ragged::{RaggedOffsets, validate_sequence_index},
    scheduler::{TileAxis, TileSchedule},
    sync::LaunchControl,
};

/// Packed variable-length attention inputs.
///
/// `query` is `[total_q, heads, head_dim]`, `key` and `value` are
/// `[total_kv, kv_heads, head_dim]` and `[total_kv, kv_heads, head_dim_v]`.
/// Sequences longer than the maximum lengths are truncated.
#[derive(Debug, Clone)]
pub struct GdpaInputs {
    pub query: Array3<f32>,
    pub key: Array3<f32>,
    pub value: Array3<f32>,
    pub query_offsets: RaggedOffsets,
    pub key_offsets: RaggedOffsets,
    pub max_seq_len_q: usize,
    pub max_seq_len_kv: usize,
}

/// Dimensions shared by every tensor of a validated launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    pub batch: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub head_dim_v: usize,
    /// Query heads per key/value head.
    pub group_size: usize,
}

impl GdpaInputs {
    /// Inputs whose maximum sequence lengths are the longest sequences.
    pub fn new(
        query: Array3<f32>,
        key: Array3<f32>,
        value: Array3<f32>,
        query_offsets: RaggedOffsets,
        key_offsets: RaggedOffsets,
    ) -> Self {
        let max_seq_len_q = query_offsets.max_len();
        let max_seq_len_kv = key_offsets.max_len();
        Self {
            query,
            key,
            value,
            query_offsets,
            key_offsets,
            max_seq_len_q,
            max_seq_len_kv,
        }
    }

    pub fn validate(&self) -> Result<ProblemShape, GdpaError> {
        let (total_q, heads, head_dim) = self.query.dim();
        let (total_kv, kv_heads, key_dim) = self.key.dim();
        let (_, _, head_dim_v) = self.value.dim();
        if head_dim == 0 {
            return Err(ShapeError::ZeroHeadDim {
                tensor: "query",
            }
            .into());
        }
        if head_dim_v == 0 {
            return Err(ShapeError::ZeroHeadDim {
                tensor: "value",
            }
            .into());
        }
        if key_dim != head_dim {
            return Err(mismatch("key", &self.key, [total_kv, kv_heads, head_dim]).into());
        }
        expect_shape("value", &self.value, [total_kv, kv_heads, head_dim_v])?;
        if kv_heads == 0 || heads % kv_heads != 0 {
            return Err(ShapeError::HeadsNotDivisible {
                heads,
                kv_heads,
            }
            .into());
        }

        let batch = self.query_offsets.batch_size();
        if self.key_offsets.batch_size() != batch {
            return Err(RaggedError::BatchMismatch {
                query: batch,
                key: self.key_offsets.batch_size(),
            }
            .into());
        }
        self.query_offsets.validate_rows(total_q)?;
        self.key_offsets.validate_rows(total_kv)?;

        Ok(ProblemShape {
            batch,
            heads,
            kv_heads,
            head_dim,
            head_dim_v,
            group_size: heads / kv_heads,
        })
    }
}

fn mismatch(
    tensor: &'static str,
    array: &Array3<f32>,
    expected: [usize; 3],
) -> ShapeError {
    let (rows, heads, dim) = array.dim();
    ShapeError::Mismatch {
        tensor,
        actual: [rows, heads, dim],
        expected: format!("{expected:?}"),
    }
}

fn expect_shape(
    tensor: &'static str,
    array: &Array3<f32>,
    expected: [usize; 3],
) -> Result<(), ShapeError> {
    let (rows, heads, dim) = array.dim();
    if [rows, heads, dim] != expected {
        return Err(mismatch(tensor, array, expected));
    }
    Ok(())
}

/// Gradients of the attention output with respect to its three inputs, in
/// the layouts of the corresponding inputs.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub d_query: Array3<f32>,
    pub d_key: Array3<f32>,
    pub d_value: Array3<f32>,
}

/// A validated kernel pair bound to one device description.
#[derive(Debug, Clone)]
pub struct GdpaKernel {
    limits: DeviceLimits,
    forward_config: ForwardConfig,
    backward_config: BackwardConfig,
}

impl GdpaKernel {
    /// Rejects static configuration errors. Resource budgets depend on the
    /// head dimensions and are checked at every launch.
    pub fn new(
        limits: DeviceLimits,
        forward_config: ForwardConfig,
        backward_config: BackwardConfig,
    ) -> Result<Self, GdpaError> {
        limits.validate()?;
        forward_config.validate()?;
        backward_config.validate()?;
        Ok(Self {
            limits,
            forward_config,
            backward_config,
        })
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn forward_config(&self) -> &ForwardConfig {
        &self.forward_config
    }

    pub fn backward_config(&self) -> &BackwardConfig {
        &self.backward_config
    }

    /// Attention output `[total_q, heads, head_dim_v]`. Rows past
    /// `max_seq_len_q` within a sequence are left at zero.
    pub fn forward(
        &self,
        inputs: &GdpaInputs,
        params: &AttentionParams,
    ) -> Result<Array3<f32>, GdpaError> {
        let shape = inputs.validate()?;
        let config = &self.forward_config;
        let data_type = params.data_type;
        config.check_resources(
            &self.limits,
            shape.head_dim,
            shape.head_dim_v,
            data_type,
        )?;

        let seq_index = sequence_order(config.sort_by_seq_length, &inputs.query_offsets)?;
        let schedule = TileSchedule {
            axis: TileAxis::Query,
            block: config.block_m,
            inner_block: config.block_n,
            heads: shape.heads,
            max_seq_len_q: inputs.max_seq_len_q,
            max_seq_len_kv: inputs.max_seq_len_kv,
            query_offsets: &inputs.query_offsets,
            key_offsets: &inputs.key_offsets,
            seq_index: seq_index.as_deref(),
        };
        let units = schedule.grid_size(self.limits.multiprocessor_count);

        let output = GlobalTensor::zeros([
            inputs.query_offsets.total_rows(),
            shape.heads,
            shape.head_dim_v,
        ]);
        let launch = forward::ForwardLaunch {
            config,
            params,
            schedule,
            query: TensorDescriptor::new(inputs.query.view(), data_type),
            key: TensorDescriptor::new(inputs.key.view(), data_type),
            value: TensorDescriptor::new(inputs.value.view(), data_type),
            output: &output,
            head_dim: shape.head_dim,
            head_dim_v: shape.head_dim_v,
            group_size: shape.group_size,
        };
        log::debug!(
            "Forward launch: {} tiles on {} units, {:?}, {:?}",
            schedule.total_tiles(),
            units,
            shape,
            config
        );

        let control = LaunchControl::new(self.limits.watchdog_timeout());
        forward::run(&launch, units, &control);
        control.finish()?;
        Ok(output.into_array(data_type))
    }

    /// Recomputes the scores from `inputs` and back-propagates `d_output`
    /// (`[total_q, heads, head_dim_v]`).
    pub fn backward(
        &self,
        inputs: &GdpaInputs,
        d_output: &Array3<f32>,
        params: &AttentionParams,
    ) -> Result<Gradients, GdpaError> {
        let shape = inputs.validate()?;
        expect_shape(
            "d_output",
            d_output,
            [inputs.query_offsets.total_rows(), shape.heads, shape.head_dim_v],
        )?;
        let config = &self.backward_config;
        let data_type = params.data_type;
        config.check_resources(
            &self.limits,
            shape.head_dim,
            shape.head_dim_v,
            data_type,
        )?;

        let seq_index = sequence_order(config.sort_by_seq_length, &inputs.key_offsets)?;
        let schedule = TileSchedule {
            axis: TileAxis::Key,
            block: config.block_n1,
            inner_block: config.block_m1,
            heads: shape.heads,
            max_seq_len_q: inputs.max_seq_len_q,
            max_seq_len_kv: inputs.max_seq_len_kv,
            query_offsets: &inputs.query_offsets,
            key_offsets: &inputs.key_offsets,
            seq_index: seq_index.as_deref(),
        };
        let units = schedule.grid_size(self.limits.multiprocessor_count);

        let total_q = inputs.query_offsets.total_rows();
        let total_kv = inputs.key_offsets.total_rows();
        let d_query = GlobalTensor::zeros([total_q, shape.heads, shape.head_dim]);
        let d_key = GlobalTensor::zeros([total_kv, shape.kv_heads, shape.head_dim]);
        let d_value = GlobalTensor::zeros([total_kv, shape.kv_heads, shape.head_dim_v]);
        let launch = backward::BackwardLaunch {
            config,
            params,
            schedule,
            query: TensorDescriptor::new(inputs.query.view(), data_type),
            key: TensorDescriptor::new(inputs.key.view(), data_type),
            value: TensorDescriptor::new(inputs.value.view(), data_type),
            d_output: TensorDescriptor::new(d_output.view(), data_type),
            d_query: &d_query,
            d_key: &d_key,
            d_value: &d_value,
            head_dim: shape.head_dim,
            head_dim_v: shape.head_dim_v,
            group_size: shape.group_size,
        };
        log::debug!(
            "Backward launch: {} tiles on {} units, {:?}, {:?}",
            schedule.total_tiles(),
            units,
            shape,
            config
        );

        let control = LaunchControl::new(self.limits.watchdog_timeout());
        backward::run(&launch, units, &control);
        control.finish()?;
        Ok(Gradients {
            d_query: d_query.into_array(data_type),
            d_key: d_key.into_array(data_type),
            d_value: d_value.into_array(data_type),
        })
    }
}

fn sequence_order(
    sort_by_seq_length: bool,
    offsets: &RaggedOffsets,
) -> Result<Option<Vec<usize>>, GdpaError> {
    if !sort_by_seq_length {
        return Ok(None);
    }
    let order = offsets.longest_first();
    validate_sequence_index(&order, offsets.batch_size())?;
    Ok(Some(order))
}
