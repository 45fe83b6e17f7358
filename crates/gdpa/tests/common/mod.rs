#![allow(dead_code)]
use std::time::Duration;

use gdpa::{
    BackwardConfig, DataType, DeviceLimits, ForwardConfig, GdpaInputs, GdpaKernel,
    RaggedOffsets,
};
use ndarray::Array3;
use rand::{Rng, SeedableRng, rngs::StdRng};

pub const TEST_MULTIPROCESSORS: usize = 4;

pub fn test_limits() -> DeviceLimits {
    DeviceLimits::blackwell()
        .with_multiprocessor_count(TEST_MULTIPROCESSORS)
        .with_watchdog_timeout(Duration::from_secs(20))
}

pub fn kernel(
    forward_config: ForwardConfig,
    backward_config: BackwardConfig,
) -> GdpaKernel {
    GdpaKernel::new(test_limits(), forward_config, backward_config).unwrap()
}

/// Forward configuration with blocks small enough that short sequences span
/// several key blocks and tiles.
pub fn small_forward_config() -> ForwardConfig {
    ForwardConfig {
        block_m: 32,
        block_n: 16,
        ..ForwardConfig::default()
    }
}

pub fn small_backward_config() -> BackwardConfig {
    BackwardConfig {
        block_m1: 16,
        block_n1: 32,
        ..BackwardConfig::default()
    }
}

/// Values already representable in `data_type`, so the kernels and the f32
/// reference see identical inputs.
pub fn random_tensor(
    rng: &mut StdRng,
    shape: (usize, usize, usize),
    data_type: DataType,
) -> Array3<f32> {
    Array3::from_shape_fn(shape, |_| {
        data_type.quantize(rng.random_range(-0.5..0.5))
    })
}

pub struct Problem {
    pub inputs: GdpaInputs,
    pub d_output: Array3<f32>,
}

pub fn random_problem(
    query_lengths: &[usize],
    key_lengths: &[usize],
    heads: usize,
    kv_heads: usize,
    head_dim: usize,
    head_dim_v: usize,
    data_type: DataType,
    seed: u64,
) -> Problem {
    let mut rng = StdRng::seed_from_u64(seed);
    let query_offsets = RaggedOffsets::from_lengths(query_lengths);
    let key_offsets = RaggedOffsets::from_lengths(key_lengths);
    let total_q = query_offsets.total_rows();
    let total_kv = key_offsets.total_rows();

    let query = random_tensor(&mut rng, (total_q, heads, head_dim), data_type);
    let key = random_tensor(&mut rng, (total_kv, kv_heads, head_dim), data_type);
    let value = random_tensor(&mut rng, (total_kv, kv_heads, head_dim_v), data_type);
    let d_output =
        random_tensor(&mut rng, (total_q, heads, head_dim_v), data_type);
    Problem {
        inputs: GdpaInputs::new(query, key, value, query_offsets, key_offsets),
        d_output,
    }
}

pub fn assert_close(
    actual: &Array3<f32>,
    expected: &Array3<f32>,
    rtol: f32,
    atol: f32,
    name: &str,
) {
    assert_eq!(actual.dim(), expected.dim(), "{name}: shape mismatch");
    let mut max_diff = 0.0f32;
    for ((index, a), b) in actual.indexed_iter().zip(expected.iter()) {
        assert!(a.is_finite(), "{name}: non-finite value at {index:?}");
        let diff = (a - b).abs();
        max_diff = max_diff.max(diff);
        assert!(
            diff <= atol + rtol * b.abs(),
            "{name} differs at {index:?}: kernel {a}, reference {b}"
        );
    }
    println!("Max absolute difference ({name}): {max_diff}");
}
