mod common;

use common::{random_problem, test_limits};
use gdpa::{
    AttentionParams, BackwardConfig, ConfigError, DataType, DeviceLimits,
    ForwardConfig, GdpaError, GdpaKernel, RaggedError, RaggedOffsets, ShapeError,
};
use ndarray::Array3;

fn default_kernel() -> GdpaKernel {
    GdpaKernel::new(test_limits(), ForwardConfig::default(), BackwardConfig::default())
        .unwrap()
}

#[test]
fn test_static_config_errors_are_rejected_at_construction() {
    let odd = ForwardConfig {
        block_m: 33,
        ..ForwardConfig::default()
    };
    assert!(matches!(
        GdpaKernel::new(test_limits(), odd, BackwardConfig::default()),
        Err(GdpaError::Config(ConfigError::OddBlockM(33)))
    ));

    let single_kv = ForwardConfig {
        num_buffers_kv: 1,
        ..ForwardConfig::default()
    };
    assert!(matches!(
        GdpaKernel::new(test_limits(), single_kv, BackwardConfig::default()),
        Err(GdpaError::Config(ConfigError::KeyValueRingTooSmall(1)))
    ));

    let not_multiple = BackwardConfig {
        block_m1: 48,
        block_n1: 64,
        ..BackwardConfig::default()
    };
    assert!(matches!(
        GdpaKernel::new(test_limits(), ForwardConfig::default(), not_multiple),
        Err(GdpaError::Config(ConfigError::BlockNotMultiple {
            block_m1: 48,
            block_n1: 64,
        }))
    ));

    let no_units = DeviceLimits::blackwell().with_multiprocessor_count(0);
    assert!(matches!(
        GdpaKernel::new(no_units, ForwardConfig::default(), BackwardConfig::default()),
        Err(GdpaError::Config(ConfigError::NoMultiprocessors))
    ));
}

#[test]
fn test_resource_exhaustion_is_reported_at_launch() {
    let config = ForwardConfig {
        num_buffers_kv: 8,
        ..ForwardConfig::default()
    };
    let kernel = GdpaKernel::new(test_limits(), config, BackwardConfig::default())
        .unwrap();
    let problem = random_problem(&[16], &[16], 1, 1, 128, 128, DataType::BF16, 1);
    match kernel.forward(&problem.inputs, &AttentionParams::default()) {
        Err(GdpaError::Config(error)) => assert!(error.is_resource_exhaustion()),
        other => panic!("Expected resource exhaustion, got {other:?}"),
    }
}

#[test]
fn test_tensor_memory_budget_is_enforced() {
    let config = BackwardConfig {
        num_buffers_tmem: 2,
        ..BackwardConfig::default()
    };
    let kernel = GdpaKernel::new(test_limits(), ForwardConfig::default(), config)
        .unwrap();
    let problem = random_problem(&[16], &[16], 1, 1, 128, 128, DataType::BF16, 2);
    let result = kernel.backward(
        &problem.inputs,
        &problem.d_output,
        &AttentionParams::default(),
    );
    assert!(matches!(
        result,
        Err(GdpaError::Config(ConfigError::TensorMemoryExceeded {
            required: 768,
            available: 512,
        }))
    ));
}

#[test]
fn test_offsets_must_cover_packed_rows() {
    let mut problem = random_problem(&[10, 10], &[10, 10], 1, 1, 32, 32, DataType::F32, 3);
    problem.inputs.query_offsets = RaggedOffsets::new(vec![0, 10, 19]).unwrap();
    assert!(matches!(
        default_kernel().forward(&problem.inputs, &AttentionParams::default()),
        Err(GdpaError::Ragged(RaggedError::RowCountMismatch {
            covered: 19,
            rows: 20,
        }))
    ));
}

#[test]
fn test_batch_sizes_must_agree() {
    let problem = random_problem(&[10, 10], &[20], 1, 1, 32, 32, DataType::F32, 4);
    assert!(matches!(
        default_kernel().forward(&problem.inputs, &AttentionParams::default()),
        Err(GdpaError::Ragged(RaggedError::BatchMismatch {
            query: 2,
            key: 1,
        }))
    ));
}

#[test]
fn test_heads_must_divide() {
    let mut problem = random_problem(&[8], &[8], 3, 3, 32, 32, DataType::F32, 5);
    problem.inputs.key = Array3::zeros((8, 2, 32));
    problem.inputs.value = Array3::zeros((8, 2, 32));
    assert!(matches!(
        default_kernel().forward(&problem.inputs, &AttentionParams::default()),
        Err(GdpaError::Shape(ShapeError::HeadsNotDivisible {
            heads: 3,
            kv_heads: 2,
        }))
    ));
}

#[test]
fn test_value_shape_must_match_key() {
    let mut problem = random_problem(&[8], &[8], 1, 1, 32, 32, DataType::F32, 6);
    problem.inputs.value = Array3::zeros((7, 1, 32));
    assert!(matches!(
        default_kernel().forward(&problem.inputs, &AttentionParams::default()),
        Err(GdpaError::Shape(ShapeError::Mismatch {
            tensor: "value",
            ..
        }))
    ));
}

#[test]
fn test_d_output_shape_is_checked() {
    let problem = random_problem(&[8], &[8], 2, 1, 32, 16, DataType::F32, 7);
    let d_output = Array3::zeros((8, 2, 32));
    assert!(matches!(
        default_kernel().backward(&problem.inputs, &d_output, &AttentionParams::default()),
        Err(GdpaError::Shape(ShapeError::Mismatch {
            tensor: "d_output",
            ..
        }))
    ));
}

#[test]
fn test_empty_batch_produces_empty_output() {
    let problem = random_problem(&[], &[], 1, 1, 32, 32, DataType::F32, 8);
    let output = default_kernel()
        .forward(&problem.inputs, &AttentionParams::default())
        .unwrap();
    assert_eq!(output.dim(), (0, 1, 32));
}
