use gdpa::{
    AttentionParams, BackwardConfig, DataType, DeviceLimits, ForwardConfig,
    GdpaError, GdpaInputs, GdpaKernel, Gradients, reference_backward,
    reference_forward,
};
use itertools::iproduct;
use log::warn;
use ndarray::Array3;

use super::{
    Accuracy, AttentionShape, BoundBackend, Mode, Operator, shape::builtin_shapes,
    visible_pairs,
};
use crate::BenchmarkError;

const REFERENCE: &str = "reference";

#[derive(Debug, Clone, Copy)]
enum Variant {
    Reference,
    Kernel {
        pingpong: bool,
        merge_epilogue: bool,
        sort_by_seq_length: bool,
    },
}

const FORWARD_BACKENDS: [(&str, Variant); 4] = [
    (REFERENCE, Variant::Reference),
    (
        "warp_specialized",
        Variant::Kernel {
            pingpong: false,
            merge_epilogue: false,
            sort_by_seq_length: false,
        },
    ),
    (
        "warp_specialized_pingpong",
        Variant::Kernel {
            pingpong: true,
            merge_epilogue: false,
            sort_by_seq_length: false,
        },
    ),
    (
        "warp_specialized_merge_epilogue",
        Variant::Kernel {
            pingpong: false,
            merge_epilogue: true,
            sort_by_seq_length: false,
        },
    ),
];

const BACKWARD_BACKENDS: [(&str, Variant); 3] = [
    (REFERENCE, Variant::Reference),
    (
        "warp_specialized",
        Variant::Kernel {
            pingpong: false,
            merge_epilogue: false,
            sort_by_seq_length: false,
        },
    ),
    (
        "warp_specialized_sorted",
        Variant::Kernel {
            pingpong: false,
            merge_epilogue: false,
            sort_by_seq_length: true,
        },
    ),
];

/// Materialized inputs of one attention sweep point.
pub struct AttentionInput {
    pub shape: AttentionShape,
    pub inputs: GdpaInputs,
    pub d_output: Array3<f32>,
}

/// What one call of an attention backend produces.
#[derive(Debug, Clone)]
pub enum AttentionOutput {
    Forward(Array3<f32>),
    Backward(Gradients),
}

/// Generalized dot-product attention: the warp-specialized kernels against
/// the dense reference.
pub struct GdpaOperator {
    mode: Mode,
    params: AttentionParams,
    limits: DeviceLimits,
}

impl GdpaOperator {
    fn variants(&self) -> &'static [(&'static str, Variant)] {
        match self.mode {
            Mode::Forward => &FORWARD_BACKENDS,
            Mode::Backward => &BACKWARD_BACKENDS,
        }
    }

    /// First candidate, largest tiles first, that fits the device for
    /// `shape`. Rejected candidates are logged.
    fn forward_config(
        &self,
        backend: &str,
        shape: &AttentionShape,
        pingpong: bool,
        merge_epilogue: bool,
        sort_by_seq_length: bool,
    ) -> Option<ForwardConfig> {
        iproduct!([256, 128, 64], [128, 64], [3, 2])
            .map(|(block_m, block_n, num_buffers_kv)| ForwardConfig {
                block_m,
                block_n,
                num_buffers_kv,
                pingpong,
                merge_epilogue,
                sort_by_seq_length,
                ..ForwardConfig::default()
            })
            .find(|config| {
                match config.check_resources(
                    &self.limits,
                    shape.head_dim,
                    shape.head_dim_v,
                    self.params.data_type,
                ) {
                    Ok(_) => true,
                    Err(error) => {
                        warn!("Excluding {backend} candidate {config:?}: {error}");
                        false
                    },
                }
            })
    }

    fn backward_config(
        &self,
        backend: &str,
        shape: &AttentionShape,
        sort_by_seq_length: bool,
    ) -> Option<BackwardConfig> {
        iproduct!([128, 64], [128, 64], [2, 1])
            .map(|(block_n1, block_m1, num_buffers_tmem)| BackwardConfig {
                block_m1,
                block_n1,
                num_buffers_tmem,
                sort_by_seq_length,
                ..BackwardConfig::default()
            })
            .find(|config| {
                match config.check_resources(
                    &self.limits,
                    shape.head_dim,
                    shape.head_dim_v,
                    self.params.data_type,
                ) {
                    Ok(_) => true,
                    Err(error) => {
                        warn!("Excluding {backend} candidate {config:?}: {error}");
                        false
                    },
                }
            })
    }

    fn tolerances(&self) -> (f32, f32) {
        match self.params.data_type {
            DataType::F32 => (1e-3, 1e-3),
            DataType::BF16 | DataType::F16 => (5e-2, 5e-2),
        }
    }
}

impl Operator for GdpaOperator {
    const NAME: &'static str = "gdpa";

    type Shape = AttentionShape;
    type Params = AttentionParams;
    type Input = AttentionInput;
    type Output = AttentionOutput;

    fn new(
        mode: Mode,
        params: AttentionParams,
        limits: DeviceLimits,
    ) -> Result<Self, BenchmarkError> {
        Ok(Self {
            mode,
            params,
            limits,
        })
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn backends(&self) -> Vec<&'static str> {
        self.variants().iter().map(|(name, _)| *name).collect()
    }

    fn baseline(&self) -> &'static str {
        REFERENCE
    }

    fn builtin_shapes(&self) -> Vec<AttentionShape> {
        builtin_shapes()
    }

    fn prepare(
        &self,
        shape: &AttentionShape,
        seed: u64,
    ) -> Result<AttentionInput, BenchmarkError> {
        let (inputs, d_output) = shape.generate(self.params.data_type, seed);
        Ok(AttentionInput {
            shape: *shape,
            inputs,
            d_output,
        })
    }

    fn bind<'a>(
        &'a self,
        backend: &str,
        input: &'a AttentionInput,
    ) -> Result<BoundBackend<'a, AttentionOutput>, BenchmarkError> {
        let (name, variant) = self
            .variants()
            .iter()
            .find(|(name, _)| *name == backend)
            .copied()
            .ok_or_else(|| BenchmarkError::UnknownBackend {
                operator: Self::NAME,
                backend: backend.to_string(),
            })?;
        let params = &self.params;
        let failed = move |source: GdpaError| BenchmarkError::Backend {
            backend: name,
            source,
        };

        let Variant::Kernel {
            pingpong,
            merge_epilogue,
            sort_by_seq_length,
        } = variant
        else {
            return Ok(match self.mode {
                Mode::Forward => BoundBackend::new(name, move || {
                    reference_forward(&input.inputs, params)
                        .map(AttentionOutput::Forward)
                        .map_err(failed)
                }),
                Mode::Backward => BoundBackend::new(name, move || {
                    reference_backward(&input.inputs, &input.d_output, params)
                        .map(AttentionOutput::Backward)
                        .map_err(failed)
                }),
            });
        };

        let no_config = || BenchmarkError::NoValidConfig {
            backend: name,
            shape: input.shape.to_string(),
        };
        match self.mode {
            Mode::Forward => {
                let config = self
                    .forward_config(
                        name,
                        &input.shape,
                        pingpong,
                        merge_epilogue,
                        sort_by_seq_length,
                    )
                    .ok_or_else(no_config)?;
                let kernel =
                    GdpaKernel::new(self.limits, config, BackwardConfig::default())
                        .map_err(failed)?;
                Ok(BoundBackend::new(name, move || {
                    kernel
                        .forward(&input.inputs, params)
                        .map(AttentionOutput::Forward)
                        .map_err(failed)
                })
                .with_config(&config))
            },
            Mode::Backward => {
                let config = self
                    .backward_config(name, &input.shape, sort_by_seq_length)
                    .ok_or_else(no_config)?;
                let kernel =
                    GdpaKernel::new(self.limits, ForwardConfig::default(), config)
                        .map_err(failed)?;
                Ok(BoundBackend::new(name, move || {
                    kernel
                        .backward(&input.inputs, &input.d_output, params)
                        .map(AttentionOutput::Backward)
                        .map_err(failed)
                })
                .with_config(&config))
            },
        }
    }

    fn flops(
        &self,
        input: &AttentionInput,
    ) -> Option<f64> {
        let pairs =
            visible_pairs(&input.inputs, input.shape.heads, &self.params) as f64;
        let head_dim = input.shape.head_dim as f64;
        let head_dim_v = input.shape.head_dim_v as f64;
        Some(match self.mode {
            // Q·Kᵀ and P·V.
            Mode::Forward => 2.0 * pairs * (head_dim + head_dim_v),
            // K·Qᵀ, dS·Q and dSᵀ·K over head_dim; Pᵀ·dO and V·dOᵀ over head_dim_v.
            Mode::Backward => 2.0 * pairs * (3.0 * head_dim + 2.0 * head_dim_v),
        })
    }

    fn bytes(
        &self,
        input: &AttentionInput,
    ) -> Option<f64> {
        let inputs = &input.inputs;
        let elements = inputs.query.len() + inputs.key.len() + inputs.value.len();
        // Output in forward; dO, dQ, dK and dV in backward.
        let elements = match self.mode {
            Mode::Forward => elements + input.d_output.len(),
            Mode::Backward => 2 * elements + input.d_output.len(),
        };
        Some((elements * self.params.data_type.size_in_bytes()) as f64)
    }

    fn check_accuracy(
        &self,
        actual: &AttentionOutput,
        expected: &AttentionOutput,
    ) -> Accuracy {
        let (rtol, atol) = self.tolerances();
        let compare = |actual: &Array3<f32>, expected: &Array3<f32>| {
            Accuracy::compare(actual.view(), expected.view(), rtol, atol)
        };
        match (actual, expected) {
            (AttentionOutput::Forward(actual), AttentionOutput::Forward(expected)) => {
                compare(actual, expected)
            },
            (AttentionOutput::Backward(actual), AttentionOutput::Backward(expected)) => {
                compare(&actual.d_query, &expected.d_query)
                    .merge(compare(&actual.d_key, &expected.d_key))
                    .merge(compare(&actual.d_value, &expected.d_value))
            },
            _ => Accuracy::MISMATCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator(mode: Mode) -> GdpaOperator {
        GdpaOperator::new(
            mode,
            AttentionParams {
                data_type: DataType::F32,
                ..AttentionParams::default()
            },
            DeviceLimits::blackwell().with_multiprocessor_count(2),
        )
        .unwrap()
    }

    #[test]
    fn test_backend_lists() {
        assert_eq!(
            operator(Mode::Forward).backends(),
            vec![
                "reference",
                "warp_specialized",
                "warp_specialized_pingpong",
                "warp_specialized_merge_epilogue"
            ]
        );
        assert_eq!(operator(Mode::Backward).backends().len(), 3);
    }

    #[test]
    fn test_largest_fitting_candidate_is_selected() {
        let operator = operator(Mode::Forward);
        let shape = AttentionShape::dense(1, 1, 64, 128);
        let config = operator
            .forward_config("warp_specialized", &shape, false, false, false)
            .unwrap();
        assert_eq!(
            (config.block_m, config.block_n, config.num_buffers_kv),
            (128, 64, 3)
        );

        let too_wide = AttentionShape::dense(1, 1, 64, 256);
        assert!(
            operator
                .forward_config("warp_specialized", &too_wide, false, false, false)
                .is_none()
        );
    }

    #[test]
    fn test_unknown_backend() {
        let operator = operator(Mode::Forward);
        let input = operator
            .prepare(&AttentionShape::dense(1, 1, 8, 16), 0)
            .unwrap();
        assert!(matches!(
            operator.bind("triton", &input),
            Err(BenchmarkError::UnknownBackend { .. })
        ));
    }

    #[test]
    fn test_kernel_backends_agree_with_reference() {
        for mode in [Mode::Forward, Mode::Backward] {
            let operator = operator(mode);
            let input = operator
                .prepare(
                    &AttentionShape {
                        ragged: true,
                        ..AttentionShape::dense(2, 2, 48, 32)
                    },
                    3,
                )
                .unwrap();
            let baseline = operator.bind(operator.baseline(), &input).unwrap();
            let expected = (baseline.run)().unwrap();
            for backend in operator.backends() {
                let bound = operator.bind(backend, &input).unwrap();
                let actual = (bound.run)().unwrap();
                let accuracy = operator.check_accuracy(&actual, &expected);
                assert!(accuracy.passed, "{backend}: {accuracy:?}");
            }
        }
    }

    #[test]
    fn test_traffic_counts_every_tensor() {
        let shape = AttentionShape::dense(1, 2, 16, 8);
        let forward = operator(Mode::Forward);
        let input = forward.prepare(&shape, 0).unwrap();
        // Q, K, V and O, 16 x 2 x 8 f32 values each.
        assert_eq!(forward.bytes(&input), Some((4 * 256 * 4) as f64));
        let backward = operator(Mode::Backward);
        assert_eq!(backward.bytes(&input), Some((7 * 256 * 4) as f64));
    }
}
