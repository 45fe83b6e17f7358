use std::{fmt, sync::Mutex};

use gdpa::{DataType, DeviceLimits};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Axis, Zip};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use super::{
    Accuracy, BoundBackend, Mode, Operator, for_each_strided, standard_normal,
};
use crate::BenchmarkError;

const BASELINE: &str = "ndarray_layer_norm";
const BACKENDS: [&str; 3] = [BASELINE, "fused_layer_norm", "threaded_layer_norm"];

/// `[m, n]` input normalized over its last dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormShape {
    pub m: usize,
    pub n: usize,
}

impl fmt::Display for NormShape {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "M={} N={}", self.m, self.n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerNormParams {
    pub data_type: DataType,
    pub eps: f32,
}

impl Default for LayerNormParams {
    fn default() -> Self {
        Self {
            data_type: DataType::F32,
            eps: 1e-5,
        }
    }
}

pub struct NormInput {
    pub shape: NormShape,
    pub x: Array2<f32>,
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    /// Output gradient of backward runs.
    pub d_output: Array2<f32>,
}

impl NormInput {
    /// `x = -2.3 + 0.5 * N(0, 1)`, weight and bias uniform in `[0, 1)`,
    /// `dy = 0.1 * N(0, 1)`; all rounded to `data_type`.
    pub(super) fn generate(
        shape: &NormShape,
        data_type: DataType,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((shape.m, shape.n), |_| {
            data_type.quantize(-2.3 + 0.5 * standard_normal(&mut rng))
        });
        let weight =
            Array1::from_shape_fn(shape.n, |_| data_type.quantize(rng.random::<f32>()));
        let bias =
            Array1::from_shape_fn(shape.n, |_| data_type.quantize(rng.random::<f32>()));
        let d_output = Array2::from_shape_fn((shape.m, shape.n), |_| {
            data_type.quantize(0.1 * standard_normal(&mut rng))
        });
        Self {
            shape: *shape,
            x,
            weight,
            bias,
            d_output,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LayerNormOutput {
    Forward(Array2<f32>),
    Backward {
        d_x: Array2<f32>,
        d_weight: Array1<f32>,
        d_bias: Array1<f32>,
    },
}

/// Layer normalization with an affine transform, forward and backward.
pub struct LayerNormOperator {
    mode: Mode,
    params: LayerNormParams,
    units: usize,
}

impl Operator for LayerNormOperator {
    const NAME: &'static str = "layer_norm";

    type Shape = NormShape;
    type Params = LayerNormParams;
    type Input = NormInput;
    type Output = LayerNormOutput;

    fn new(
        mode: Mode,
        params: LayerNormParams,
        limits: DeviceLimits,
    ) -> Result<Self, BenchmarkError> {
        Ok(Self {
            mode,
            params,
            units: limits.multiprocessor_count.max(1),
        })
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn backends(&self) -> Vec<&'static str> {
        BACKENDS.to_vec()
    }

    fn baseline(&self) -> &'static str {
        BASELINE
    }

    fn builtin_shapes(&self) -> Vec<NormShape> {
        (2..=8)
            .map(|step| NormShape {
                m: 1024,
                n: 512 * step,
            })
            .collect()
    }

    fn prepare(
        &self,
        shape: &NormShape,
        seed: u64,
    ) -> Result<NormInput, BenchmarkError> {
        if shape.n == 0 {
            return Err(BenchmarkError::InvalidShape {
                operator: Self::NAME,
                reason: "cannot normalize over an empty dimension".to_string(),
            });
        }
        Ok(NormInput::generate(shape, self.params.data_type, seed))
    }

    fn bind<'a>(
        &'a self,
        backend: &str,
        input: &'a NormInput,
    ) -> Result<BoundBackend<'a, LayerNormOutput>, BenchmarkError> {
        let name = BACKENDS
            .into_iter()
            .find(|name| *name == backend)
            .ok_or_else(|| BenchmarkError::UnknownBackend {
                operator: Self::NAME,
                backend: backend.to_string(),
            })?;
        let eps = self.params.eps;
        let units = self.units;
        Ok(match (self.mode, name) {
            (Mode::Forward, BASELINE) => BoundBackend::new(name, move || {
                Ok(LayerNormOutput::Forward(reference_forward(input, eps)))
            }),
            (Mode::Forward, "fused_layer_norm") => BoundBackend::new(name, move || {
                Ok(LayerNormOutput::Forward(fused_forward(input, eps, 1)))
            }),
            (Mode::Forward, _) => BoundBackend::new(name, move || {
                Ok(LayerNormOutput::Forward(fused_forward(input, eps, units)))
            }),
            (Mode::Backward, BASELINE) => BoundBackend::new(name, move || {
                Ok(reference_backward(input, eps))
            }),
            (Mode::Backward, "fused_layer_norm") => BoundBackend::new(name, move || {
                Ok(fused_backward(input, eps, 1))
            }),
            (Mode::Backward, _) => BoundBackend::new(name, move || {
                Ok(fused_backward(input, eps, units))
            }),
        })
    }

    fn flops(
        &self,
        _input: &NormInput,
    ) -> Option<f64> {
        None
    }

    /// Multiples of the input size: read x and write y forward; read x and
    /// dy and write dx backward.
    fn bytes(
        &self,
        input: &NormInput,
    ) -> Option<f64> {
        let passes = match self.mode {
            Mode::Forward => 2,
            Mode::Backward => 3,
        };
        Some((passes * input.x.len() * self.params.data_type.size_in_bytes()) as f64)
    }

    fn check_accuracy(
        &self,
        actual: &LayerNormOutput,
        expected: &LayerNormOutput,
    ) -> Accuracy {
        const RTOL: f32 = 1e-5;
        const ATOL: f32 = 5e-3;
        match (actual, expected) {
            (LayerNormOutput::Forward(actual), LayerNormOutput::Forward(expected)) => {
                Accuracy::compare(actual.view(), expected.view(), RTOL, ATOL)
            },
            (
                LayerNormOutput::Backward {
                    d_x,
                    d_weight,
                    d_bias,
                },
                LayerNormOutput::Backward {
                    d_x: expected_d_x,
                    d_weight: expected_d_weight,
                    d_bias: expected_d_bias,
                },
            ) => Accuracy::compare(d_x.view(), expected_d_x.view(), RTOL, ATOL)
                .merge(Accuracy::compare(
                    d_weight.view(),
                    expected_d_weight.view(),
                    RTOL,
                    ATOL,
                ))
                .merge(Accuracy::compare(
                    d_bias.view(),
                    expected_d_bias.view(),
                    RTOL,
                    ATOL,
                )),
            _ => Accuracy::MISMATCH,
        }
    }
}

/// Row statistics with separate mean and variance passes.
pub(super) fn reference_statistics(
    x: &Array2<f32>,
    eps: f32,
) -> (Array1<f32>, Array1<f32>) {
    let n = x.ncols() as f32;
    let mean = x.sum_axis(Axis(1)) / n;
    let centered = x - &mean.view().insert_axis(Axis(1));
    let variance = centered.mapv(|value| value * value).sum_axis(Axis(1)) / n;
    let rstd = variance.mapv(|variance| 1.0 / (variance + eps).sqrt());
    (mean, rstd)
}

pub(super) fn reference_forward(
    input: &NormInput,
    eps: f32,
) -> Array2<f32> {
    let (mean, rstd) = reference_statistics(&input.x, eps);
    let normalized = (&input.x - &mean.insert_axis(Axis(1))) * &rstd.insert_axis(Axis(1));
    normalized * &input.weight + &input.bias
}

fn reference_backward(
    input: &NormInput,
    eps: f32,
) -> LayerNormOutput {
    let (mean, rstd) = reference_statistics(&input.x, eps);
    let rstd = rstd.insert_axis(Axis(1));
    let x_hat = (&input.x - &mean.insert_axis(Axis(1))) * &rstd;
    let d_bias = input.d_output.sum_axis(Axis(0));
    let d_weight = (&input.d_output * &x_hat).sum_axis(Axis(0));
    let d_x_hat = &input.d_output * &input.weight;
    let n = input.shape.n as f32;
    let mean_d_x_hat = (d_x_hat.sum_axis(Axis(1)) / n).insert_axis(Axis(1));
    let mean_projection = ((&d_x_hat * &x_hat).sum_axis(Axis(1)) / n).insert_axis(Axis(1));
    let d_x = (d_x_hat - &mean_d_x_hat - x_hat * &mean_projection) * &rstd;
    LayerNormOutput::Backward {
        d_x,
        d_weight,
        d_bias,
    }
}

/// Mean and inverse standard deviation from one sum/sum-of-squares sweep.
fn row_statistics(
    row: ArrayView1<f32>,
    eps: f32,
) -> (f32, f32) {
    let n = row.len() as f32;
    let (sum, sum_squares) = row
        .iter()
        .fold((0.0f32, 0.0f32), |(sum, squares), value| {
            (sum + value, squares + value * value)
        });
    let mean = sum / n;
    let variance = (sum_squares / n - mean * mean).max(0.0);
    (mean, 1.0 / (variance + eps).sqrt())
}

fn fused_forward(
    input: &NormInput,
    eps: f32,
    units: usize,
) -> Array2<f32> {
    let mut output = Array2::zeros(input.x.raw_dim());
    let rows = input.x.rows().into_iter().zip(output.rows_mut());
    for_each_strided(rows, units, |(row, mut out): (ArrayView1<f32>, ArrayViewMut1<f32>)| {
        let (mean, rstd) = row_statistics(row, eps);
        Zip::from(&mut out)
            .and(&row)
            .and(&input.weight)
            .and(&input.bias)
            .for_each(|out, &x, &weight, &bias| {
                *out = (x - mean) * rstd * weight + bias;
            });
    });
    output
}

/// Row-parallel backward; weight and bias gradients are accumulated per
/// unit and reduced once at the end.
fn fused_backward(
    input: &NormInput,
    eps: f32,
    units: usize,
) -> LayerNormOutput {
    let n = input.shape.n;
    let mut d_x = Array2::zeros(input.x.raw_dim());
    let partials = Mutex::new((Array1::<f32>::zeros(n), Array1::<f32>::zeros(n)));
    let row_count = input.shape.m;
    let units = units.max(1).min(row_count.max(1));
    let chunk = row_count.div_ceil(units).max(1);

    let blocks = d_x.axis_chunks_iter_mut(Axis(0), chunk).enumerate();
    for_each_strided(blocks, units, |(index, mut block)| {
        let mut d_weight = Array1::<f32>::zeros(n);
        let mut d_bias = Array1::<f32>::zeros(n);
        let mut d_x_hat = Array1::<f32>::zeros(n);
        for (offset, mut d_x_row) in block.rows_mut().into_iter().enumerate() {
            let row = index * chunk + offset;
            let x = input.x.row(row);
            let dy = input.d_output.row(row);
            let (mean, rstd) = row_statistics(x, eps);

            let mut sum_d_x_hat = 0.0f32;
            let mut sum_projection = 0.0f32;
            for column in 0..n {
                let x_hat = (x[column] - mean) * rstd;
                let value = dy[column] * input.weight[column];
                d_x_hat[column] = value;
                sum_d_x_hat += value;
                sum_projection += value * x_hat;
                d_weight[column] += dy[column] * x_hat;
                d_bias[column] += dy[column];
            }
            let mean_d_x_hat = sum_d_x_hat / n as f32;
            let mean_projection = sum_projection / n as f32;
            for column in 0..n {
                let x_hat = (x[column] - mean) * rstd;
                d_x_row[column] =
                    (d_x_hat[column] - mean_d_x_hat - x_hat * mean_projection) * rstd;
            }
        }
        let mut partials = partials.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        partials.0 += &d_weight;
        partials.1 += &d_bias;
    });

    let (d_weight, d_bias) = partials
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    LayerNormOutput::Backward {
        d_x,
        d_weight,
        d_bias,
    }
}
