use gdpa::{DataType, DeviceLimits};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::{
    Accuracy, BoundBackend, Mode, Operator, for_each_strided,
    layer_norm::{NormInput, NormShape, reference_statistics},
};
use crate::BenchmarkError;

const BASELINE: &str = "eager_layer_norm";
const BACKENDS: [&str; 4] = [BASELINE, "welford", "blocked_welford", "no_welford"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WelfordParams {
    pub data_type: DataType,
    pub eps: f32,
    /// Row segment each partial state of `blocked_welford` covers.
    pub block: usize,
}

impl Default for WelfordParams {
    fn default() -> Self {
        Self {
            data_type: DataType::BF16,
            eps: 1e-5,
            block: 256,
        }
    }
}

/// Normalized rows plus the statistics they were normalized with.
#[derive(Debug, Clone)]
pub struct WelfordOutput {
    pub output: Array2<f32>,
    pub mean: Array1<f32>,
    pub rstd: Array1<f32>,
}

/// Running count, mean and sum of squared deviations.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WelfordState {
    pub count: f32,
    pub mean: f32,
    pub m2: f32,
}

impl WelfordState {
    pub fn update(
        &mut self,
        value: f32,
    ) {
        self.count += 1.0;
        let delta = value - self.mean;
        self.mean += delta / self.count;
        self.m2 += delta * (value - self.mean);
    }

    /// Combines the states of two disjoint segments.
    pub fn merge(
        self,
        other: Self,
    ) -> Self {
        if other.count == 0.0 {
            return self;
        }
        if self.count == 0.0 {
            return other;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        Self {
            count,
            mean: self.mean + delta * other.count / count,
            m2: self.m2 + other.m2 + delta * delta * self.count * other.count / count,
        }
    }

    pub fn variance(&self) -> f32 {
        if self.count == 0.0 {
            0.0
        } else {
            self.m2 / self.count
        }
    }
}

/// Row statistics for layer normalization, computed several ways.
pub struct WelfordOperator {
    params: WelfordParams,
    units: usize,
}

impl Operator for WelfordOperator {
    const NAME: &'static str = "welford";

    type Shape = NormShape;
    type Params = WelfordParams;
    type Input = NormInput;
    type Output = WelfordOutput;

    fn new(
        mode: Mode,
        params: WelfordParams,
        limits: DeviceLimits,
    ) -> Result<Self, BenchmarkError> {
        if mode != Mode::Forward {
            return Err(BenchmarkError::UnsupportedMode {
                operator: Self::NAME,
                mode,
            });
        }
        if params.block == 0 {
            return Err(BenchmarkError::InvalidParams {
                operator: Self::NAME,
                reason: "block must be positive".to_string(),
            });
        }
        Ok(Self {
            params,
            units: limits.multiprocessor_count.max(1),
        })
    }

    fn mode(&self) -> Mode {
        Mode::Forward
    }

    fn backends(&self) -> Vec<&'static str> {
        BACKENDS.to_vec()
    }

    fn baseline(&self) -> &'static str {
        BASELINE
    }

    fn builtin_shapes(&self) -> Vec<NormShape> {
        [1024, 1536, 2048, 3072, 4096]
            .into_iter()
            .map(|n| NormShape {
                m: 2048,
                n,
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
    ) -> Result<BoundBackend<'a, WelfordOutput>, BenchmarkError> {
        let eps = self.params.eps;
        let units = self.units;
        let block = self.params.block;
        match backend {
            BASELINE => Ok(BoundBackend::new(BASELINE, move || {
                let (mean, rstd) = reference_statistics(&input.x, eps);
                Ok(normalize(input, mean, rstd))
            })),
            "welford" => Ok(BoundBackend::new("welford", move || {
                Ok(row_wise(input, units, |row| {
                    let mut state = WelfordState::default();
                    row.iter().for_each(|value| state.update(*value));
                    (state.mean, rstd(state.variance(), eps))
                }))
            })),
            "blocked_welford" => Ok(BoundBackend::new("blocked_welford", move || {
                Ok(row_wise(input, units, |row| {
                    let state = row
                        .axis_chunks_iter(Axis(0), block)
                        .map(|segment| {
                            let mut state = WelfordState::default();
                            segment.iter().for_each(|value| state.update(*value));
                            state
                        })
                        .fold(WelfordState::default(), WelfordState::merge);
                    (state.mean, rstd(state.variance(), eps))
                }))
            })
            .with_config(&serde_json::json!({ "block": block }))),
            "no_welford" => Ok(BoundBackend::new("no_welford", move || {
                Ok(row_wise(input, units, |row| {
                    let n = row.len() as f32;
                    let mean = row.sum() / n;
                    let mean_square = row.iter().map(|value| value * value).sum::<f32>() / n;
                    (mean, rstd((mean_square - mean * mean).max(0.0), eps))
                }))
            })),
            _ => Err(BenchmarkError::UnknownBackend {
                operator: Self::NAME,
                backend: backend.to_string(),
            }),
        }
    }

    fn flops(
        &self,
        _input: &NormInput,
    ) -> Option<f64> {
        None
    }

    fn bytes(
        &self,
        input: &NormInput,
    ) -> Option<f64> {
        Some((2 * input.x.len() * self.params.data_type.size_in_bytes()) as f64)
    }

    /// Only the normalized output is compared.
    fn check_accuracy(
        &self,
        actual: &WelfordOutput,
        expected: &WelfordOutput,
    ) -> Accuracy {
        Accuracy::compare(actual.output.view(), expected.output.view(), 1e-2, 1e-2)
    }
}

fn rstd(
    variance: f32,
    eps: f32,
) -> f32 {
    1.0 / (variance + eps).sqrt()
}

fn normalize(
    input: &NormInput,
    mean: Array1<f32>,
    rstd: Array1<f32>,
) -> WelfordOutput {
    let mut output = Array2::zeros(input.x.raw_dim());
    Zip::from(output.rows_mut())
        .and(input.x.rows())
        .and(&mean)
        .and(&rstd)
        .for_each(|out, row, &mean, &rstd| affine_row(out, row, input, mean, rstd));
    WelfordOutput {
        output,
        mean,
        rstd,
    }
}

fn affine_row(
    mut out: ArrayViewMut1<f32>,
    row: ArrayView1<f32>,
    input: &NormInput,
    mean: f32,
    rstd: f32,
) {
    Zip::from(&mut out)
        .and(&row)
        .and(&input.weight)
        .and(&input.bias)
        .for_each(|out, &x, &weight, &bias| *out = (x - mean) * rstd * weight + bias);
}

/// Normalizes every row with the statistics `statistics` derives for it,
/// rows spread over `units` workers.
fn row_wise(
    input: &NormInput,
    units: usize,
    statistics: impl Fn(ArrayView1<f32>) -> (f32, f32) + Sync,
) -> WelfordOutput {
    let rows = input.shape.m;
    let mut output = Array2::zeros(input.x.raw_dim());
    let mut mean = Array1::zeros(rows);
    let mut rstd = Array1::zeros(rows);
    let work = output
        .rows_mut()
        .into_iter()
        .zip(input.x.rows())
        .zip(mean.iter_mut().zip(rstd.iter_mut()));
    for_each_strided(work, units, |((out, row), (mean, rstd))| {
        let (row_mean, row_rstd) = statistics(row);
        *mean = row_mean;
        *rstd = row_rstd;
        affine_row(out, row, input, row_mean, row_rstd);
    });
    WelfordOutput {
        output,
        mean,
        rstd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator() -> WelfordOperator {
        WelfordOperator::new(
            Mode::Forward,
            WelfordParams {
                block: 24,
                ..WelfordParams::default()
            },
            DeviceLimits::default().with_multiprocessor_count(4),
        )
        .unwrap()
    }

    #[test]
    fn test_backends_agree_with_baseline() {
        let operator = operator();
        let input = operator
            .prepare(
                &NormShape {
                    m: 9,
                    n: 100,
                },
                2,
            )
            .unwrap();
        assert!(
            input
                .x
                .iter()
                .all(|value| DataType::BF16.quantize(*value) == *value)
        );
        let expected = (operator.bind(BASELINE, &input).unwrap().run)().unwrap();
        for backend in operator.backends() {
            let actual = (operator.bind(backend, &input).unwrap().run)().unwrap();
            let accuracy = operator.check_accuracy(&actual, &expected);
            assert!(accuracy.passed, "{backend}: {accuracy:?}");
            let statistics = Accuracy::compare(actual.mean.view(), expected.mean.view(), 1e-4, 1e-4);
            assert!(statistics.passed, "{backend} mean: {statistics:?}");
        }
    }

    #[test]
    fn test_merged_state_matches_single_pass() {
        let values: Vec<f32> = (0..50).map(|index| (index as f32 * 0.37).sin() - 2.0).collect();
        let mut single = WelfordState::default();
        values.iter().for_each(|value| single.update(*value));

        let (left, right) = values.split_at(17);
        let mut first = WelfordState::default();
        left.iter().for_each(|value| first.update(*value));
        let mut second = WelfordState::default();
        right.iter().for_each(|value| second.update(*value));
        let merged = first.merge(second);

        assert_eq!(merged.count, 50.0);
        assert!((merged.mean - single.mean).abs() < 1e-5);
        assert!((merged.variance() - single.variance()).abs() < 1e-5);

        let mean = values.iter().sum::<f32>() / 50.0;
        let variance = values.iter().map(|value| (value - mean).powi(2)).sum::<f32>() / 50.0;
        assert!((single.variance() - variance).abs() < 1e-5);
        assert_eq!(WelfordState::default().merge(single), single);
    }

    #[test]
    fn test_forward_only() {
        assert!(matches!(
            WelfordOperator::new(Mode::Backward, WelfordParams::default(), DeviceLimits::default()),
            Err(BenchmarkError::UnsupportedMode { .. })
        ));
        assert!(matches!(
            WelfordOperator::new(
                Mode::Forward,
                WelfordParams {
                    block: 0,
                    ..WelfordParams::default()
                },
                DeviceLimits::default()
            ),
            Err(BenchmarkError::InvalidParams { .. })
        ));
    }
}
