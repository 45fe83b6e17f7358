use std::{fmt, sync::Mutex};

use gdpa::{DataType, DeviceLimits};
use itertools::iproduct;
use ndarray::{Array2, Axis, linalg::general_mat_mul, s};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use super::{
    Accuracy, BoundBackend, Mode, Operator, for_each_strided, standard_normal,
};
use crate::BenchmarkError;

const BASELINE: &str = "ndarray_addmm";
const BACKENDS: [&str; 4] = [BASELINE, "naive_addmm", "tiled_addmm", "split_k_addmm"];

/// `bias + mat1 · mat2` with `mat1: [m, k]` and `mat2: [k, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddmmShape {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    /// Broadcast a `[n]` bias over the rows instead of a full `[m, n]` one.
    #[serde(default)]
    pub bias_1d: bool,
}

impl fmt::Display for AddmmShape {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "M={} K={} N={} bias={}",
            self.m,
            self.k,
            self.n,
            if self.bias_1d {
                "1d"
            } else {
                "2d"
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddmmParams {
    pub data_type: DataType,
}

impl Default for AddmmParams {
    fn default() -> Self {
        Self {
            data_type: DataType::F16,
        }
    }
}

pub struct AddmmInput {
    pub shape: AddmmShape,
    /// `[1, n]` or `[m, n]`.
    pub bias: Array2<f32>,
    pub mat1: Array2<f32>,
    pub mat2: Array2<f32>,
}

impl AddmmInput {
    fn bias_rows(&self) -> Array2<f32> {
        let shape = (self.shape.m, self.shape.n);
        match self.bias.broadcast(shape) {
            Some(bias) => bias.to_owned(),
            None => Array2::zeros(shape),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct TileConfig {
    tile_m: usize,
    tile_n: usize,
}

/// Dense matrix multiply plus bias.
pub struct AddmmOperator {
    params: AddmmParams,
    units: usize,
}

impl AddmmOperator {
    /// Largest tiles that still give every unit a row block.
    fn tile_config(
        &self,
        shape: &AddmmShape,
    ) -> TileConfig {
        iproduct!([128, 64, 32, 16], [128, 64])
            .map(|(tile_m, tile_n)| TileConfig {
                tile_m,
                tile_n,
            })
            .find(|config| shape.m.div_ceil(config.tile_m) >= self.units)
            .unwrap_or(TileConfig {
                tile_m: 8,
                tile_n: 64,
            })
    }
}

impl Operator for AddmmOperator {
    const NAME: &'static str = "addmm";

    type Shape = AddmmShape;
    type Params = AddmmParams;
    type Input = AddmmInput;
    type Output = Array2<f32>;

    fn new(
        mode: Mode,
        params: AddmmParams,
        limits: DeviceLimits,
    ) -> Result<Self, BenchmarkError> {
        if mode != Mode::Forward {
            return Err(BenchmarkError::UnsupportedMode {
                operator: Self::NAME,
                mode,
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

    /// Tall skinny products, then a long reduction with tiny outputs.
    fn builtin_shapes(&self) -> Vec<AddmmShape> {
        let tall = iproduct!([1024, 2048], [false, true]).map(|(m, bias_1d)| AddmmShape {
            m,
            k: 768,
            n: 256,
            bias_1d,
        });
        let large_k = (6..=16).step_by(2).map(|exponent| AddmmShape {
            m: 13,
            k: 1 << exponent,
            n: 2,
            bias_1d: false,
        });
        tall.chain(large_k).collect()
    }

    fn prepare(
        &self,
        shape: &AddmmShape,
        seed: u64,
    ) -> Result<AddmmInput, BenchmarkError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data_type = self.params.data_type;
        let mut tensor = |rows: usize, columns: usize| {
            Array2::from_shape_fn((rows, columns), |_| {
                data_type.quantize(standard_normal(&mut rng))
            })
        };
        let bias_rows = if shape.bias_1d {
            1
        } else {
            shape.m
        };
        let bias = tensor(bias_rows, shape.n);
        let mat1 = tensor(shape.m, shape.k);
        let mat2 = tensor(shape.k, shape.n);
        Ok(AddmmInput {
            shape: *shape,
            bias,
            mat1,
            mat2,
        })
    }

    fn bind<'a>(
        &'a self,
        backend: &str,
        input: &'a AddmmInput,
    ) -> Result<BoundBackend<'a, Array2<f32>>, BenchmarkError> {
        let units = self.units;
        match backend {
            BASELINE => Ok(BoundBackend::new(BASELINE, move || {
                let mut output = input.bias_rows();
                general_mat_mul(1.0, &input.mat1, &input.mat2, 1.0, &mut output);
                Ok(output)
            })),
            "naive_addmm" => Ok(BoundBackend::new("naive_addmm", move || {
                Ok(naive_addmm(input))
            })),
            "tiled_addmm" => {
                let config = self.tile_config(&input.shape);
                Ok(BoundBackend::new("tiled_addmm", move || {
                    Ok(tiled_addmm(input, config, units))
                })
                .with_config(&config))
            },
            "split_k_addmm" => Ok(BoundBackend::new("split_k_addmm", move || {
                Ok(split_k_addmm(input, units))
            })),
            _ => Err(BenchmarkError::UnknownBackend {
                operator: Self::NAME,
                backend: backend.to_string(),
            }),
        }
    }

    fn flops(
        &self,
        input: &AddmmInput,
    ) -> Option<f64> {
        let AddmmShape {
            m,
            k,
            n,
            ..
        } = input.shape;
        Some((2 * m * k * n + m * n) as f64)
    }

    fn bytes(
        &self,
        input: &AddmmInput,
    ) -> Option<f64> {
        let shape = input.shape;
        let elements = input.bias.len() + input.mat1.len() + input.mat2.len()
            + shape.m * shape.n;
        Some((elements * self.params.data_type.size_in_bytes()) as f64)
    }

    fn check_accuracy(
        &self,
        actual: &Array2<f32>,
        expected: &Array2<f32>,
    ) -> Accuracy {
        Accuracy::compare(actual.view(), expected.view(), 0.5, 1e-5)
    }
}

fn naive_addmm(input: &AddmmInput) -> Array2<f32> {
    let mut output = input.bias_rows();
    for ((row, column), value) in output.indexed_iter_mut() {
        let mut sum = 0.0f32;
        for inner in 0..input.shape.k {
            sum += input.mat1[[row, inner]] * input.mat2[[inner, column]];
        }
        *value += sum;
    }
    output
}

/// Row blocks are dealt out to the units; each walks its block in
/// `tile_n`-wide column tiles.
fn tiled_addmm(
    input: &AddmmInput,
    config: TileConfig,
    units: usize,
) -> Array2<f32> {
    let mut output = input.bias_rows();
    let blocks = output
        .axis_chunks_iter_mut(Axis(0), config.tile_m)
        .enumerate();
    for_each_strided(blocks, units, |(index, mut block)| {
        let first_row = index * config.tile_m;
        let rows = first_row..first_row + block.nrows();
        let lhs = input.mat1.slice(s![rows, ..]);
        for column in (0..input.shape.n).step_by(config.tile_n) {
            let columns = column..(column + config.tile_n).min(input.shape.n);
            let rhs = input.mat2.slice(s![.., columns.clone()]);
            let mut tile = block.slice_mut(s![.., columns]);
            general_mat_mul(1.0, &lhs, &rhs, 1.0, &mut tile);
        }
    });
    output
}

/// Each unit reduces one slice of the inner dimension; partial products are
/// summed into the output as they finish.
fn split_k_addmm(
    input: &AddmmInput,
    units: usize,
) -> Array2<f32> {
    let k = input.shape.k;
    let chunk = k.div_ceil(units.max(1)).max(1);
    let output = Mutex::new(input.bias_rows());
    for_each_strided((0..k).step_by(chunk), units, |start| {
        let range = start..(start + chunk).min(k);
        let partial = input
            .mat1
            .slice(s![.., range.clone()])
            .dot(&input.mat2.slice(s![range, ..]));
        let mut output = output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *output += &partial;
    });
    output.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
}
