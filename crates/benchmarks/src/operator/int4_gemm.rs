use std::fmt;

use gdpa::{DataType, DeviceLimits};
use itertools::iproduct;
use ndarray::{Array2, ArrayView2, Zip};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use super::{
    Accuracy, BoundBackend, Mode, Operator, for_each_strided, standard_normal,
};
use crate::BenchmarkError;

const BASELINE: &str = "eager_int4_gemm";
const BACKENDS: [&str; 4] = [
    BASELINE,
    "fused_int4_gemm",
    "preprocessed_eager_int4_gemm",
    "preprocessed_fused_int4_gemm",
];

/// Quantization group the scale/zero-point traffic is counted with.
const GROUP_SIZE: usize = 32;

/// Activations `[batch, seq_len, k]` times int4 weights `[k, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int4GemmShape {
    pub batch: usize,
    pub seq_len: usize,
    pub k: usize,
    pub n: usize,
}

impl fmt::Display for Int4GemmShape {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "B={} L={} K={} N={}",
            self.batch, self.seq_len, self.k, self.n
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Int4GemmParams {
    /// Storage type of the activations and the product.
    pub data_type: DataType,
}

impl Default for Int4GemmParams {
    fn default() -> Self {
        Self {
            data_type: DataType::BF16,
        }
    }
}

pub struct Int4GemmInput {
    pub shape: Int4GemmShape,
    /// Activations flattened to `[batch * seq_len, k]`.
    pub x: Array2<f32>,
    /// Values in `-8..7`, one per byte of storage before packing.
    pub w: Array2<i32>,
}

/// Packs pairs of rows along `k`: row `2i` goes to the low nibble of packed
/// row `i`, row `2i + 1` to the high nibble. `k` must be even.
pub fn pack_int4(w: ArrayView2<i32>) -> Array2<i8> {
    let (k, n) = w.dim();
    Array2::from_shape_fn((k / 2, n), |(row, column)| {
        let low = w[[2 * row, column]] & 0x0f;
        let high = (w[[2 * row + 1, column]] & 0x0f) << 4;
        (low | high) as u8 as i8
    })
}

/// Sign-extended low and high nibble of a packed byte.
fn unpack(byte: i8) -> (f32, f32) {
    let low = (byte << 4) >> 4;
    let high = byte >> 4;
    (low as f32, high as f32)
}

fn unpack_int4(packed: &Array2<i8>) -> Array2<f32> {
    let (half_k, n) = packed.dim();
    let mut weights = Array2::zeros((2 * half_k, n));
    for ((row, column), byte) in packed.indexed_iter() {
        let (low, high) = unpack(*byte);
        weights[[2 * row, column]] = low;
        weights[[2 * row + 1, column]] = high;
    }
    weights
}

/// Row-parallel product that decodes both nibbles of a packed byte in the
/// inner loop.
fn fused_matmul(
    x: ArrayView2<f32>,
    packed: &Array2<i8>,
    units: usize,
) -> Array2<f32> {
    let mut output = Array2::zeros((x.nrows(), packed.ncols()));
    let rows = output.rows_mut().into_iter().zip(x.rows());
    for_each_strided(rows, units, |(mut out, activations)| {
        for (pair, packed_row) in packed.rows().into_iter().enumerate() {
            let low_x = activations[2 * pair];
            let high_x = activations[2 * pair + 1];
            Zip::from(&mut out).and(&packed_row).for_each(|out, &byte| {
                let (low, high) = unpack(byte);
                *out += low_x * low + high_x * high;
            });
        }
    });
    output
}

/// bf16 activations times int4 weights, with and without packing in the
/// timed call.
pub struct Int4GemmOperator {
    params: Int4GemmParams,
    units: usize,
}

impl Int4GemmOperator {
    fn finish(
        &self,
        product: Array2<f32>,
    ) -> Array2<f32> {
        let data_type = self.params.data_type;
        product.mapv_into(|value| data_type.quantize(value))
    }
}

impl Operator for Int4GemmOperator {
    const NAME: &'static str = "int4_gemm";

    type Shape = Int4GemmShape;
    type Params = Int4GemmParams;
    type Input = Int4GemmInput;
    type Output = Array2<f32>;

    fn new(
        mode: Mode,
        params: Int4GemmParams,
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

    /// Llama-2 70B projections under 8-way tensor parallelism, scaled down
    /// eightfold: wqkv, w0, w13 and w2.
    fn builtin_shapes(&self) -> Vec<Int4GemmShape> {
        let layers = [(1024, 160), (128, 1024), (1024, 896), (448, 1024)];
        iproduct!([1, 16], [1, 4], layers)
            .map(|(seq_len, batch, (k, n))| Int4GemmShape {
                batch,
                seq_len,
                k,
                n,
            })
            .collect()
    }

    fn prepare(
        &self,
        shape: &Int4GemmShape,
        seed: u64,
    ) -> Result<Int4GemmInput, BenchmarkError> {
        if shape.k % 2 != 0 {
            return Err(BenchmarkError::InvalidShape {
                operator: Self::NAME,
                reason: format!("k = {} cannot be packed in pairs", shape.k),
            });
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let data_type = self.params.data_type;
        let x = Array2::from_shape_fn((shape.batch * shape.seq_len, shape.k), |_| {
            data_type.quantize(standard_normal(&mut rng))
        });
        let w = Array2::from_shape_fn((shape.k, shape.n), |_| rng.random_range(-8..7));
        Ok(Int4GemmInput {
            shape: *shape,
            x,
            w,
        })
    }

    fn bind<'a>(
        &'a self,
        backend: &str,
        input: &'a Int4GemmInput,
    ) -> Result<BoundBackend<'a, Array2<f32>>, BenchmarkError> {
        let units = self.units;
        match backend {
            BASELINE => Ok(BoundBackend::new(BASELINE, move || {
                let packed = pack_int4(input.w.view());
                Ok(self.finish(input.x.view().dot(&unpack_int4(&packed))))
            })),
            "fused_int4_gemm" => Ok(BoundBackend::new("fused_int4_gemm", move || {
                let packed = pack_int4(input.w.view());
                Ok(self.finish(fused_matmul(input.x.view(), &packed, units)))
            })),
            "preprocessed_eager_int4_gemm" => {
                let packed = pack_int4(input.w.view());
                Ok(BoundBackend::new("preprocessed_eager_int4_gemm", move || {
                    Ok(self.finish(input.x.view().dot(&unpack_int4(&packed))))
                }))
            },
            "preprocessed_fused_int4_gemm" => {
                let packed = pack_int4(input.w.view());
                Ok(BoundBackend::new("preprocessed_fused_int4_gemm", move || {
                    Ok(self.finish(fused_matmul(input.x.view(), &packed, units)))
                }))
            },
            _ => Err(BenchmarkError::UnknownBackend {
                operator: Self::NAME,
                backend: backend.to_string(),
            }),
        }
    }

    fn flops(
        &self,
        input: &Int4GemmInput,
    ) -> Option<f64> {
        let shape = input.shape;
        Some((2 * shape.batch * shape.seq_len * shape.n * shape.k) as f64)
    }

    /// Activations, grouped scales and zero points, the product, and the
    /// packed weights at half a byte each.
    fn bytes(
        &self,
        input: &Int4GemmInput,
    ) -> Option<f64> {
        let shape = input.shape;
        let element = self.params.data_type.size_in_bytes();
        let m = shape.batch * shape.seq_len;
        let scales_and_zeros = shape.k.div_ceil(GROUP_SIZE) * shape.n * 2;
        let elements = input.x.len() + scales_and_zeros + m * shape.n;
        Some((elements * element + shape.k * shape.n / 2) as f64)
    }

    fn check_accuracy(
        &self,
        actual: &Array2<f32>,
        expected: &Array2<f32>,
    ) -> Accuracy {
        Accuracy::compare(actual.view(), expected.view(), 1e-2, 8.0)
    }
}
