use ndarray::{Array2, ArrayView2, linalg::general_mat_mul};

/// Row-major block of f32 values, the unit every slot and accumulator holds.
pub type Tile = Array2<f32>;

pub fn zero_tile(
    rows: usize,
    cols: usize,
) -> Tile {
    Array2::zeros((rows, cols))
}

/// `d = a · b`, or `d += a · b` when `accumulate` is set.
pub fn matmul_into(
    a: ArrayView2<'_, f32>,
    b: ArrayView2<'_, f32>,
    d: &mut Tile,
    accumulate: bool,
) {
    debug_assert_eq!(a.ncols(), b.nrows());
    debug_assert_eq!(d.dim(), (a.nrows(), b.ncols()));
    if !accumulate {
        d.fill(0.0);
    }
    general_mat_mul(1.0, &a, &b, 1.0, d);
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_overwrite_then_accumulate() {
        let a = array![[1.0f32, 2.0], [3.0, 4.0]];
        let b = array![[1.0f32, 0.0], [0.0, 1.0]];
        let mut d = array![[f32::NAN, f32::NAN], [f32::NAN, f32::NAN]];
        matmul_into(a.view(), b.view(), &mut d, false);
        assert_eq!(d, a);
        matmul_into(a.view(), b.t(), &mut d, true);
        assert_eq!(d, array![[2.0f32, 4.0], [6.0, 8.0]]);
    }
}
