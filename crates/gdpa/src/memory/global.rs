use std::sync::atomic::{AtomicU32, Ordering};

use ndarray::{Array3, ArrayView2, ArrayView3, s};

use super::Tile;
use crate::DataType;

/// Box-copy view of a packed `[rows, heads, dim]` input tensor.
///
/// Rows at or past the bound passed to [`TensorDescriptor::load_box`] read as
/// zero, the way a bulk copy past the end of a tensor map is zero-filled.
#[derive(Clone, Copy)]
pub struct TensorDescriptor<'a> {
    tensor: ArrayView3<'a, f32>,
    data_type: DataType,
}

impl<'a> TensorDescriptor<'a> {
    pub fn new(
        tensor: ArrayView3<'a, f32>,
        data_type: DataType,
    ) -> Self {
        Self {
            tensor,
            data_type,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.tensor.dim().2
    }

    /// Byte count a full box of `rows` rows lands on its barrier.
    pub fn box_bytes(
        &self,
        rows: usize,
    ) -> usize {
        rows * self.head_dim() * self.data_type.size_in_bytes()
    }

    /// Fills the leading `head_dim` columns of `destination` with rows
    /// `row..row + destination.nrows()` of `head`, zeroing every row at or
    /// beyond `row_end`. A slot may be wider than the tensor when a ring is
    /// shared by tensors of different head dimensions.
    pub fn load_box(
        &self,
        destination: &mut Tile,
        row: usize,
        row_end: usize,
        head: usize,
    ) -> usize {
        let rows = destination.nrows();
        let head_dim = self.head_dim();
        for (offset, mut destination_row) in
            destination.rows_mut().into_iter().enumerate()
        {
            let mut target = destination_row.slice_mut(s![..head_dim]);
            let source_row = row + offset;
            if source_row < row_end {
                let source = self.tensor.slice(s![source_row, head, ..]);
                for (value, source_value) in target.iter_mut().zip(source.iter()) {
                    *value = self.data_type.quantize(*source_value);
                }
            } else {
                target.fill(0.0);
            }
        }
        self.box_bytes(rows)
    }
}

/// Output tensor shared by every unit of a launch.
///
/// Elements are f32 bit patterns so disjoint tiles can be stored without
/// locking and overlapping contributions can be accumulated atomically.
pub struct GlobalTensor {
    shape: [usize; 3],
    data: Vec<AtomicU32>,
}

impl GlobalTensor {
    pub fn zeros(shape: [usize; 3]) -> Self {
        let len = shape.iter().product();
        let data = (0..len).map(|_| AtomicU32::new(0.0f32.to_bits())).collect();
        Self {
            shape,
            data,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn offset(
        &self,
        row: usize,
        head: usize,
    ) -> usize {
        (row * self.shape[1] + head) * self.shape[2]
    }

    /// Writes the rows of `tile` starting at `row`, clipped to `row_end`.
    pub fn store_rows(
        &self,
        tile: ArrayView2<'_, f32>,
        row: usize,
        row_end: usize,
        head: usize,
        data_type: DataType,
    ) {
        for (offset, tile_row) in tile.rows().into_iter().enumerate() {
            let target = row + offset;
            if target >= row_end {
                break;
            }
            let base = self.offset(target, head);
            for (column, value) in tile_row.iter().enumerate() {
                self.data[base + column]
                    .store(data_type.quantize(*value).to_bits(), Ordering::Relaxed);
            }
        }
    }

    /// Adds the rows of `tile` starting at `row`, clipped to `row_end`.
    pub fn atomic_add_rows(
        &self,
        tile: ArrayView2<'_, f32>,
        row: usize,
        row_end: usize,
        head: usize,
    ) {
        for (offset, tile_row) in tile.rows().into_iter().enumerate() {
            let target = row + offset;
            if target >= row_end {
                break;
            }
            let base = self.offset(target, head);
            for (column, value) in tile_row.iter().enumerate() {
                atomic_add(&self.data[base + column], *value);
            }
        }
    }

    pub fn into_array(
        self,
        data_type: DataType,
    ) -> Array3<f32> {
        let [rows, heads, dim] = self.shape;
        let values: Vec<f32> = self
            .data
            .into_iter()
            .map(|cell| data_type.quantize(f32::from_bits(cell.into_inner())))
            .collect();
        Array3::from_shape_fn((rows, heads, dim), |(row, head, column)| {
            values[(row * heads + head) * dim + column]
        })
    }
}

fn atomic_add(
    cell: &AtomicU32,
    value: f32,
) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let updated = (f32::from_bits(current) + value).to_bits();
        match cell.compare_exchange_weak(
            current,
            updated,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use ndarray::{Array3, array};

    use super::*;
    use crate::memory::zero_tile;

    #[test]
    fn test_load_box_zero_fills_past_bound() {
        let tensor = Array3::from_shape_fn((4, 2, 3), |(row, head, column)| {
            (row * 100 + head * 10 + column) as f32
        });
        let descriptor = TensorDescriptor::new(tensor.view(), DataType::F32);
        let mut tile = zero_tile(3, 3);
        tile.fill(-1.0);
        let bytes = descriptor.load_box(&mut tile, 2, 3, 1);
        assert_eq!(bytes, 3 * 3 * 4);
        assert_eq!(
            tile,
            array![[210.0, 211.0, 212.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]
        );
    }

    #[test]
    fn test_store_rows_is_clipped() {
        let tensor = GlobalTensor::zeros([3, 1, 2]);
        let tile = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        tensor.store_rows(tile.view(), 1, 3, 0, DataType::F32);
        let array = tensor.into_array(DataType::F32);
        assert_eq!(
            array.into_shape_with_order((3, 2)).unwrap(),
            array![[0.0, 0.0], [1.0, 2.0], [3.0, 4.0]]
        );
    }

    #[test]
    fn test_concurrent_atomic_add() {
        let tensor = GlobalTensor::zeros([2, 1, 2]);
        let tile = array![[1.0f32, 0.5], [0.25, 2.0]];
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tensor.atomic_add_rows(tile.view(), 0, 2, 0);
                    }
                });
            }
        });
        let array = tensor.into_array(DataType::F32);
        assert_eq!(array[[0, 0, 0]], 800.0);
        assert_eq!(array[[0, 0, 1]], 400.0);
        assert_eq!(array[[1, 0, 0]], 200.0);
        assert_eq!(array[[1, 0, 1]], 1600.0);
    }
}
