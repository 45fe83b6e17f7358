use crate::error::RaggedError;

/// Start offsets of variable-length sequences packed into one tensor.
///
/// Holds `batch + 1` monotonically non-decreasing entries starting at 0, so
/// sequence `i` occupies rows `offsets[i]..offsets[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaggedOffsets {
    offsets: Vec<i64>,
}

impl RaggedOffsets {
    pub fn new(offsets: Vec<i64>) -> Result<Self, RaggedError> {
        let first = *offsets.first().ok_or(RaggedError::Empty)?;
        if first != 0 {
            return Err(RaggedError::NonZeroStart(first));
        }
        for (index, window) in offsets.windows(2).enumerate() {
            if window[1] < window[0] {
                return Err(RaggedError::NotMonotonic {
                    index: index + 1,
                    previous: window[0],
                    current: window[1],
                });
            }
        }
        Ok(Self {
            offsets,
        })
    }

    pub fn from_lengths(lengths: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        offsets.push(0i64);
        let mut total = 0i64;
        for length in lengths {
            total += *length as i64;
            offsets.push(total);
        }
        Self {
            offsets,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.offsets
    }

    pub fn begin(
        &self,
        index: usize,
    ) -> usize {
        self.offsets[index] as usize
    }

    pub fn len(
        &self,
        index: usize,
    ) -> usize {
        (self.offsets[index + 1] - self.offsets[index]) as usize
    }

    pub fn lengths(&self) -> Vec<usize> {
        (0..self.batch_size()).map(|index| self.len(index)).collect()
    }

    pub fn max_len(&self) -> usize {
        self.lengths().into_iter().max().unwrap_or(0)
    }

    pub fn total_rows(&self) -> usize {
        self.offsets[self.offsets.len() - 1] as usize
    }

    /// The lengths must account for every row of the packed tensor.
    pub fn validate_rows(
        &self,
        rows: usize,
    ) -> Result<(), RaggedError> {
        let covered = self.offsets[self.offsets.len() - 1] - self.offsets[0];
        if covered != rows as i64 {
            return Err(RaggedError::RowCountMismatch {
                covered,
                rows,
            });
        }
        Ok(())
    }

    /// Batch permutation that schedules the longest sequences first.
    pub fn longest_first(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.batch_size()).collect();
        order.sort_by(|a, b| self.len(*b).cmp(&self.len(*a)));
        order
    }
}

/// Checks that `seq_index` is a permutation of the batch indices.
pub fn validate_sequence_index(
    seq_index: &[usize],
    batch_size: usize,
) -> Result<(), RaggedError> {
    if seq_index.len() != batch_size {
        return Err(RaggedError::InvalidSequenceIndex(batch_size));
    }
    let mut seen = vec![false; batch_size];
    for index in seq_index {
        match seen.get_mut(*index) {
            Some(slot) if !*slot => *slot = true,
            _ => return Err(RaggedError::InvalidSequenceIndex(batch_size)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths_sum_to_rows() {
        let offsets = RaggedOffsets::new(vec![0, 37, 166]).unwrap();
        assert_eq!(offsets.batch_size(), 2);
        assert_eq!(offsets.lengths(), vec![37, 129]);
        assert_eq!(offsets.lengths().iter().sum::<usize>(), 166);
        assert!(offsets.validate_rows(166).is_ok());
        assert_eq!(
            offsets.validate_rows(170),
            Err(RaggedError::RowCountMismatch {
                covered: 166,
                rows: 170,
            })
        );
    }

    #[test]
    fn test_rejects_decreasing_offsets() {
        assert_eq!(
            RaggedOffsets::new(vec![0, 10, 5]),
            Err(RaggedError::NotMonotonic {
                index: 2,
                previous: 10,
                current: 5,
            })
        );
    }

    #[test]
    fn test_rejects_bad_start() {
        assert_eq!(RaggedOffsets::new(vec![]), Err(RaggedError::Empty));
        assert_eq!(
            RaggedOffsets::new(vec![3, 5]),
            Err(RaggedError::NonZeroStart(3))
        );
    }

    #[test]
    fn test_empty_sequences_are_allowed() {
        let offsets = RaggedOffsets::new(vec![0, 0, 4, 4]).unwrap();
        assert_eq!(offsets.lengths(), vec![0, 4, 0]);
        assert_eq!(offsets.max_len(), 4);
    }

    #[test]
    fn test_longest_first() {
        let offsets = RaggedOffsets::from_lengths(&[3, 9, 1, 9]);
        assert_eq!(offsets.longest_first(), vec![1, 3, 0, 2]);
        assert!(validate_sequence_index(&offsets.longest_first(), 4).is_ok());
        assert!(validate_sequence_index(&[0, 0, 1, 2], 4).is_err());
        assert!(validate_sequence_index(&[0, 1], 4).is_err());
    }
}
