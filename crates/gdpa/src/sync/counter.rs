/// Position of a use within a ring of buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPhase {
    pub index: usize,
    pub phase: u32,
}

impl BufferPhase {
    /// Parity a producer waits on at the slot's empty barrier: the consumer
    /// release of the previous generation.
    pub fn producer_phase(&self) -> u32 {
        self.phase ^ 1
    }
}

/// Per-partition sequence number over one logical channel.
///
/// Every partition owns its own counters; two partitions agree on a slot and
/// phase only because they advance the same channel the same number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseCounter {
    count: usize,
    buffers: usize,
}

impl PhaseCounter {
    pub fn new(buffers: usize) -> Self {
        Self {
            count: 0,
            buffers: buffers.max(1),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn current(&self) -> BufferPhase {
        BufferPhase {
            index: self.count % self.buffers,
            phase: ((self.count / self.buffers) & 1) as u32,
        }
    }

    pub fn advance(&mut self) {
        self.count += 1;
    }

    pub fn next(&mut self) -> BufferPhase {
        let current = self.current();
        self.advance();
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_and_phase_rotation() {
        let mut counter = PhaseCounter::new(3);
        let positions: Vec<(usize, u32)> = (0..7)
            .map(|_| {
                let at = counter.next();
                (at.index, at.phase)
            })
            .collect();
        assert_eq!(
            positions,
            vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1), (0, 0)]
        );
        assert_eq!(counter.count(), 7);
    }

    #[test]
    fn test_single_buffer_toggles_every_use() {
        let mut counter = PhaseCounter::new(1);
        assert_eq!(counter.next().phase, 0);
        assert_eq!(counter.next().phase, 1);
        let at = counter.next();
        assert_eq!(at.phase, 0);
        assert_eq!(at.producer_phase(), 1);
    }
}
