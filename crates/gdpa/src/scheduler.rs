use std::ops::Range;

use crate::{AttentionParams, ragged::RaggedOffsets};

/// Which sequence the tile index of a work item walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileAxis {
    /// Forward pass: one tile per `BLOCK_M` query rows.
    Query,
    /// Backward pass: one tile per `BLOCK_N1` key rows.
    Key,
}

/// Number of tiles unit `unit` processes when `total_tiles` are strided over
/// `num_units` persistent units.
pub fn tiles_for_unit(
    unit: usize,
    num_units: usize,
    total_tiles: usize,
) -> usize {
    total_tiles / num_units + usize::from(unit < total_tiles % num_units)
}

/// A decoded work item with the bounds of its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoord {
    pub tile_id: usize,
    pub batch: usize,
    pub head: usize,
    /// Tile index along the scheduled axis.
    pub block: usize,
    pub q_begin: usize,
    pub q_len: usize,
    pub k_begin: usize,
    pub k_len: usize,
}

impl TileCoord {
    /// Key blocks that can hold keys visible from query rows
    /// `block * block_m..(block + 1) * block_m`. Never empty: a tile whose
    /// rows see no key still runs one fully masked block.
    pub fn key_blocks(
        &self,
        block_m: usize,
        block_n: usize,
        params: &AttentionParams,
    ) -> Range<usize> {
        let query_start = self.block * block_m;
        let query_end = (query_start + block_m).min(self.q_len);
        let mut key_start = 0;
        let mut key_end = self.k_len;
        if params.causal {
            key_end = key_end.min(query_end);
        }
        if let Some(window_size) = params.window_size {
            key_start = query_start.saturating_sub(window_size);
            key_end = key_end.min(query_end.saturating_add(window_size));
        }
        non_empty_blocks(key_start, key_end, block_n)
    }

    /// Query blocks that can see keys `block * block_n..(block + 1) * block_n`.
    pub fn query_blocks(
        &self,
        block_n: usize,
        block_m: usize,
        params: &AttentionParams,
    ) -> Range<usize> {
        let key_start = self.block * block_n;
        let key_end = (key_start + block_n).min(self.k_len);
        let mut query_start = 0;
        let mut query_end = self.q_len;
        if params.causal {
            query_start = key_start;
        }
        if let Some(window_size) = params.window_size {
            query_start = query_start.max(key_start.saturating_sub(window_size));
            query_end = query_end.min(key_end.saturating_add(window_size));
        }
        non_empty_blocks(query_start, query_end, block_m)
    }
}

fn non_empty_blocks(
    start: usize,
    end: usize,
    block: usize,
) -> Range<usize> {
    let first = start / block;
    let last = end.div_ceil(block);
    if last <= first {
        first..first + 1
    } else {
        first..last
    }
}

/// Launch-wide description of the persistent grid.
#[derive(Clone, Copy)]
pub struct TileSchedule<'a> {
    pub axis: TileAxis,
    pub block: usize,
    /// Block size of the opposite axis, walked inside every tile.
    pub inner_block: usize,
    pub heads: usize,
    pub max_seq_len_q: usize,
    pub max_seq_len_kv: usize,
    pub query_offsets: &'a RaggedOffsets,
    pub key_offsets: &'a RaggedOffsets,
    pub seq_index: Option<&'a [usize]>,
}

impl<'a> TileSchedule<'a> {
    pub fn tiles_per_head(&self) -> usize {
        match self.axis {
            TileAxis::Query => self.max_seq_len_q.div_ceil(self.block),
            // Tiles past the key extent are skipped by every partition alike.
            TileAxis::Key => self
                .max_seq_len_kv
                .div_ceil(self.block)
                .max(self.max_seq_len_q.div_ceil(self.inner_block)),
        }
    }

    pub fn total_tiles(&self) -> usize {
        self.tiles_per_head() * self.heads * self.query_offsets.batch_size()
    }

    /// Persistent grid size: one unit per multiprocessor, never more units
    /// than tiles.
    pub fn grid_size(
        &self,
        multiprocessor_count: usize,
    ) -> usize {
        multiprocessor_count.min(self.total_tiles())
    }

    pub fn unit(
        &self,
        unit: usize,
        num_units: usize,
    ) -> UnitTiles<'a> {
        UnitTiles {
            schedule: *self,
            unit,
            num_units,
            iteration: 0,
            iterations: tiles_for_unit(unit, num_units, self.total_tiles()),
        }
    }

    /// Decodes a flattened tile id into its work item.
    pub fn decode(
        &self,
        tile_id: usize,
    ) -> TileCoord {
        let tiles_per_head = self.tiles_per_head();
        let block = tile_id % tiles_per_head;
        let head_batch = tile_id / tiles_per_head;
        let head = head_batch % self.heads;
        let mut batch = head_batch / self.heads;
        if let Some(seq_index) = self.seq_index {
            batch = seq_index[batch];
        }
        TileCoord {
            tile_id,
            batch,
            head,
            block,
            q_begin: self.query_offsets.begin(batch),
            q_len: self.query_offsets.len(batch).min(self.max_seq_len_q),
            k_begin: self.key_offsets.begin(batch),
            k_len: self.key_offsets.len(batch).min(self.max_seq_len_kv),
        }
    }

    fn is_active(
        &self,
        coord: &TileCoord,
    ) -> bool {
        let start = coord.block * self.block;
        match self.axis {
            TileAxis::Query => start < coord.q_len,
            TileAxis::Key => start < coord.k_len,
        }
    }
}

/// Grid-stride walk over the tiles of one persistent unit, skipping tiles
/// that start past the end of their sequence.
pub struct UnitTiles<'a> {
    schedule: TileSchedule<'a>,
    unit: usize,
    num_units: usize,
    iteration: usize,
    iterations: usize,
}

impl Iterator for UnitTiles<'_> {
    type Item = TileCoord;

    fn next(&mut self) -> Option<Self::Item> {
        while self.iteration < self.iterations {
            let tile_id = self.unit + self.iteration * self.num_units;
            self.iteration += 1;
            let coord = self.schedule.decode(tile_id);
            if self.schedule.is_active(&coord) {
                return Some(coord);
            }
            log::trace!(
                "unit {} skips tile {} (batch {}, block {})",
                self.unit,
                tile_id,
                coord.batch,
                coord.block
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule<'a>(
        query_offsets: &'a RaggedOffsets,
        key_offsets: &'a RaggedOffsets,
        block: usize,
        heads: usize,
    ) -> TileSchedule<'a> {
        TileSchedule {
            axis: TileAxis::Query,
            block,
            inner_block: block,
            heads,
            max_seq_len_q: query_offsets.max_len(),
            max_seq_len_kv: key_offsets.max_len(),
            query_offsets,
            key_offsets,
            seq_index: None,
        }
    }

    #[test]
    fn test_remainder_goes_to_first_units() {
        let counts: Vec<usize> =
            (0..4).map(|unit| tiles_for_unit(unit, 4, 10)).collect();
        assert_eq!(counts, vec![3, 3, 2, 2]);
        assert_eq!(tiles_for_unit(5, 8, 3), 0);
    }

    #[test]
    fn test_units_partition_all_tiles() {
        let offsets = RaggedOffsets::from_lengths(&[64, 64, 64]);
        let schedule = schedule(&offsets, &offsets, 16, 2);
        assert_eq!(schedule.total_tiles(), 4 * 2 * 3);

        let mut visited: Vec<usize> = (0..5)
            .flat_map(|unit| schedule.unit(unit, 5).map(|coord| coord.tile_id))
            .collect();
        visited.sort();
        assert_eq!(visited, (0..24).collect::<Vec<_>>());
        assert_eq!(
            schedule.unit(1, 5).map(|coord| coord.tile_id).collect::<Vec<_>>(),
            vec![1, 6, 11, 16, 21]
        );
    }

    #[test]
    fn test_decode_order() {
        let offsets = RaggedOffsets::from_lengths(&[40, 40]);
        let schedule = schedule(&offsets, &offsets, 16, 3);
        let coord = schedule.decode(2 + 3 * 4);
        assert_eq!((coord.block, coord.head, coord.batch), (2, 1, 1));
        assert_eq!((coord.q_begin, coord.q_len), (40, 40));
    }

    #[test]
    fn test_tiles_past_sequence_end_are_skipped() {
        let offsets = RaggedOffsets::from_lengths(&[37, 129]);
        let schedule = schedule(&offsets, &offsets, 32, 1);
        let active: Vec<(usize, usize)> = schedule
            .unit(0, 1)
            .map(|coord| (coord.batch, coord.block))
            .collect();
        assert_eq!(
            active,
            vec![(0, 0), (0, 1), (1, 0), (1, 1), (1, 2), (1, 3), (1, 4)]
        );
    }

    #[test]
    fn test_sequence_index_remaps_batches() {
        let offsets = RaggedOffsets::from_lengths(&[3, 90]);
        let order = offsets.longest_first();
        let schedule = TileSchedule {
            seq_index: Some(&order),
            ..schedule(&offsets, &offsets, 32, 1)
        };
        let first = schedule.unit(0, 1).next().unwrap();
        assert_eq!(first.batch, 1);
        assert_eq!(first.q_begin, 3);
    }

    #[test]
    fn test_key_axis_skips_by_key_length() {
        let query_offsets = RaggedOffsets::from_lengths(&[100]);
        let key_offsets = RaggedOffsets::from_lengths(&[20]);
        let schedule = TileSchedule {
            axis: TileAxis::Key,
            inner_block: 64,
            max_seq_len_kv: 64,
            ..schedule(&query_offsets, &key_offsets, 16, 1)
        };
        assert_eq!(schedule.tiles_per_head(), 4);
        assert_eq!(schedule.unit(0, 1).count(), 2);

        // The query extent in BLOCK_M1 steps can dominate the tile count.
        let schedule = TileSchedule {
            inner_block: 16,
            ..schedule
        };
        assert_eq!(schedule.tiles_per_head(), 7);
        assert_eq!(schedule.unit(0, 1).count(), 2);
    }

    #[test]
    fn test_key_blocks_follow_masks() {
        let coord = TileCoord {
            tile_id: 0,
            batch: 0,
            head: 0,
            block: 2,
            q_begin: 0,
            q_len: 100,
            k_begin: 0,
            k_len: 100,
        };
        let full = AttentionParams::default();
        assert_eq!(coord.key_blocks(16, 8, &full), 0..13);

        let causal = AttentionParams {
            causal: true,
            ..AttentionParams::default()
        };
        assert_eq!(coord.key_blocks(16, 8, &causal), 0..6);

        let window = AttentionParams {
            window_size: Some(4),
            ..AttentionParams::default()
        };
        assert_eq!(coord.key_blocks(16, 8, &window), 3..7);
    }

    #[test]
    fn test_empty_key_range_still_runs_one_block() {
        let coord = TileCoord {
            tile_id: 0,
            batch: 0,
            head: 0,
            block: 0,
            q_begin: 0,
            q_len: 10,
            k_begin: 0,
            k_len: 0,
        };
        assert_eq!(coord.key_blocks(16, 8, &AttentionParams::default()), 0..1);
    }

    #[test]
    fn test_query_blocks_follow_masks() {
        let coord = TileCoord {
            tile_id: 0,
            batch: 0,
            head: 0,
            block: 1,
            q_begin: 0,
            q_len: 64,
            k_begin: 0,
            k_len: 64,
        };
        let causal = AttentionParams {
            causal: true,
            ..AttentionParams::default()
        };
        assert_eq!(coord.query_blocks(16, 8, &causal), 2..8);

        let window = AttentionParams {
            window_size: Some(3),
            ..AttentionParams::default()
        };
        assert_eq!(coord.query_blocks(16, 8, &window), 1..5);
    }

    #[test]
    fn test_unbounded_window_covers_full_range() {
        let coord = TileCoord {
            tile_id: 0,
            batch: 0,
            head: 0,
            block: 1,
            q_begin: 0,
            q_len: 40,
            k_begin: 0,
            k_len: 40,
        };
        let full = AttentionParams::default();
        let unbounded = AttentionParams {
            window_size: Some(usize::MAX),
            ..AttentionParams::default()
        };
        assert_eq!(
            coord.key_blocks(16, 8, &unbounded),
            coord.key_blocks(16, 8, &full)
        );
        assert_eq!(
            coord.query_blocks(8, 16, &unbounded),
            coord.query_blocks(8, 16, &full)
        );
    }
}
