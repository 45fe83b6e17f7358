use crate::AttentionParams;

/// Visibility of the scores of one tile.
///
/// Offsets passed to [`ScoreMask::is_visible`] are relative to the tile;
/// starts and lengths are relative to the start of the sequence. Rows past
/// either sequence end are masked together with causal and window exclusions.
pub struct ScoreMask<'a> {
    pub params: &'a AttentionParams,
    pub query_start: usize,
    pub query_len: usize,
    pub key_start: usize,
    pub key_len: usize,
}

impl ScoreMask<'_> {
    pub fn is_visible(
        &self,
        query_offset: usize,
        key_offset: usize,
    ) -> bool {
        let query = self.query_start + query_offset;
        let key = self.key_start + key_offset;
        query < self.query_len
            && key < self.key_len
            && self.params.is_visible(query, key)
    }
}
