use super::{Tile, zero_tile};
use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreState {
    Empty,
    /// Raw `Q·Kᵀ` (or `K·Qᵀ`) written by the matrix engine.
    Scores,
    /// Activated scores written back in place, waiting for the second matmul.
    Activated,
    /// Gradient of the activated scores, reusing the same columns.
    ScoreGrad,
}

impl ScoreState {
    fn name(&self) -> &'static str {
        match self {
            ScoreState::Empty => "empty",
            ScoreState::Scores => "scores",
            ScoreState::Activated => "activated",
            ScoreState::ScoreGrad => "score-grad",
        }
    }
}

/// Tensor memory region that holds several logical values over its lifetime.
///
/// The region is allocated once; the tag records which value currently lives
/// in it and every hand-over goes through a checked transition:
///
/// ```text
/// Empty -> Scores -> Activated -> Empty -> ScoreGrad -> Empty
/// ```
///
/// The forward pass only uses the first three edges.
pub struct ScoreBuffer {
    label: String,
    state: ScoreState,
    data: Tile,
}

impl ScoreBuffer {
    pub fn new(
        label: impl Into<String>,
        rows: usize,
        cols: usize,
    ) -> Self {
        Self {
            label: label.into(),
            state: ScoreState::Empty,
            data: zero_tile(rows, cols),
        }
    }

    pub fn state(&self) -> ScoreState {
        self.state
    }

    pub fn write_scores(&mut self) -> Result<&mut Tile, KernelError> {
        self.transition(ScoreState::Empty, ScoreState::Scores)?;
        Ok(&mut self.data)
    }

    pub fn activate(&mut self) -> Result<&mut Tile, KernelError> {
        self.transition(ScoreState::Scores, ScoreState::Activated)?;
        Ok(&mut self.data)
    }

    pub fn consume_activated(&mut self) -> Result<&Tile, KernelError> {
        self.transition(ScoreState::Activated, ScoreState::Empty)?;
        Ok(&self.data)
    }

    pub fn write_score_grad(&mut self) -> Result<&mut Tile, KernelError> {
        self.transition(ScoreState::Empty, ScoreState::ScoreGrad)?;
        Ok(&mut self.data)
    }

    pub fn consume_score_grad(&mut self) -> Result<&Tile, KernelError> {
        self.transition(ScoreState::ScoreGrad, ScoreState::Empty)?;
        Ok(&self.data)
    }

    fn transition(
        &mut self,
        from: ScoreState,
        to: ScoreState,
    ) -> Result<(), KernelError> {
        if self.state != from {
            return Err(KernelError::IllegalSlotTransition {
                slot: self.label.clone(),
                from: self.state.name(),
                to: to.name(),
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_lifecycle() {
        let mut buffer = ScoreBuffer::new("qk0[0]", 2, 2);
        buffer.write_scores().unwrap().fill(3.0);
        let scores = buffer.activate().unwrap();
        assert_eq!(scores[[1, 1]], 3.0);
        scores.mapv_inplace(|x| 2.0 * x);
        assert_eq!(buffer.consume_activated().unwrap()[[0, 1]], 6.0);
        assert_eq!(buffer.state(), ScoreState::Empty);
    }

    #[test]
    fn test_backward_lifecycle() {
        let mut buffer = ScoreBuffer::new("qkT[0]", 2, 2);
        buffer.write_scores().unwrap();
        buffer.activate().unwrap();
        buffer.consume_activated().unwrap();
        buffer.write_score_grad().unwrap().fill(-1.0);
        assert_eq!(buffer.consume_score_grad().unwrap()[[0, 0]], -1.0);
        assert_eq!(buffer.state(), ScoreState::Empty);
    }

    #[test]
    fn test_overwriting_unconsumed_scores_is_rejected() {
        let mut buffer = ScoreBuffer::new("qk1[0]", 1, 1);
        buffer.write_scores().unwrap();
        assert_eq!(
            buffer.write_scores().err(),
            Some(KernelError::IllegalSlotTransition {
                slot: "qk1[0]".to_string(),
                from: "scores",
                to: "scores",
            })
        );
    }

    #[test]
    fn test_consuming_raw_scores_is_rejected() {
        let mut buffer = ScoreBuffer::new("qk0[0]", 1, 1);
        buffer.write_scores().unwrap();
        assert!(buffer.consume_activated().is_err());
        assert!(buffer.write_score_grad().is_err());
        assert_eq!(buffer.state(), ScoreState::Scores);
    }
}
