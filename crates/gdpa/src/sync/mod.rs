mod barrier;
mod control;
mod counter;

pub use barrier::MBarrier;
pub use control::LaunchControl;
pub use counter::{BufferPhase, PhaseCounter};
