mod global;
mod pipeline;
mod score;
mod slot;
mod tile;

pub use global::{GlobalTensor, TensorDescriptor};
pub use pipeline::Pipeline;
pub use score::{ScoreBuffer, ScoreState};
pub use slot::SharedSlot;
pub use tile::{Tile, matmul_into, zero_tile};
