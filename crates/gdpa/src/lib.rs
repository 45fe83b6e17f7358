pub mod activation;
pub mod config;
pub mod data_type;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod ragged;
pub mod reference;
pub mod scheduler;
pub mod sync;

pub use activation::Activation;
pub use config::*;
pub use data_type::DataType;
pub use error::{ConfigError, GdpaError, KernelError, RaggedError, ShapeError};
pub use kernel::{GdpaInputs, GdpaKernel, Gradients, ProblemShape};
pub use ragged::RaggedOffsets;
pub use reference::{reference_backward, reference_forward};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
