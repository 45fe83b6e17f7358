mod attention;
mod device;
mod kernel;

pub use attention::AttentionParams;
pub use device::DeviceLimits;
pub use kernel::{BackwardConfig, ForwardConfig, ResourceUsage};
