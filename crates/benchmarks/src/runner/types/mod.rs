mod device;
mod result;
mod task;

pub use device::Device;
pub use result::Result;
pub use task::Task;
