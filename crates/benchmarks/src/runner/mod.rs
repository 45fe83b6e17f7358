pub mod helpers;
mod runner;
pub mod types;

pub use runner::Runner;
