pub mod error;
pub mod operator;
pub mod runner;

pub use error::BenchmarkError;
pub use runner::types;
