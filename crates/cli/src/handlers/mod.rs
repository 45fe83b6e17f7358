mod bench;
mod list;
mod report;
mod run;

pub use bench::handle_bench;
pub use list::handle_list;
pub use run::{RunOptions, handle_run};
