use anyhow::Context;
use benchmarks::{operator::Mode, runner::Runner, types::Task};
use console::Style;
use gdpa::DeviceLimits;
use indicatif::{ProgressBar, ProgressStyle};

use super::report::results_table;

/// An ad hoc run, as given on the command line.
pub struct RunOptions {
    pub operator: String,
    pub mode: Mode,
    /// Sweep point in the operator's shape format; its built-in sweep when
    /// absent.
    pub shape: Option<serde_json::Value>,
    /// Operator parameters; its defaults when null.
    pub params: serde_json::Value,
    pub multiprocessor_count: usize,
    pub backends: Vec<String>,
    pub warmup: usize,
    pub iterations: usize,
    pub seed: u64,
}

impl RunOptions {
    fn into_task(self) -> Task {
        Task {
            identifier: format!("{}-{}", self.operator, self.mode),
            operator: self.operator,
            mode: self.mode,
            shapes: self.shape.into_iter().collect(),
            params: self.params,
            device: DeviceLimits::default()
                .with_multiprocessor_count(self.multiprocessor_count),
            backends: self.backends,
            warmup: self.warmup,
            iterations: self.iterations,
            seed: self.seed,
        }
    }
}

pub fn handle_run(options: RunOptions) -> anyhow::Result<()> {
    let task = options.into_task();
    let runner = Runner::new(task);
    let sweep = match runner.task.shapes.first() {
        Some(shape) => shape.to_string(),
        None => "built-in sweep".to_string(),
    };
    let style = Style::new().bold();
    println!(
        "{}",
        style.apply_to(format!(
            "{} {sweep} on {} units",
            runner.task.identifier,
            runner.limits().multiprocessor_count
        ))
    );

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.enable_steady_tick(std::time::Duration::from_millis(100));
    progress_bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("Invalid progress template")?,
    );
    progress_bar.set_message("Measuring");
    let results = runner.run(Some(|fraction: f64| {
        progress_bar.set_message(format!("Measuring {:.0}%", fraction * 100.0));
    }));
    progress_bar.finish_and_clear();

    println!("{}", results_table(&results?));
    Ok(())
}
