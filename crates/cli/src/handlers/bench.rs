use std::fs;

use anyhow::Context;
use benchmarks::{runner::Runner, types::Task};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use super::report::results_table;

const PROGRESS_STEPS: u64 = 1000;

pub fn handle_bench(
    task_path: String,
    output_path: String,
) -> anyhow::Result<()> {
    let task_data = fs::read_to_string(&task_path)
        .with_context(|| format!("Failed to read task {task_path}"))?;
    let task: Task = serde_json::from_str(&task_data)
        .with_context(|| format!("Failed to parse task {task_path}"))?;

    println!("Task: {}", task.identifier);
    let progress_bar = ProgressBar::new(PROGRESS_STEPS);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.green} {percent}% {elapsed}")
            .context("Invalid progress template")?,
    );
    progress_bar.set_position(0);
    let runner = Runner::new(task);
    let results = runner.run(Some(|fraction: f64| {
        progress_bar.set_position((fraction * PROGRESS_STEPS as f64) as u64);
    }))?;
    progress_bar.finish();

    let results_data = serde_json::to_string_pretty(&results)?;
    fs::write(&output_path, results_data)
        .with_context(|| format!("Failed to write results {output_path}"))?;
    info!("{} results written to {output_path}", results.len());

    println!("{}", results_table(&results));
    Ok(())
}
