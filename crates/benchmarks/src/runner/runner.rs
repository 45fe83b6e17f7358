use std::time::{Instant, SystemTime, UNIX_EPOCH};

use gdpa::{DeviceLimits, VERSION};
use log::{debug, info, warn};
use serde::Deserialize;
use sysinfo::System;

use crate::{
    BenchmarkError,
    operator::{Operator, OperatorVisitor, dispatch},
    runner::{
        helpers::LatencyStats,
        types::{Device, Result as TaskResult, Task},
    },
};

pub struct Runner {
    pub task: Task,
}

impl Runner {
    pub fn new(task: Task) -> Self {
        Self {
            task,
        }
    }

    /// Device limits the task runs with: the task's, with no more units than
    /// the host can schedule.
    pub fn limits(&self) -> DeviceLimits {
        self.task.device.capped_to_host()
    }

    pub fn run<F>(
        &self,
        progress: Option<F>,
    ) -> Result<Vec<TaskResult>, BenchmarkError>
    where
        F: FnMut(f64),
    {
        if self.task.iterations == 0 {
            return Err(BenchmarkError::NoIterations);
        }
        let results = dispatch(
            &self.task.operator,
            self.task.mode,
            &self.task.params,
            self.limits(),
            Measure {
                runner: self,
                progress,
            },
        )??;
        info!(
            "Task {} finished with {} results",
            self.task.identifier,
            results.len()
        );
        Ok(results)
    }
}

struct Measure<'r, F> {
    runner: &'r Runner,
    progress: Option<F>,
}

impl<F: FnMut(f64)> OperatorVisitor for Measure<'_, F> {
    type Output = Result<Vec<TaskResult>, BenchmarkError>;

    fn visit<O: Operator>(
        self,
        operator: O,
    ) -> Self::Output {
        self.runner.measure(&operator, self.progress)
    }
}

impl Runner {
    /// Sweep points of the task, or the operator's built-in sweep.
    fn shapes<O: Operator>(
        &self,
        operator: &O,
    ) -> Result<Vec<O::Shape>, BenchmarkError> {
        if self.task.shapes.is_empty() {
            return Ok(operator.builtin_shapes());
        }
        self.task
            .shapes
            .iter()
            .map(|shape| {
                <O::Shape as Deserialize>::deserialize(shape).map_err(|error| {
                    BenchmarkError::InvalidShape {
                        operator: operator.name(),
                        reason: error.to_string(),
                    }
                })
            })
            .collect()
    }

    /// Backends this task runs, in the operator's order unless the task
    /// names them explicitly.
    fn backends<O: Operator>(
        &self,
        operator: &O,
    ) -> Vec<String> {
        if self.task.backends.is_empty() {
            operator.backends().into_iter().map(String::from).collect()
        } else {
            self.task.backends.clone()
        }
    }

    fn measure<O, F>(
        &self,
        operator: &O,
        mut progress: Option<F>,
    ) -> Result<Vec<TaskResult>, BenchmarkError>
    where
        O: Operator,
        F: FnMut(f64),
    {
        let device = self.get_device_info();
        let shapes = self.shapes(operator)?;
        let backends = self.backends(operator);
        let total_steps = (shapes.len() * backends.len()).max(1);
        let mut step = 0;

        let mut results: Vec<TaskResult> = Vec::new();
        for shape in &shapes {
            let shape_value = serde_json::to_value(shape).map_err(|error| {
                BenchmarkError::InvalidShape {
                    operator: operator.name(),
                    reason: error.to_string(),
                }
            })?;
            let input = operator.prepare(shape, self.task.seed)?;
            let flops = operator.flops(&input);
            let bytes = operator.bytes(&input);

            let baseline = operator.bind(operator.baseline(), &input)?;
            let expected = (baseline.run)()?;

            for backend in &backends {
                step += 1;
                let bound = match operator.bind(backend, &input) {
                    Ok(bound) => bound,
                    Err(BenchmarkError::NoValidConfig {
                        backend,
                        shape,
                    }) => {
                        warn!("Skipping {backend} on {shape}: no configuration fits");
                        if let Some(progress) = progress.as_mut() {
                            progress(step as f64 / total_steps as f64);
                        }
                        continue;
                    },
                    Err(error) => return Err(error),
                };

                for _ in 0..self.task.warmup {
                    (bound.run)()?;
                }

                let mut samples = Vec::with_capacity(self.task.iterations);
                let mut output = None;
                for _ in 0..self.task.iterations {
                    let start = Instant::now();
                    let result = (bound.run)()?;
                    samples.push(start.elapsed().as_secs_f64() * 1e3);
                    output = Some(result);
                }
                let latency = LatencyStats::from_samples(&samples)
                    .ok_or(BenchmarkError::NoIterations)?;
                let output = output.ok_or(BenchmarkError::NoIterations)?;

                let accuracy = (bound.name != operator.baseline())
                    .then(|| operator.check_accuracy(&output, &expected));
                if let Some(accuracy) = accuracy.filter(|accuracy| !accuracy.passed) {
                    warn!(
                        "{} on {shape} deviates from {}: max abs diff {}",
                        bound.name,
                        operator.baseline(),
                        accuracy.max_abs_diff
                    );
                }
                let seconds = latency.mean / 1e3;
                let tflops = flops.map(|flops| flops / seconds / 1e12);
                let gbps = bytes.map(|bytes| bytes / seconds / 1e9);
                debug!(
                    "{} on {shape}: {:.3} ms, {tflops:?} TFLOPS, {gbps:?} GB/s",
                    bound.name, latency.mean
                );

                let timestamp =
                    SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
                results.push(TaskResult {
                    task_identifier: self.task.identifier.clone(),
                    device: device.clone(),
                    engine_version: VERSION.to_string(),
                    timestamp,
                    operator: operator.name().to_string(),
                    mode: operator.mode(),
                    shape: shape_value.clone(),
                    shape_name: shape.to_string(),
                    backend: bound.name.to_string(),
                    config: bound.config.clone(),
                    latency,
                    tflops,
                    gbps,
                    accuracy,
                });

                if let Some(progress) = progress.as_mut() {
                    progress(step as f64 / total_steps as f64);
                }
            }
        }

        Ok(results)
    }

    fn get_device_info(&self) -> Device {
        let mut system_info = System::new_all();
        system_info.refresh_all();

        let os_name = System::long_os_version();
        let cpu_name =
            system_info.cpus().first().map(|cpu| cpu.brand().to_string());
        let cpu_count = system_info.cpus().len();
        let memory_total = system_info.total_memory();

        Device {
            os_name,
            cpu_name,
            cpu_count,
            memory_total,
            multiprocessor_count: self.limits().multiprocessor_count,
        }
    }
}
