mod activation;
mod epilogue;
mod load;
mod mma;
mod state;

use std::thread;

use state::ForwardUnit;

use super::launch::spawn_engines;
use crate::{
    AttentionParams, ForwardConfig,
    memory::{GlobalTensor, TensorDescriptor},
    scheduler::TileSchedule,
    sync::LaunchControl,
};

/// Everything a forward launch shares across units.
pub struct ForwardLaunch<'a> {
    pub config: &'a ForwardConfig,
    pub params: &'a AttentionParams,
    pub schedule: TileSchedule<'a>,
    pub query: TensorDescriptor<'a>,
    pub key: TensorDescriptor<'a>,
    pub value: TensorDescriptor<'a>,
    pub output: &'a GlobalTensor,
    pub head_dim: usize,
    pub head_dim_v: usize,
    /// Query heads per key/value head.
    pub group_size: usize,
}

#[derive(Clone, Copy)]
struct UnitContext<'a, 'l> {
    launch: &'a ForwardLaunch<'l>,
    state: &'a ForwardUnit,
    control: &'a LaunchControl,
    unit: usize,
    units: usize,
}

/// Runs the five-partition forward pipeline on `units` persistent units and
/// returns once every partition and engine has drained.
pub fn run(
    launch: &ForwardLaunch<'_>,
    units: usize,
    control: &LaunchControl,
) {
    let states: Vec<ForwardUnit> = (0..units)
        .map(|unit| {
            ForwardUnit::new(unit, launch.config, launch.head_dim, launch.head_dim_v)
        })
        .collect();
    run_units(launch, &states, control);
}

fn run_units(
    launch: &ForwardLaunch<'_>,
    states: &[ForwardUnit],
    control: &LaunchControl,
) {
    let units = states.len();
    thread::scope(|scope| {
        for (unit, state) in states.iter().enumerate() {
            let context = UnitContext {
                launch,
                state,
                control,
                unit,
                units,
            };
            let (mma_engine, copy_engine) = spawn_engines(scope, control);
            let store_engine = copy_engine.clone();

            scope.spawn(move || {
                control.run_partition("load", || load::run(context, copy_engine))
            });
            scope.spawn(move || {
                control.run_partition("mma", || mma::run(context, mma_engine))
            });
            for half in 0..2 {
                scope.spawn(move || {
                    control.run_partition("activation", || {
                        activation::run(context, half)
                    })
                });
            }
            scope.spawn(move || {
                control.run_partition("epilogue", || {
                    epilogue::run(context, store_engine)
                })
            });
        }
    });
}
