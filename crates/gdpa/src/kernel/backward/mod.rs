mod activation;
mod load;
mod mma;
mod reduction;
mod state;

use std::thread;

use state::BackwardUnit;

use super::launch::spawn_engines;
use crate::{
    AttentionParams, BackwardConfig,
    memory::{GlobalTensor, TensorDescriptor},
    scheduler::TileSchedule,
    sync::LaunchControl,
};

/// Everything a backward launch shares across units. Tiles walk the key axis;
/// every tile owns `BLOCK_N1` key rows of one query head.
pub struct BackwardLaunch<'a> {
    pub config: &'a BackwardConfig,
    pub params: &'a AttentionParams,
    pub schedule: TileSchedule<'a>,
    pub query: TensorDescriptor<'a>,
    pub key: TensorDescriptor<'a>,
    pub value: TensorDescriptor<'a>,
    pub d_output: TensorDescriptor<'a>,
    pub d_query: &'a GlobalTensor,
    pub d_key: &'a GlobalTensor,
    pub d_value: &'a GlobalTensor,
    pub head_dim: usize,
    pub head_dim_v: usize,
    pub group_size: usize,
}

#[derive(Clone, Copy)]
struct UnitContext<'a, 'l> {
    launch: &'a BackwardLaunch<'l>,
    state: &'a BackwardUnit,
    control: &'a LaunchControl,
    unit: usize,
    units: usize,
}

/// Runs the four-partition backward pipeline on `units` persistent units.
pub fn run(
    launch: &BackwardLaunch<'_>,
    units: usize,
    control: &LaunchControl,
) {
    let states: Vec<BackwardUnit> = (0..units)
        .map(|unit| {
            BackwardUnit::new(unit, launch.config, launch.head_dim, launch.head_dim_v)
        })
        .collect();

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

            scope.spawn(move || {
                control.run_partition("load", || load::run(context, copy_engine))
            });
            scope.spawn(move || {
                control.run_partition("mma", || mma::run(context, mma_engine))
            });
            scope.spawn(move || {
                control.run_partition("activation", || activation::run(context))
            });
            scope.spawn(move || {
                control.run_partition("reduction", || reduction::run(context))
            });
        }
    });
}
