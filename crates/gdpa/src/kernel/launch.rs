use std::thread::Scope;

use crate::{
    engine::{CopyEngine, MmaEngine, engine},
    sync::LaunchControl,
};

/// Starts the matrix and bulk-copy engines of one unit. Each engine thread
/// exits once every handle cloned from the returned pair has been dropped.
pub fn spawn_engines<'scope, 'env, 'a>(
    scope: &'scope Scope<'scope, 'env>,
    control: &'a LaunchControl,
) -> (MmaEngine<'a>, CopyEngine<'a>)
where
    'a: 'scope,
{
    let (mma_queue, mma_worker) = engine("mma");
    let (copy_queue, copy_worker) = engine("copy");
    scope.spawn(move || mma_worker.run(control));
    scope.spawn(move || copy_worker.run(control));
    (MmaEngine::new(mma_queue), CopyEngine::new(copy_queue))
}
