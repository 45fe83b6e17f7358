use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::error::KernelError;

/// Launch-wide failure state shared by every partition and engine.
///
/// The first failure wins; every other party observes the abort at its next
/// barrier wait and unwinds with [`KernelError::Aborted`].
pub struct LaunchControl {
    aborted: AtomicBool,
    failure: Mutex<Option<KernelError>>,
    timeout: Duration,
}

impl LaunchControl {
    pub fn new(timeout: Duration) -> Self {
        Self {
            aborted: AtomicBool::new(false),
            failure: Mutex::new(None),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn fail(
        &self,
        error: KernelError,
    ) {
        let mut failure =
            self.failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if failure.is_none() && error != KernelError::Aborted {
            log::error!("Kernel launch failed: {error}");
            *failure = Some(error);
        }
        self.aborted.store(true, Ordering::Release);
    }

    /// Runs one partition body, recording its failure for the whole launch.
    pub fn run_partition<F>(
        &self,
        name: &str,
        body: F,
    ) where
        F: FnOnce() -> Result<(), KernelError>,
    {
        if let Err(error) = body() {
            log::debug!("Partition {name} stopped: {error}");
            self.fail(error);
        }
    }

    pub fn finish(self) -> Result<(), KernelError> {
        let failure = self
            .failure
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match failure {
            Some(error) => Err(error),
            None if self.aborted.into_inner() => Err(KernelError::Aborted),
            None => Ok(()),
        }
    }
}
