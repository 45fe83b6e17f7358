use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::error::KernelError;

/// On-chip region owned by whoever the barrier protocol currently hands it to.
///
/// Access never blocks: if the region is already held, two parties touched it
/// in the same window and the handshake around it is broken.
pub struct SharedSlot<T> {
    name: String,
    cell: Mutex<T>,
}

impl<T> SharedSlot<T> {
    pub fn new(
        name: impl Into<String>,
        value: T,
    ) -> Self {
        Self {
            name: name.into(),
            cell: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self) -> Result<MutexGuard<'_, T>, KernelError> {
        match self.cell.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                Err(KernelError::SlotContention(self.name.clone()))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_access_is_reported() {
        let slot = SharedSlot::new("kv[1]", 0u32);
        let guard = slot.access().unwrap();
        assert_eq!(
            slot.access().err(),
            Some(KernelError::SlotContention("kv[1]".to_string()))
        );
        drop(guard);
        *slot.access().unwrap() = 7;
        assert_eq!(*slot.access().unwrap(), 7);
    }
}
