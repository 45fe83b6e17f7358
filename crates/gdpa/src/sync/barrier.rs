use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use super::LaunchControl;
use crate::error::KernelError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct PhaseState {
    pending_arrivals: u32,
    pending_bytes: i64,
    completed_phases: u32,
}

/// Phase barrier with arrival and transaction-byte accounting.
///
/// A phase completes once the expected number of arrivals has been seen and
/// every byte announced with [`MBarrier::arrive_expect_tx`] has landed.
/// Waiters name the parity of the phase they wait for; the wait returns as
/// soon as the barrier's current phase has a different parity. A fresh
/// barrier therefore lets a wait on parity 1 through immediately.
pub struct MBarrier {
    name: String,
    arrival_count: u32,
    state: Mutex<PhaseState>,
    phase_completed: Condvar,
}

impl MBarrier {
    pub fn new(
        name: impl Into<String>,
        arrival_count: u32,
    ) -> Self {
        Self {
            name: name.into(),
            arrival_count,
            state: Mutex::new(PhaseState {
                pending_arrivals: arrival_count,
                pending_bytes: 0,
                completed_phases: 0,
            }),
            phase_completed: Condvar::new(),
        }
    }

    /// One barrier per buffer slot, named `name[index]`.
    pub fn array(
        name: &str,
        buffers: usize,
        arrival_count: u32,
    ) -> Vec<Self> {
        (0..buffers)
            .map(|index| Self::new(format!("{name}[{index}]"), arrival_count))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn completed_phases(&self) -> u32 {
        self.lock_state().completed_phases
    }

    pub fn arrive(&self) {
        let mut state = self.lock_state();
        state.pending_arrivals = state.pending_arrivals.saturating_sub(1);
        self.try_complete(&mut state);
    }

    pub fn arrive_expect_tx(
        &self,
        bytes: usize,
    ) {
        let mut state = self.lock_state();
        state.pending_bytes += bytes as i64;
        state.pending_arrivals = state.pending_arrivals.saturating_sub(1);
        self.try_complete(&mut state);
    }

    pub fn complete_tx(
        &self,
        bytes: usize,
    ) {
        let mut state = self.lock_state();
        state.pending_bytes -= bytes as i64;
        self.try_complete(&mut state);
    }

    pub fn try_wait(
        &self,
        parity: u32,
    ) -> bool {
        self.lock_state().completed_phases & 1 != parity
    }

    pub fn wait(
        &self,
        parity: u32,
        control: &LaunchControl,
    ) -> Result<(), KernelError> {
        let deadline = Instant::now() + control.timeout();
        let mut state = self.lock_state();
        while state.completed_phases & 1 == parity {
            if control.is_aborted() {
                return Err(KernelError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                let error = KernelError::BarrierTimeout {
                    barrier: self.name.clone(),
                    parity,
                    timeout_ms: control.timeout().as_millis(),
                };
                control.fail(error.clone());
                return Err(error);
            }
            let (guard, _) = self
                .phase_completed
                .wait_timeout(state, POLL_INTERVAL.min(deadline - now))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
        Ok(())
    }

    /// Waits only when `predicate` holds, mirroring a predicated wait.
    pub fn wait_if(
        &self,
        parity: u32,
        predicate: bool,
        control: &LaunchControl,
    ) -> Result<(), KernelError> {
        if predicate {
            self.wait(parity, control)?;
        }
        Ok(())
    }

    fn try_complete(
        &self,
        state: &mut PhaseState,
    ) {
        if state.pending_arrivals == 0 && state.pending_bytes == 0 {
            state.completed_phases = state.completed_phases.wrapping_add(1);
            state.pending_arrivals = self.arrival_count;
            self.phase_completed.notify_all();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PhaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::sync::PhaseCounter;

    fn control() -> LaunchControl {
        LaunchControl::new(Duration::from_secs(5))
    }

    #[test]
    fn test_fresh_barrier_passes_producer_parity() {
        let barrier = MBarrier::new("empty", 1);
        assert!(barrier.try_wait(1));
        assert!(!barrier.try_wait(0));
        barrier.arrive();
        assert!(barrier.try_wait(0));
        assert!(!barrier.try_wait(1));
        assert_eq!(barrier.completed_phases(), 1);
    }

    #[test]
    fn test_phase_needs_all_arrivals() {
        let barrier = MBarrier::new("p_ready", 2);
        barrier.arrive();
        assert_eq!(barrier.completed_phases(), 0);
        barrier.arrive();
        assert_eq!(barrier.completed_phases(), 1);
    }

    #[test]
    fn test_phase_needs_all_transaction_bytes() {
        let barrier = MBarrier::new("kv_full", 1);
        barrier.arrive_expect_tx(256);
        assert_eq!(barrier.completed_phases(), 0);
        barrier.complete_tx(128);
        assert_eq!(barrier.completed_phases(), 0);
        barrier.complete_tx(128);
        assert_eq!(barrier.completed_phases(), 1);
    }

    #[test]
    fn test_unsatisfied_wait_times_out() {
        let control = LaunchControl::new(Duration::from_millis(50));
        let barrier = MBarrier::new("o_full", 1);
        let error = barrier.wait(0, &control).unwrap_err();
        assert_eq!(
            error,
            KernelError::BarrierTimeout {
                barrier: "o_full".to_string(),
                parity: 0,
                timeout_ms: 50,
            }
        );
        assert!(control.is_aborted());
    }

    #[test]
    fn test_abort_releases_waiters() {
        let control = control();
        let barrier = MBarrier::new("qk_full", 1);
        thread::scope(|scope| {
            let waiter = scope.spawn(|| barrier.wait(0, &control));
            control.fail(KernelError::SlotContention("qk[0]".to_string()));
            assert_eq!(waiter.join().unwrap(), Err(KernelError::Aborted));
        });
    }

    #[test]
    fn test_wait_if_skips_when_predicate_false() {
        let control = LaunchControl::new(Duration::from_millis(10));
        let barrier = MBarrier::new("o_empty", 1);
        assert!(barrier.wait_if(0, false, &control).is_ok());
        assert!(!control.is_aborted());
    }

    #[test]
    fn test_full_empty_handshake_over_two_slots() {
        let control = control();
        let full = MBarrier::array("full", 2, 1);
        let empty = MBarrier::array("empty", 2, 1);
        let slots = [Mutex::new(0usize), Mutex::new(0usize)];
        let rounds = 50;

        let received = thread::scope(|scope| {
            scope.spawn(|| {
                let mut counter = PhaseCounter::new(2);
                for value in 0..rounds {
                    let at = counter.next();
                    empty[at.index].wait(at.producer_phase(), &control)?;
                    *slots[at.index].lock().unwrap() = value;
                    full[at.index].arrive();
                }
                Ok::<(), KernelError>(())
            });
            let consumer = scope.spawn(|| {
                let mut counter = PhaseCounter::new(2);
                let mut received = Vec::new();
                for _ in 0..rounds {
                    let at = counter.next();
                    full[at.index].wait(at.phase, &control)?;
                    received.push(*slots[at.index].lock().unwrap());
                    empty[at.index].arrive();
                }
                Ok::<Vec<usize>, KernelError>(received)
            });
            consumer.join().unwrap()
        })
        .unwrap();

        assert_eq!(received, (0..rounds).collect::<Vec<_>>());
    }
}
