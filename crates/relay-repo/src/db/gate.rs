//! Transaction admission: the maintenance barrier and the per-thread
//! nesting guard.

use std::cell::Cell;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{RepoError, RepoResult};

thread_local! {
    static IN_TRANSACTION: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a store transaction.
///
/// A second guard on the same thread fails with
/// [`RepoError::NestedTransaction`]; SQLite cannot nest `BEGIN` and the writer
/// connection is not reentrant, so nesting would deadlock or silently join
/// the outer transaction.
pub(crate) struct NestingGuard(());

impl NestingGuard {
    pub(crate) fn enter() -> RepoResult<Self> {
        IN_TRANSACTION.with(|flag| {
            if flag.get() {
                Err(RepoError::NestedTransaction)
            } else {
                flag.set(true);
                Ok(NestingGuard(()))
            }
        })
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        IN_TRANSACTION.with(|flag| flag.set(false));
    }
}

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    maintenance: bool,
}

/// Counts in-flight transactions so maintenance can run with none active.
#[derive(Debug, Default)]
pub(crate) struct TxGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl TxGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a transaction, waiting while maintenance is running.
    pub(crate) fn enter(&self) -> TxPermit<'_> {
        let mut state = self.lock();
        while state.maintenance {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.active += 1;
        TxPermit { gate: self }
    }

    /// Block new transactions and wait for in-flight ones to drain.
    pub(crate) fn exclusive(&self) -> ExclusivePermit<'_> {
        let mut state = self.lock();
        while state.maintenance {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.maintenance = true;
        while state.active > 0 {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        ExclusivePermit { gate: self }
    }

    pub(crate) fn active(&self) -> usize {
        self.lock().active
    }
}

pub(crate) struct TxPermit<'a> {
    gate: &'a TxGate,
}

impl Drop for TxPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.active -= 1;
        if state.active == 0 {
            self.gate.changed.notify_all();
        }
    }
}

pub(crate) struct ExclusivePermit<'a> {
    gate: &'a TxGate,
}

impl Drop for ExclusivePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.maintenance = false;
        self.gate.changed.notify_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_nesting_guard_rejects_second_entry() {
        let outer = NestingGuard::enter().unwrap();
        assert!(matches!(
            NestingGuard::enter(),
            Err(RepoError::NestedTransaction)
        ));
        drop(outer);
        assert!(NestingGuard::enter().is_ok());
    }

    #[test]
    fn test_nesting_guard_is_per_thread() {
        let _outer = NestingGuard::enter().unwrap();
        let other = thread::spawn(|| NestingGuard::enter().is_ok())
            .join()
            .unwrap();
        assert!(other);
    }

    #[test]
    fn test_exclusive_waits_for_active_transactions() {
        let gate = Arc::new(TxGate::default());
        let permit = gate.enter();
        assert_eq!(gate.active(), 1);

        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let gate = Arc::clone(&gate);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let _exclusive = gate.exclusive();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        drop(permit);
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn test_enter_waits_for_maintenance() {
        let gate = Arc::new(TxGate::default());
        let exclusive = gate.exclusive();

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _permit = gate.enter();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        drop(exclusive);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
