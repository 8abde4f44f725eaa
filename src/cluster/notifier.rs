use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

/// The outcome of waiting on a sequential notifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// The target commit and everything below it completed.
    Complete,
    /// The cancel flag tripped.
    Canceled,
    /// A commit at or below the target was rolled back.
    RolledBack,
}

/// Delivers "all commits up to N are complete" signals to waiting threads, in
/// commit order: waiters with smaller targets unblock first, since every
/// waiter re-checks only its own target on each advance. The high-water mark
/// never regresses.
///
/// A rollback poisons the notifier above the rollback point, failing waiters
/// beyond it; the poison clears once the mark advances past it (a later
/// successful commit replaced the rolled-back slot).
pub struct Notifier {
    inner: Mutex<Inner>,
    cond: Condvar,
}

struct Inner {
    /// All commits at or below this mark are complete.
    through: u64,
    /// Waiters with targets above this fail with RolledBack.
    poisoned_above: Option<u64>,
}

impl Notifier {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { through: 0, poisoned_above: None }), cond: Condvar::new() }
    }

    /// Blocks until all commits through `target` complete, the cancel flag
    /// trips, or a rollback poisons the target.
    pub fn wait_for(&self, target: u64, cancel: &AtomicBool) -> Wait {
        let mut inner = self.lock();
        loop {
            if let Some(above) = inner.poisoned_above {
                if target > above {
                    return Wait::RolledBack;
                }
            }
            if inner.through >= target {
                return Wait::Complete;
            }
            if cancel.load(Ordering::SeqCst) {
                return Wait::Canceled;
            }
            inner = self.cond.wait(inner).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Records that all commits through `n` are complete. Idempotent and
    /// monotone.
    pub fn notify_through(&self, n: u64) {
        let mut inner = self.lock();
        if n > inner.through {
            inner.through = n;
        }
        if let Some(above) = inner.poisoned_above {
            if inner.through > above {
                inner.poisoned_above = None;
            }
        }
        self.cond.notify_all();
    }

    /// Records that commit `count` was rolled back, failing current and
    /// future waiters with targets at or above it until the high-water mark
    /// passes it.
    pub fn rollback(&self, count: u64) {
        let mut inner = self.lock();
        let above = count.saturating_sub(1);
        inner.poisoned_above =
            Some(inner.poisoned_above.map_or(above, |existing| existing.min(above)));
        self.cond.notify_all();
    }

    /// Resets the notifier to a new baseline, clearing any poison.
    pub fn reset(&self, through: u64) {
        let mut inner = self.lock();
        inner.through = through;
        inner.poisoned_above = None;
        self.cond.notify_all();
    }

    /// The current high-water mark.
    pub fn through(&self) -> u64 {
        self.lock().through
    }

    /// Wakes all waiters, so they observe an externally tripped cancel flag.
    pub fn wake(&self) {
        let _inner = self.lock();
        self.cond.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
