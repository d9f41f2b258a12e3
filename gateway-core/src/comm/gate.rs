use portable_atomic::{AtomicBool, Ordering};

/// Binary lock serialising every network transfer.
///
/// Unlike a scoped mutex guard the gate is held across many orchestrator
/// wake-ups while a transfer is polled, so locking and unlocking are explicit.
#[derive(Debug, Default)]
pub struct SingleFlightGate {
    locked: AtomicBool,
}

impl SingleFlightGate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Takes the gate without blocking. Returns `false` if it is already held.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_is_refused_until_unlock() {
        let gate = SingleFlightGate::new();
        assert!(gate.try_lock());
        assert!(!gate.try_lock());
        assert!(gate.is_locked());

        gate.unlock();
        assert!(!gate.is_locked());
        assert!(gate.try_lock());
    }
}
