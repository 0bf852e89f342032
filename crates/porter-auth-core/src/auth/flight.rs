use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Allows one operation at a time. A second caller is turned away rather
/// than queued.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. The returned guard releases it on drop, including
    /// when the owning future is dropped mid-flight. The guard owns its
    /// flag, so it can move into a spawned task.
    pub(crate) fn try_begin(&self) -> Option<FlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) struct FlightGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_caller_is_rejected_until_release() {
        let flight = SingleFlight::new();
        let guard = flight.try_begin();
        assert!(guard.is_some());
        assert!(flight.is_busy());
        assert!(flight.try_begin().is_none());

        drop(guard);
        assert!(!flight.is_busy());
        assert!(flight.try_begin().is_some());
    }

    #[test]
    fn test_guard_outlives_borrow_of_flight() {
        let flight = SingleFlight::new();
        let guard = flight.try_begin().unwrap();
        let handle = std::thread::spawn(move || drop(guard));
        handle.join().unwrap();
        assert!(!flight.is_busy());
    }
}
