use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

#[derive(Debug, Default)]
struct PermitState {
    used: usize,
    waiting: usize,
}

/// Host-wide gate bounding how many devices may run fastboot at once.
///
/// A `None` limit never blocks but still counts permits so callers can report on them.
#[derive(Debug)]
pub struct FlashPermitCoordinator {
    limit: Option<usize>,
    state: Mutex<PermitState>,
    cv: Condvar,
    acquired_total: AtomicUsize,
    released_total: AtomicUsize,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FlashPermitCoordinator {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit: limit.map(|value| value.max(1)),
            state: Mutex::new(PermitState::default()),
            cv: Condvar::new(),
            acquired_total: AtomicUsize::new(0),
            released_total: AtomicUsize::new(0),
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    fn lock_state(&self) -> MutexGuard<'_, PermitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a flashing slot is free.
    pub fn acquire(self: &Arc<Self>) -> FlashPermit {
        let requested_at = Instant::now();
        let mut state = self.lock_state();
        if let Some(limit) = self.limit {
            info!(
                limit,
                queue_length = state.waiting,
                "requesting a flashing permit"
            );
            state.waiting += 1;
            while state.used >= limit {
                state = self
                    .cv
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.waiting -= 1;
        }
        state.used += 1;
        drop(state);
        self.acquired_total.fetch_add(1, Ordering::SeqCst);

        let queue_wait = requested_at.elapsed();
        debug!(queue_wait_ms = queue_wait.as_millis() as u64, "flashing permit acquired");
        FlashPermit {
            coordinator: Arc::clone(self),
            queue_wait,
            acquired_at: Instant::now(),
        }
    }

    fn release(&self) {
        let mut state = self.lock_state();
        state.used = state.used.saturating_sub(1);
        drop(state);
        self.released_total.fetch_add(1, Ordering::SeqCst);
        self.cv.notify_one();
    }

    pub fn available_permits(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.lock_state().used),
            None => usize::MAX,
        }
    }

    pub fn queue_length(&self) -> usize {
        self.lock_state().waiting
    }

    pub fn acquired_total(&self) -> usize {
        self.acquired_total.load(Ordering::SeqCst)
    }

    pub fn released_total(&self) -> usize {
        self.released_total.load(Ordering::SeqCst)
    }

    /// Lock serializing every flash of one device.
    pub fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut guard = self
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Released when dropped, on every exit path.
#[derive(Debug)]
pub struct FlashPermit {
    coordinator: Arc<FlashPermitCoordinator>,
    queue_wait: Duration,
    acquired_at: Instant,
}

impl FlashPermit {
    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for FlashPermit {
    fn drop(&mut self) {
        debug!(held_ms = self.held_for().as_millis() as u64, "returning flashing permit");
        self.coordinator.release();
    }
}

/// Permit held across a flash that can be handed back while the device is off
/// fastboot (adb-side userdata work, reboot waits) and taken again afterwards.
#[derive(Debug)]
pub struct PermitSlot {
    coordinator: Arc<FlashPermitCoordinator>,
    permit: Option<FlashPermit>,
    queue_wait: Duration,
}

impl PermitSlot {
    pub fn acquire(coordinator: &Arc<FlashPermitCoordinator>) -> Self {
        let permit = coordinator.acquire();
        Self {
            coordinator: Arc::clone(coordinator),
            queue_wait: permit.queue_wait(),
            permit: Some(permit),
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }

    pub fn release(&mut self) {
        self.permit = None;
    }

    pub fn reacquire(&mut self) {
        if self.permit.is_none() {
            let permit = self.coordinator.acquire();
            self.queue_wait += permit.queue_wait();
            self.permit = Some(permit);
        }
    }

    /// Total time spent queueing for this slot.
    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }
}
