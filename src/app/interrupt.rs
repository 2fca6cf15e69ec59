use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::app::error::FlashError;

/// Host-level cancellation switch shared by the flasher and the command runner.
///
/// Cancellation is only honoured while the gate is interruptible. A request that
/// arrives while a partition write is in flight waits for the next safe point.
/// One gate may be shared by every device on the host, so guards nest: the gate
/// stays closed while any guard is alive.
#[derive(Debug)]
pub struct InterruptGate {
    guards: AtomicUsize,
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl Default for InterruptGate {
    fn default() -> Self {
        Self {
            guards: AtomicUsize::new(0),
            requested: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }
}

impl InterruptGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_interrupt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "interrupt requested");
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_interruptible(&self) -> bool {
        self.guards.load(Ordering::SeqCst) == 0
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// True when a running command may be killed now.
    pub fn should_interrupt(&self) -> bool {
        self.is_interruptible() && self.is_requested()
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "cancellation requested".to_string())
    }

    /// Blocks interruption until the guard is dropped.
    pub fn uninterruptible(&self) -> UninterruptibleGuard<'_> {
        self.guards.fetch_add(1, Ordering::SeqCst);
        UninterruptibleGuard { gate: self }
    }

    /// Fails if a cancellation is pending. Callers place this between writes,
    /// where stopping leaves the device in a recoverable state.
    pub fn safe_point(&self, serial: &str, label: &str) -> Result<(), FlashError> {
        if self.is_requested() {
            let reason = self.reason();
            info!(serial = %serial, at = %label, reason = %reason, "honouring interrupt at safe point");
            return Err(FlashError::interrupted(
                serial,
                format!("{reason} (stopped at {label})"),
            ));
        }
        Ok(())
    }
}

pub struct UninterruptibleGuard<'a> {
    gate: &'a InterruptGate,
}

impl Drop for UninterruptibleGuard<'_> {
    fn drop(&mut self) {
        self.gate.guards.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_deferred_while_uninterruptible() {
        let gate = InterruptGate::new();
        {
            let _guard = gate.uninterruptible();
            gate.request_interrupt("host shutdown");
            assert!(!gate.should_interrupt());
            let err = gate.safe_point("HT7A1", "after bootloader").unwrap_err();
            assert_eq!(err.code(), "ERR_INTERRUPTED");
            assert!(err.message().contains("after bootloader"));
            assert!(!gate.is_interruptible());
        }
        assert!(gate.is_interruptible());
        assert!(gate.should_interrupt());
    }

    #[test]
    fn overlapping_guards_keep_gate_closed_until_last_drop() {
        let gate = InterruptGate::new();
        let first = gate.uninterruptible();
        let second = gate.uninterruptible();
        drop(first);
        gate.request_interrupt("host shutdown");
        assert!(!gate.is_interruptible());
        assert!(!gate.should_interrupt());
        drop(second);
        assert!(gate.should_interrupt());
    }

    #[test]
    fn guards_from_other_threads_hold_the_shared_gate() {
        let gate = std::sync::Arc::new(InterruptGate::new());
        let _local = gate.uninterruptible();
        let remote = gate.clone();
        std::thread::spawn(move || {
            let _guard = remote.uninterruptible();
        })
        .join()
        .expect("join");
        assert!(!gate.is_interruptible());
    }

    #[test]
    fn safe_point_passes_without_request() {
        let gate = InterruptGate::new();
        let _guard = gate.uninterruptible();
        assert!(gate.safe_point("HT7A1", "between partitions").is_ok());
    }
}
