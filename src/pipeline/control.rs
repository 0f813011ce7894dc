//! Shared cancellation and pause signals.
//!
//! Cancellation is checked at the top of every wait loop and before starting
//! each new unit of work, never mid-unit. Pause is a separate gate checked
//! between units, so pausing never interrupts a unit already in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Cooperative cancellation flag shared across the whole run.
#[derive(Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Pause gate for stages that process a queue of independent units.
#[derive(Clone)]
pub struct PauseGate {
    paused: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block while paused. Returns early when cancellation fires so a paused
    /// run can still be cancelled.
    pub async fn wait_if_paused(&self, cancel: &CancelFlag) {
        while self.is_paused() && !cancel.is_cancelled() {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag() {
        let cancel = CancelFlag::new();
        assert!(!cancel.is_cancelled());
        let clone = cancel.clone();
        clone.cancel();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_pause_gate_resume() {
        let gate = PauseGate::new();
        let cancel = CancelFlag::new();
        gate.pause();

        let gate2 = gate.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move {
            gate2.wait_if_paused(&cancel2).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after resume")
            .unwrap();
    }

    #[tokio::test]
    async fn test_pause_gate_honors_cancel() {
        let gate = PauseGate::new();
        let cancel = CancelFlag::new();
        gate.pause();
        cancel.cancel();
        // Must return promptly even though the gate is still paused.
        tokio::time::timeout(Duration::from_secs(1), gate.wait_if_paused(&cancel))
            .await
            .expect("cancelled wait should return");
    }
}
