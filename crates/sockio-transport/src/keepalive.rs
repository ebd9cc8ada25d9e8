//! One-shot timers behind the session heartbeat and timeout.
//!
//! A [`TimerSlot`] holds at most one armed timer. Re-arming or clearing the
//! slot cancels the previous timer, and every arming bumps a generation so a
//! timer task that already woke up can tell whether it is still the current
//! one before acting.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Which session timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// No inbound traffic for a heartbeat interval.
    Heartbeat,
    /// Heartbeat unanswered, or no poll attached for too long.
    Timeout,
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Slot holding the currently armed timer of one kind.
#[derive(Debug, Default)]
pub struct TimerSlot {
    generation: u64,
    armed: Option<ArmedTimer>,
}

impl TimerSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the slot, cancelling any previous timer.
    ///
    /// `on_fire` receives the generation of this arming and must hand it back
    /// to [`TimerSlot::fire`] before acting.
    pub fn arm<F, Fut>(&mut self, delay: Duration, on_fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.clear();
        self.generation += 1;
        let generation = self.generation;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation).await;
        });
        self.armed = Some(ArmedTimer { generation, handle });
    }

    /// Cancels the armed timer, if any.
    pub fn clear(&mut self) {
        if let Some(timer) = self.armed.take() {
            timer.handle.abort();
        }
    }

    /// Consumes the armed timer if `generation` is still current.
    ///
    /// Called from the timer task itself, so the task is detached rather
    /// than aborted.
    pub fn fire(&mut self, generation: u64) -> bool {
        match &self.armed {
            Some(timer) if timer.generation == generation => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    /// True while a timer is pending.
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut slot = TimerSlot::new();
        let counter = fired.clone();
        slot.arm(Duration::from_secs(1), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(slot.is_armed());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut slot = TimerSlot::new();
        for _ in 0..3 {
            let counter = fired.clone();
            slot.arm(Duration::from_secs(1), move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut slot = TimerSlot::new();
        let counter = fired.clone();
        slot.arm(Duration::from_secs(1), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        slot.clear();
        assert!(!slot.is_armed());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fire_checks_generation() {
        let mut slot = TimerSlot::new();
        slot.arm(Duration::from_secs(60), |_| async {});
        slot.arm(Duration::from_secs(60), |_| async {});
        assert!(!slot.fire(1));
        assert!(slot.fire(2));
        assert!(!slot.fire(2));
    }
}
