//! Bus health state and graceful drain of in-flight requests.
//!
//! The engine and `BusContext::process` take an [`InFlightGuard`] per request.
//! Shutdown moves the bus to `Draining`, which refuses new guards, then
//! waits for the outstanding ones to drop before the QoS modules stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

/// Bus health. Moves only forward: Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthState {
    /// Modules are initializing; requests are already accepted.
    Starting,
    Ready,
    /// New requests are refused while in-flight ones finish.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn accepts_requests(self) -> bool {
        self < Self::Draining
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    drained: Notify,
}

/// Tracks health and in-flight requests for one bus.
#[derive(Debug)]
pub struct ShutdownController {
    health: watch::Sender<HealthState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            health: watch::Sender::new(HealthState::Starting),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Marks the bus ready. Ignored once draining has begun.
    pub fn set_ready(&self) {
        self.advance(HealthState::Ready);
    }

    /// Starts draining: new requests are refused from now on.
    pub fn trigger_shutdown(&self) {
        self.advance(HealthState::Draining);
    }

    fn advance(&self, next: HealthState) {
        self.health.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        *self.health.borrow()
    }

    /// Receiver observing every health transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.health.subscribe()
    }

    /// Registers a request, or returns `None` once draining.
    #[must_use]
    pub fn try_enter(&self) -> Option<InFlightGuard> {
        if !self.health_state().accepts_requests() {
            return None;
        }
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        Some(InFlightGuard {
            in_flight: self.in_flight.clone(),
        })
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no request is in flight, for at most `timeout`.
    ///
    /// On success the state becomes `Stopped` and `true` is returned; on
    /// timeout the state is left as is and `false` is returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.in_flight.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight_count() == 0 {
                self.advance(HealthState::Stopped);
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one request in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_accepted_until_draining() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        assert!(controller.try_enter().is_some());

        controller.set_ready();
        let first = controller.try_enter().unwrap();
        let second = controller.try_enter().unwrap();
        assert_eq!(controller.in_flight_count(), 2);
        drop(first);
        assert_eq!(controller.in_flight_count(), 1);

        controller.trigger_shutdown();
        assert!(controller.try_enter().is_none());
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn health_never_moves_backwards() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(!HealthState::Stopped.accepts_requests());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let controller = ShutdownController::new();
        let mut health = controller.subscribe();

        controller.set_ready();
        health.changed().await.unwrap();
        assert_eq!(*health.borrow_and_update(), HealthState::Ready);

        controller.trigger_shutdown();
        health.changed().await.unwrap();
        assert_eq!(*health.borrow_and_update(), HealthState::Draining);
    }

    #[tokio::test]
    async fn drain_completes_when_last_guard_drops() {
        let controller = ShutdownController::new();
        let guard = controller.try_enter().unwrap();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_requests_outstanding() {
        let controller = ShutdownController::new();
        let _guard = controller.try_enter().unwrap();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(500)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }
}
