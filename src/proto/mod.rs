pub(crate) mod bdp;
pub(crate) mod control;
pub(crate) mod flow;
pub(crate) mod headers;
pub(crate) mod loopy;
pub(crate) mod stream;
pub(crate) mod transport;

use tokio::sync::Notify;

use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot, edge-triggered broadcast signal.
///
/// Equivalent to a channel that is closed exactly once: `fire` is
/// idempotent, and every current and future `wait` completes after the first
/// `fire`.
#[derive(Debug, Default)]
pub(crate) struct Event {
    fired: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    /// Fires the event. Returns true on the first call only.
    pub fn fire(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        // Interest must be registered before the flag is checked, otherwise a
        // fire between check and await would be lost.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_fired() {
            return;
        }
        notified.await;
        debug_assert!(self.is_fired());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fire_is_idempotent() {
        let event = Event::new();
        assert!(!event.is_fired());
        assert!(event.fire());
        assert!(!event.fire());
        assert!(!event.fire());
        assert!(event.is_fired());
    }

    #[tokio::test]
    async fn wait_completes_for_waiters_registered_before_and_after() {
        let event = Arc::new(Event::new());

        let early = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };
        tokio::task::yield_now().await;

        event.fire();
        early.await.unwrap();

        // A waiter arriving after the fire completes immediately.
        event.wait().await;
    }
}
