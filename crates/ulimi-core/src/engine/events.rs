//! Async signalling primitives for the engine loop.
//!
//! [`CounterEvent`] is the forward gate: `clear` is idempotent but counts,
//! `set` decrements and only wakes waiters at zero, so nested pipeline stages
//! cannot lose a wakeup. [`Event`] is a plain manual-reset flag.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Manual-reset event: `wait` parks until `set`.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().expect("event poisoned")
    }

    pub fn set(&self) {
        *self.flag.lock().expect("event poisoned") = true;
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        *self.flag.lock().expect("event poisoned") = false;
    }

    pub async fn wait(&self) {
        loop {
            // register before checking to avoid a lost wakeup
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
struct CounterState {
    count: u64,
    set: bool,
}

/// Counting gate admitting or blocking state mutation mid-pipeline.
#[derive(Debug, Default)]
pub struct CounterEvent {
    state: Mutex<CounterState>,
    notify: Notify,
}

impl CounterEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().expect("event poisoned").set
    }

    /// Decrement the pending count; fires waiters when it reaches zero.
    pub fn set(&self) {
        let mut state = self.state.lock().expect("event poisoned");
        if state.count > 0 {
            state.count -= 1;
        }
        if state.count == 0 {
            state.set = true;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Increment the pending count, lowering the gate.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("event poisoned");
        if state.count == 0 && state.set {
            state.set = false;
        }
        state.count += 1;
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Binary signal that the scheduler has something to do. Setting while no
/// work remains clears instead, so the main loop never spins on an empty
/// scheduler.
#[derive(Debug, Default)]
pub struct RunableEvent {
    event: Event,
}

impl RunableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, has_unfinished: bool) {
        if has_unfinished {
            self.event.set();
        } else {
            self.event.clear();
        }
    }

    pub async fn wait(&self) {
        self.event.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_counter_event_nests() {
        let event = CounterEvent::new();
        event.set();
        assert!(event.is_set());

        event.clear();
        event.clear();
        assert!(!event.is_set());
        event.set();
        // one of two clears still pending
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn test_counter_event_wakes_waiter() {
        let event = Arc::new(CounterEvent::new());
        event.clear();
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        event.set();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_runable_event_clears_when_idle() {
        let event = RunableEvent::new();
        event.set(true);
        event.set(false);
        let wait = event.wait();
        tokio::pin!(wait);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut wait).await.is_err());
    }
}
