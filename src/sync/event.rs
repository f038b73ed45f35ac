//! Settable flags that can cascade into one another.
//!
//! A [`SyncEvent`] is a flag one thread sets and others wait on. Any number
//! of other events can be registered as cascade targets: setting the source
//! also sets every live target. This lets a thread wait for the first of
//! several unrelated conditions (see [`wait_any`]) without those conditions
//! knowing about each other.
//!
//! Targets are held weakly, a cascade never keeps its target alive.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct EventState {
    set: bool,
    cascades: Vec<Weak<SyncEvent>>,
}

/// A flag with a wait operation and optional cascade targets.
#[derive(Debug, Default)]
pub struct SyncEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl SyncEvent {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_set(&self) -> bool {
        self.lock().set
    }

    /// Sets the flag, wakes all waiters and sets every cascade target.
    pub fn set(&self) {
        let targets: Vec<Arc<SyncEvent>> = {
            let mut state = self.lock();
            state.set = true;
            state.cascades.retain(|target| target.strong_count() > 0);
            self.cond.notify_all();
            state.cascades.iter().filter_map(Weak::upgrade).collect()
        };
        // never hold our lock while setting another event
        for target in targets {
            target.set();
        }
    }

    /// Re-arms the flag.
    ///
    /// Only used for level-triggered flags such as a pipe's read flag.
    /// Targets that were already set through a cascade stay set.
    pub fn clear(&self) {
        self.lock().set = false;
    }

    /// Registers `target` to be set whenever this flag is set.
    ///
    /// If this flag is already set, `target` is set immediately.
    pub fn cascade_to(&self, target: &Arc<SyncEvent>) {
        let already_set = {
            let mut state = self.lock();
            state.cascades.retain(|target| target.strong_count() > 0);
            state.cascades.push(Arc::downgrade(target));
            state.set
        };
        if already_set {
            target.set();
        }
    }

    /// Blocks until the flag is set or `timeout` elapses.
    ///
    /// Expiry is silent, callers re-check [`is_set`](Self::is_set).
    pub fn wait(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.set {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Waits until any of `events` is set or `timeout` elapses.
pub fn wait_any(timeout: Duration, events: &[&SyncEvent]) {
    let waiter = Arc::new(SyncEvent::new());
    for event in events {
        event.cascade_to(&waiter);
    }
    waiter.wait(timeout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_is_idempotent() {
        let event = SyncEvent::new();
        assert!(!event.is_set());
        event.set();
        event.set();
        assert!(event.is_set());
    }

    #[test]
    fn cascade_propagates_on_set() {
        let a = SyncEvent::new();
        let b = Arc::new(SyncEvent::new());
        a.cascade_to(&b);
        assert!(!b.is_set());
        a.set();
        assert!(b.is_set());
    }

    #[test]
    fn cascade_registered_after_set_still_propagates() {
        let a = SyncEvent::new();
        a.set();
        let b = Arc::new(SyncEvent::new());
        a.cascade_to(&b);
        assert!(b.is_set());
    }

    #[test]
    fn cascade_does_not_keep_target_alive() {
        let a = SyncEvent::new();
        let b = Arc::new(SyncEvent::new());
        a.cascade_to(&b);
        let weak = Arc::downgrade(&b);
        drop(b);
        a.set();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn wait_times_out_silently() {
        let event = SyncEvent::new();
        let start = Instant::now();
        event.wait(Duration::from_millis(50));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!event.is_set());
    }

    #[test]
    fn wait_any_wakes_on_first_event() {
        let a = Arc::new(SyncEvent::new());
        let b = Arc::new(SyncEvent::new());
        let setter = {
            let b = b.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                b.set();
            })
        };
        let start = Instant::now();
        wait_any(Duration::from_secs(5), &[&*a, &*b]);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(b.is_set());
        assert!(!a.is_set());
        setter.join().unwrap();
    }
}
