use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, trace};

/// A reusable binary signal: it is either set or not, and any number of tasks can wait for it
///  to become set. Setting is level-triggered, i.e. waiting on a set event returns immediately.
///
/// Clones share the same underlying signal.
#[derive(Clone)]
pub struct Event {
    signal: Arc<watch::Sender<bool>>,
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event{{set:{}}}", self.is_set())
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

impl Event {
    pub fn new() -> Event {
        let (signal, _) = watch::channel(false);
        Event {
            signal: Arc::new(signal),
        }
    }

    pub fn set(&self) {
        self.signal.send_replace(true);
    }

    pub fn reset(&self) {
        self.signal.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.signal.borrow()
    }

    pub async fn wait(&self) {
        let mut receiver = self.signal.subscribe();
        // the sender lives as long as `self`, so this can not fail
        let _ = receiver.wait_for(|is_set| *is_set).await;
    }

    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.signal) > 1
    }
}

/// A bounded free list of [Event]s. Obtained events are always reset.
pub struct EventPool {
    max_pool_size: usize,
    events: Mutex<Vec<Event>>,
}

impl EventPool {
    pub fn new(max_pool_size: usize) -> EventPool {
        EventPool {
            max_pool_size,
            events: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn obtain(&self) -> Event {
        if let Some(event) = self.events.lock().unwrap().pop() {
            trace!("returning event from pool");
            event.reset();
            return event;
        }
        trace!("no event in pool: creating new event");
        Event::new()
    }

    /// Hands an event back. Events that still have clones elsewhere are discarded, since
    ///  somebody could still set or wait for them.
    pub fn recycle(&self, event: Event) {
        if event.is_shared() {
            debug!("discarding event that is still referenced elsewhere");
            return;
        }

        let mut events = self.events.lock().unwrap();
        if events.len() < self.max_pool_size {
            events.push(event);
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}
