use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use rustc_hash::FxHashMap;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Something that needs periodic housekeeping: expiring timeouts, sweeping stale state etc.
#[cfg_attr(test, automock)]
pub trait TimerConsumer: Send + Sync + 'static {
    fn on_timer(&self, now: Instant);
}

#[derive(Default)]
struct Consumers {
    next_id: u64,
    by_id: FxHashMap<u64, Arc<dyn TimerConsumer>>,
}

/// A single periodic timer shared by all consumers of a process (or of a test).
///
/// Registering returns a [TimerSubscription]; the consumer stays registered until the
///  subscription is dropped or explicitly unregistered.
pub struct TimerService {
    consumers: Arc<Mutex<Consumers>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

    /// Creates a timer service without starting it - see [TimerService::start]
    pub fn new() -> Arc<TimerService> {
        Arc::new(TimerService {
            consumers: Default::default(),
            ticker: Mutex::new(None),
        })
    }

    /// Spawns the periodic tick on the current tokio runtime. Calling this repeatedly has no
    ///  further effect.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.is_some() {
            return;
        }

        debug!("starting timer service with a period of {:?}", period);
        let service = Arc::downgrade(self);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // the first tick completes immediately
            loop {
                let now = interval.tick().await;
                match service.upgrade() {
                    Some(service) => service.tick(now),
                    None => break,
                }
            }
        }));
    }

    pub fn register(&self, consumer: Arc<dyn TimerConsumer>) -> TimerSubscription {
        let mut consumers = self.consumers.lock().unwrap();
        let id = consumers.next_id;
        consumers.next_id += 1;
        consumers.by_id.insert(id, consumer);

        TimerSubscription {
            id,
            consumers: Arc::downgrade(&self.consumers),
        }
    }

    pub fn num_consumers(&self) -> usize {
        self.consumers.lock().unwrap().by_id.len()
    }

    /// Invokes all registered consumers. A panicking consumer is logged and skipped, it does not
    ///  keep the others from being called.
    pub fn tick(&self, now: Instant) {
        let consumers = self.consumers.lock().unwrap()
            .by_id.values()
            .cloned()
            .collect::<Vec<_>>();

        trace!("timer tick for {} consumers", consumers.len());
        for consumer in consumers {
            if catch_unwind(AssertUnwindSafe(|| consumer.on_timer(now))).is_err() {
                warn!("timer consumer panicked");
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.abort();
        }
    }
}

/// Keeps a [TimerConsumer] registered. Dropping it unregisters the consumer.
pub struct TimerSubscription {
    id: u64,
    consumers: Weak<Mutex<Consumers>>,
}

impl TimerSubscription {
    pub fn unregister(self) {
        // Drop does the work
    }
}

impl Drop for TimerSubscription {
    fn drop(&mut self) {
        if let Some(consumers) = self.consumers.upgrade() {
            consumers.lock().unwrap().by_id.remove(&self.id);
        }
    }
}
