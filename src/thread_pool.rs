//! A worker thread pool for blocking or long-running work that must neither starve nor be
//!  starved by the async runtime's own blocking pool.
//!
//! Dedicated workers cycle `Idle -> Executing -> Idle` and retire after `idle_timeout` without
//!  work. After finishing an item, a worker drains the FIFO backlog before it goes idle, so there
//!  is no dispatcher thread.
//!
//! There is a race between a worker's idle timeout firing and a dispatcher handing it a new item.
//!  The dispatcher assigns under the pool lock, and a retiring worker removes itself from the
//!  idle list under the same lock - so if a retiring worker finds itself already removed, an item
//!  was assigned to it, and it redispatches that item before exiting.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};
use crate::error::{Result, TransportError};

type WorkItem = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPoolStrategy {
    /// always run on the async runtime's blocking pool
    AlwaysNative,
    /// use the runtime's blocking pool until `native_limit` items are in flight there
    NativeUntilExhaustion,
    /// dedicated threads for long duration items only
    DedicatedForLongDuration,
    AlwaysDedicated,
}

#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub strategy: ThreadPoolStrategy,
    pub max_threads: usize,
    /// if false, queueing a work item while all `max_threads` dedicated threads are busy fails
    pub allow_queueing: bool,
    pub idle_timeout: Duration,
    pub native_limit: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        ThreadPoolConfig {
            strategy: ThreadPoolStrategy::DedicatedForLongDuration,
            max_threads: 100,
            allow_queueing: true,
            idle_timeout: Duration::from_secs(60),
            native_limit: 128,
        }
    }
}

struct Worker {
    id: usize,
    slot: Mutex<Option<WorkItem>>,
    wake: Condvar,
}

struct PoolInner {
    idle_workers: Vec<Arc<Worker>>,
    num_threads: usize,
    next_worker_id: usize,
    backlog: VecDeque<WorkItem>,
}

struct PoolShared {
    config: ThreadPoolConfig,
    inner: Mutex<PoolInner>,
    native_in_flight: AtomicUsize,
}

pub struct GenericThreadPool {
    shared: Arc<PoolShared>,
    native: Option<Handle>,
}

impl GenericThreadPool {
    /// The runtime's blocking pool is used as the 'native' pool if this is called from inside a
    ///  tokio runtime. Otherwise all work goes to dedicated threads.
    pub fn new(config: ThreadPoolConfig) -> GenericThreadPool {
        GenericThreadPool {
            shared: Arc::new(PoolShared {
                config,
                inner: Mutex::new(PoolInner {
                    idle_workers: Vec::new(),
                    num_threads: 0,
                    next_worker_id: 0,
                    backlog: VecDeque::new(),
                }),
                native_in_flight: AtomicUsize::new(0),
            }),
            native: Handle::try_current().ok(),
        }
    }

    pub fn queue_user_work_item(&self, work: impl FnOnce() + Send + 'static, is_long_duration: bool) -> Result<()> {
        let config = &self.shared.config;
        let wants_native = match config.strategy {
            ThreadPoolStrategy::AlwaysNative => true,
            ThreadPoolStrategy::NativeUntilExhaustion => self.shared.native_in_flight.load(Ordering::Acquire) < config.native_limit,
            ThreadPoolStrategy::DedicatedForLongDuration => !is_long_duration,
            ThreadPoolStrategy::AlwaysDedicated => false,
        };

        match (&self.native, wants_native) {
            (Some(handle), true) => {
                self.run_native(handle, Box::new(work));
                Ok(())
            }
            _ => PoolShared::dispatch(&self.shared, Box::new(work), config.allow_queueing),
        }
    }

    fn run_native(&self, handle: &Handle, work: WorkItem) {
        trace!("running work item on the runtime's blocking pool");
        self.shared.native_in_flight.fetch_add(1, Ordering::AcqRel);
        let shared = self.shared.clone();
        handle.spawn_blocking(move || {
            run_guarded(work);
            shared.native_in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    pub fn num_threads(&self) -> usize {
        self.shared.inner.lock().unwrap().num_threads
    }

    pub fn num_idle_threads(&self) -> usize {
        self.shared.inner.lock().unwrap().idle_workers.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.shared.inner.lock().unwrap().backlog.len()
    }
}

impl PoolShared {
    fn dispatch(this: &Arc<PoolShared>, work: WorkItem, allow_queueing: bool) -> Result<()> {
        let mut inner = this.inner.lock().unwrap();

        if let Some(worker) = inner.idle_workers.pop() {
            trace!("assigning work item to idle worker {}", worker.id);
            *worker.slot.lock().unwrap() = Some(work);
            worker.wake.notify_one();
            return Ok(());
        }

        if inner.num_threads < this.config.max_threads {
            inner.num_threads += 1;
            let id = inner.next_worker_id;
            inner.next_worker_id += 1;
            drop(inner);

            debug!("starting dedicated worker thread {}", id);
            let worker = Arc::new(Worker {
                id,
                slot: Mutex::new(None),
                wake: Condvar::new(),
            });
            let shared = this.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("generic-pool-{}", id))
                .spawn(move || worker_loop(shared, worker, work));

            if let Err(e) = spawned {
                error!("could not start worker thread: {}", e);
                this.inner.lock().unwrap().num_threads -= 1;
                return Err(e.into());
            }
            return Ok(());
        }

        if allow_queueing {
            trace!("all {} worker threads busy: queueing work item", this.config.max_threads);
            inner.backlog.push_back(work);
            Ok(())
        }
        else {
            debug!("all {} worker threads busy and queueing is not allowed", this.config.max_threads);
            Err(TransportError::ThreadPoolLimitExceeded { max_threads: this.config.max_threads })
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, worker: Arc<Worker>, first: WorkItem) {
    let mut next = Some(first);

    loop {
        while let Some(work) = next.take() {
            run_guarded(work);
            next = shared.inner.lock().unwrap().backlog.pop_front();
        }

        {
            let mut inner = shared.inner.lock().unwrap();
            // re-check under the lock: the backlog may have been filled after the last check
            if let Some(work) = inner.backlog.pop_front() {
                next = Some(work);
                continue;
            }
            inner.idle_workers.push(worker.clone());
        }

        let slot = worker.slot.lock().unwrap();
        let (mut slot, _) = worker.wake
            .wait_timeout_while(slot, shared.config.idle_timeout, |assigned| assigned.is_none())
            .unwrap();
        if let Some(work) = slot.take() {
            next = Some(work);
            continue;
        }
        drop(slot);

        let was_idle = {
            let mut inner = shared.inner.lock().unwrap();
            inner.num_threads -= 1;
            match inner.idle_workers.iter().position(|w| Arc::ptr_eq(w, &worker)) {
                Some(idx) => {
                    inner.idle_workers.swap_remove(idx);
                    true
                }
                None => false,
            }
        };

        if !was_idle {
            // the assignment happened under the pool lock, so it is visible now
            if let Some(work) = worker.slot.lock().unwrap().take() {
                debug!("worker {} retiring with a freshly assigned work item - redispatching", worker.id);
                if let Err(e) = PoolShared::dispatch(&shared, work, true) {
                    error!("could not redispatch work item of retiring worker {}: {}", worker.id, e);
                }
            }
        }

        debug!("worker thread {} retired after idle timeout", worker.id);
        return;
    }
}

fn run_guarded(work: WorkItem) {
    if catch_unwind(AssertUnwindSafe(work)).is_err() {
        warn!("work item panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn dedicated_config(max_threads: usize, allow_queueing: bool, idle_timeout: Duration) -> ThreadPoolConfig {
        ThreadPoolConfig {
            strategy: ThreadPoolStrategy::AlwaysDedicated,
            max_threads,
            allow_queueing,
            idle_timeout,
            native_limit: 0,
        }
    }

    #[test]
    fn test_work_conservation_with_retiring_threads() {
        let pool = GenericThreadPool::new(dedicated_config(2, true, Duration::from_millis(1)));
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..50 {
            let counter = counter.clone();
            pool.queue_user_work_item(move || {
                if i % 7 == 0 {
                    std::thread::sleep(Duration::from_millis(3));
                }
                counter.fetch_add(1, Ordering::AcqRel);
            }, true).unwrap();
            if i % 10 == 0 {
                // give workers the chance to retire mid-run
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        assert!(wait_until(Duration::from_secs(10), || counter.load(Ordering::Acquire) == 50));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Acquire), 50);
        assert!(pool.num_threads() <= 2);
    }

    #[test]
    fn test_limit_exceeded_without_queueing() {
        let pool = GenericThreadPool::new(dedicated_config(1, false, Duration::from_secs(10)));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        pool.queue_user_work_item(move || { let _ = release_rx.recv(); }, true).unwrap();

        match pool.queue_user_work_item(|| {}, true) {
            Err(TransportError::ThreadPoolLimitExceeded { max_threads }) => assert_eq!(max_threads, 1),
            other => panic!("expected limit exceeded, was {:?}", other.err()),
        }
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_backlog_is_drained_in_order() {
        let pool = GenericThreadPool::new(dedicated_config(1, true, Duration::from_secs(10)));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let order = Arc::new(Mutex::new(Vec::new()));

        pool.queue_user_work_item(move || { let _ = release_rx.recv(); }, true).unwrap();
        for i in 0..5 {
            let order = order.clone();
            pool.queue_user_work_item(move || order.lock().unwrap().push(i), true).unwrap();
        }
        assert_eq!(pool.backlog_len(), 5);

        release_tx.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 5));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.num_threads(), 1);
    }

    #[test]
    fn test_idle_worker_is_reused() {
        let pool = GenericThreadPool::new(dedicated_config(4, true, Duration::from_secs(10)));
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        pool.queue_user_work_item(move || { c.fetch_add(1, Ordering::AcqRel); }, true).unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.num_idle_threads() == 1));

        let c = counter.clone();
        pool.queue_user_work_item(move || { c.fetch_add(1, Ordering::AcqRel); }, true).unwrap();
        assert!(wait_until(Duration::from_secs(5), || counter.load(Ordering::Acquire) == 2));
        assert_eq!(pool.num_threads(), 1);
    }

    #[test]
    fn test_idle_threads_retire() {
        let pool = GenericThreadPool::new(dedicated_config(4, true, Duration::from_millis(10)));
        pool.queue_user_work_item(|| {}, true).unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.num_threads() == 0));
        assert_eq!(pool.num_idle_threads(), 0);
    }

    #[test]
    fn test_panicking_item_does_not_kill_worker() {
        let pool = GenericThreadPool::new(dedicated_config(1, true, Duration::from_secs(10)));
        let counter = Arc::new(AtomicUsize::new(0));

        pool.queue_user_work_item(|| panic!("boom"), true).unwrap();
        let c = counter.clone();
        pool.queue_user_work_item(move || { c.fetch_add(1, Ordering::AcqRel); }, true).unwrap();

        assert!(wait_until(Duration::from_secs(5), || counter.load(Ordering::Acquire) == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_short_items_go_to_native_pool() {
        let pool = GenericThreadPool::new(ThreadPoolConfig {
            strategy: ThreadPoolStrategy::DedicatedForLongDuration,
            ..Default::default()
        });
        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.queue_user_work_item(move || { let _ = tx.send(std::thread::current().name().map(|n| n.to_string())); }, false).unwrap();

        let thread_name = rx.await.unwrap();
        assert!(!thread_name.unwrap_or_default().starts_with("generic-pool-"));
        assert_eq!(pool.num_threads(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_long_items_go_to_dedicated_threads() {
        let pool = GenericThreadPool::new(ThreadPoolConfig {
            strategy: ThreadPoolStrategy::DedicatedForLongDuration,
            ..Default::default()
        });
        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.queue_user_work_item(move || { let _ = tx.send(std::thread::current().name().map(|n| n.to_string())); }, true).unwrap();

        let thread_name = rx.await.unwrap();
        assert!(thread_name.unwrap().starts_with("generic-pool-"));
    }
}
