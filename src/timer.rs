//! Deadline timers backing the engine's periodic pass and client watchdogs.
//!
//! [`ThreadTimer`] fires callbacks on a dedicated thread against the host
//! clock. [`ManualTimer`] keeps a virtual clock that only moves when told to,
//! firing due callbacks on the caller's thread.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::clock::monotonic_timestamp_ns;

/// Work run when a timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Source of time and one-shot deadline callbacks.
pub trait TimerService: Send + Sync {
    /// Current time in nanoseconds on this service's clock.
    fn now_ns(&self) -> u64;

    /// Run `callback` once the clock reaches `deadline_ns`.
    fn schedule(&self, deadline_ns: u64, callback: TimerCallback) -> TimerId;

    /// Remove a pending callback. Returns `true` only if it had not started.
    fn cancel(&self, id: TimerId) -> bool;
}

#[derive(Default)]
struct TimerQueue {
    next_id: u64,
    pending: BTreeMap<(u64, u64), TimerCallback>,
    deadlines: HashMap<u64, u64>,
}

impl TimerQueue {
    fn insert(&mut self, deadline_ns: u64, callback: TimerCallback) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert((deadline_ns, id), callback);
        self.deadlines.insert(id, deadline_ns);
        TimerId(id)
    }

    fn remove(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id.0) {
            Some(deadline) => self.pending.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    fn pop_due(&mut self, now_ns: u64) -> Option<(u64, TimerCallback)> {
        let (&(deadline, id), _) = self.pending.first_key_value()?;
        if deadline > now_ns {
            return None;
        }
        self.deadlines.remove(&id);
        self.pending
            .remove(&(deadline, id))
            .map(|callback| (deadline, callback))
    }

    fn next_deadline(&self) -> Option<u64> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

struct ThreadTimerShared {
    queue: Mutex<TimerQueue>,
    wake: Condvar,
    shutdown: AtomicBool,
}

/// Timer service firing callbacks on its own thread.
pub struct ThreadTimer {
    shared: Arc<ThreadTimerShared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl ThreadTimer {
    /// Spawn the timer thread.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(ThreadTimerShared {
            queue: Mutex::new(TimerQueue::default()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_timer_thread(&thread_shared))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            shared,
            worker: Some(worker),
            worker_id,
        })
    }
}

fn run_timer_thread(shared: &ThreadTimerShared) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let now = monotonic_timestamp_ns();
        if let Some((_, callback)) = queue.pop_due(now) {
            MutexGuard::unlocked(&mut queue, callback);
            continue;
        }
        match queue.next_deadline() {
            Some(deadline) => {
                let wait = Duration::from_nanos(deadline.saturating_sub(now));
                shared.wake.wait_for(&mut queue, wait);
            }
            None => shared.wake.wait(&mut queue),
        }
    }
}

impl TimerService for ThreadTimer {
    fn now_ns(&self) -> u64 {
        monotonic_timestamp_ns()
    }

    fn schedule(&self, deadline_ns: u64, callback: TimerCallback) -> TimerId {
        let id = self.shared.queue.lock().insert(deadline_ns, callback);
        self.shared.wake.notify_one();
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        self.shared.queue.lock().remove(id)
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        {
            let _queue = self.shared.queue.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.wake.notify_all();
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Virtual-clock timer service for deterministic tests and offline rendering.
#[derive(Default)]
pub struct ManualTimer {
    now: AtomicU64,
    queue: Mutex<TimerQueue>,
}

impl ManualTimer {
    /// Timer whose clock starts at `start_ns`.
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
            queue: Mutex::new(TimerQueue::default()),
        }
    }

    /// Move the clock to `target_ns`, firing every callback due on the way
    /// in deadline order. The clock reads each callback's deadline while it runs.
    pub fn advance_to(&self, target_ns: u64) {
        loop {
            let due = self.queue.lock().pop_due(target_ns);
            match due {
                Some((deadline, callback)) => {
                    self.now.fetch_max(deadline, Ordering::AcqRel);
                    callback();
                }
                None => break,
            }
        }
        self.now.fetch_max(target_ns, Ordering::AcqRel);
    }

    /// Move the clock forward by `delta_ns`.
    pub fn advance_by(&self, delta_ns: u64) {
        self.advance_to(self.now_ns().saturating_add(delta_ns));
    }

    /// Callbacks still waiting.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.lock().next_deadline()
    }
}

impl TimerService for ManualTimer {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn schedule(&self, deadline_ns: u64, callback: TimerCallback) -> TimerId {
        self.queue.lock().insert(deadline_ns, callback)
    }

    fn cancel(&self, id: TimerId) -> bool {
        self.queue.lock().remove(id)
    }
}
