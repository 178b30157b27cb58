//! Native thread bridge.
//!
//! Blocking native work must not stall the managed scheduler, so it
//! runs to completion on a real OS thread and reports back through a
//! single-reader/multi-writer monitor. The scheduler is the only
//! waiter; any number of executor threads signal it. A coalescing wake
//! token interrupts the wait at most once per pending wake.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timeout {
    Forever,
    Millis(u64),
}

impl Timeout {
    /// Absolute deadline; `Forever` waits without one.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Forever => None,
            Timeout::Millis(ms) => Some(Instant::now() + Duration::from_millis(ms)),
        }
    }
}

struct MonitorInner {
    signals: u32,
    /// Lock-depth bookkeeping; the rendezvous admits one reader.
    depth: u32,
}

/// Mutex + condvar rendezvous between the scheduler and native
/// workers.
pub struct NativeMonitor {
    inner: Mutex<MonitorInner>,
    cv: Condvar,
}

impl NativeMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner { signals: 0, depth: 0 }),
            cv: Condvar::new(),
        }
    }

    /// Block until a signal arrives or the deadline passes. Returns
    /// false on timeout.
    pub fn wait_signal(&self, timeout: Timeout) -> bool {
        let deadline = timeout.deadline();
        let mut guard = self.inner.lock();
        guard.depth += 1;
        debug_assert_eq!(guard.depth, 1, "monitor admits a single reader");
        while guard.signals == 0 {
            match deadline {
                Some(at) => {
                    if self.cv.wait_until(&mut guard, at).timed_out() {
                        guard.depth -= 1;
                        return false;
                    }
                }
                None => self.cv.wait(&mut guard),
            }
        }
        guard.signals -= 1;
        guard.depth -= 1;
        true
    }

    /// Consume a signal if one is already pending, without blocking.
    pub fn try_consume(&self) -> bool {
        let mut guard = self.inner.lock();
        if guard.signals > 0 {
            guard.signals -= 1;
            true
        } else {
            false
        }
    }

    pub fn signal(&self) {
        let mut guard = self.inner.lock();
        guard.signals += 1;
        self.cv.notify_one();
    }
}

impl Default for NativeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Coalescing waker: many wake calls while one is pending produce a
/// single interrupt of the monitor wait.
pub struct WakeToken {
    pending: AtomicBool,
}

impl WakeToken {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Returns true when this call actually delivered an interrupt.
    pub fn wake(&self, monitor: &NativeMonitor) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        monitor.signal();
        true
    }

    /// Clear the pending wake; true if one was pending.
    pub fn consume(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

impl Default for WakeToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Clonable handle that interrupts the scheduler's idle wait from any
/// native thread. Wakes coalesce while one is pending.
#[derive(Clone)]
pub struct Interrupter {
    monitor: Arc<NativeMonitor>,
    token: Arc<WakeToken>,
}

impl Interrupter {
    pub fn new(monitor: Arc<NativeMonitor>, token: Arc<WakeToken>) -> Self {
        Self { monitor, token }
    }

    /// True when this call delivered a wake (false = coalesced).
    pub fn interrupt(&self) -> bool {
        self.token.wake(&self.monitor)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Priority {
    Low,
    Med,
    High,
}

impl Priority {
    /// Platform priority value for thread creation.
    pub fn platform_value(self) -> i32 {
        match self {
            Priority::Low => 1,
            Priority::Med => 5,
            Priority::High => 9,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutorState {
    Starting,
    Running,
    Done,
    Error,
}

/// Creation failure: error code plus the captured OS errno.
#[derive(Debug)]
pub struct BridgeError {
    pub message: &'static str,
    pub errno: Option<i32>,
}

#[derive(Debug)]
struct ExecutorShared {
    state: Mutex<ExecutorState>,
    result: Mutex<Option<i64>>,
}

/// One blocking native call, run to completion on its own OS thread.
#[derive(Debug)]
pub struct TaskExecutor {
    pub name: String,
    pub priority: Priority,
    shared: Arc<ExecutorShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TaskExecutor {
    pub fn spawn<F>(
        name: &str,
        priority: Priority,
        stack_bytes: usize,
        monitor: Arc<NativeMonitor>,
        task: F,
    ) -> Result<TaskExecutor, BridgeError>
    where
        F: FnOnce() -> i64 + Send + 'static,
    {
        let shared = Arc::new(ExecutorShared {
            state: Mutex::new(ExecutorState::Starting),
            result: Mutex::new(None),
        });
        let worker_shared = Arc::clone(&shared);

        let builder = thread::Builder::new()
            .name(name.to_string())
            .stack_size(stack_bytes.max(16 * 1024));
        let spawned = builder.spawn(move || {
            *worker_shared.state.lock() = ExecutorState::Running;
            let value = task();
            *worker_shared.result.lock() = Some(value);
            *worker_shared.state.lock() = ExecutorState::Done;
            monitor.signal();
        });

        match spawned {
            Ok(handle) => {
                log::debug!("executor '{name}' spawned at priority {:?}", priority);
                Ok(TaskExecutor {
                    name: name.to_string(),
                    priority,
                    shared,
                    handle: Some(handle),
                })
            }
            Err(err) => {
                *shared.state.lock() = ExecutorState::Error;
                Err(BridgeError {
                    message: "native thread creation failed",
                    errno: err.raw_os_error(),
                })
            }
        }
    }

    pub fn state(&self) -> ExecutorState {
        *self.shared.state.lock()
    }

    /// Result once the task completed.
    pub fn result(&self) -> Option<i64> {
        *self.shared.result.lock()
    }

    /// Tear down the control block. Refused while the task has not
    /// finished.
    pub fn destroy(mut self) -> Result<(), TaskExecutor> {
        if self.state() != ExecutorState::Done {
            return Err(self);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executor_runs_and_signals_the_monitor() {
        let monitor = Arc::new(NativeMonitor::new());
        let exec = TaskExecutor::spawn(
            "bridge-test",
            Priority::Med,
            64 * 1024,
            Arc::clone(&monitor),
            || 42,
        )
        .expect("spawn executor");

        assert!(
            monitor.wait_signal(Timeout::Millis(2000)),
            "completion signal should arrive"
        );
        // the signal is posted after the result is stored
        assert_eq!(exec.result(), Some(42));
        assert_eq!(exec.state(), ExecutorState::Done);
        exec.destroy().expect("done executor destroys cleanly");
    }

    #[test]
    fn wait_times_out_without_a_signal() {
        let monitor = NativeMonitor::new();
        let start = Instant::now();
        assert!(!monitor.wait_signal(Timeout::Millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn pre_delivered_signal_means_no_block() {
        let monitor = NativeMonitor::new();
        monitor.signal();
        let start = Instant::now();
        assert!(monitor.wait_signal(Timeout::Forever));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn multiple_writers_one_reader() {
        let monitor = Arc::new(NativeMonitor::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&monitor);
            let f = Arc::clone(&fired);
            workers.push(thread::spawn(move || {
                f.fetch_add(1, Ordering::SeqCst);
                m.signal();
            }));
        }
        for _ in 0..4 {
            assert!(monitor.wait_signal(Timeout::Millis(2000)));
        }
        for w in workers {
            w.join().expect("worker join");
        }
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn redundant_wakes_coalesce() {
        let monitor = NativeMonitor::new();
        let waker = WakeToken::new();
        assert!(waker.wake(&monitor), "first wake delivers");
        assert!(!waker.wake(&monitor), "second wake while pending coalesces");
        assert!(waker.consume());
        assert!(!waker.consume(), "consume clears the pending state");
        assert!(waker.wake(&monitor), "after consumption wakes deliver again");
        // exactly two signals reached the monitor
        assert!(monitor.try_consume());
        assert!(monitor.try_consume());
        assert!(!monitor.try_consume());
    }

    #[test]
    fn interrupter_wakes_an_idle_wait_once() {
        let monitor = Arc::new(NativeMonitor::new());
        let token = Arc::new(WakeToken::new());
        let int = Interrupter::new(Arc::clone(&monitor), Arc::clone(&token));

        assert!(int.interrupt());
        assert!(!int.interrupt(), "second interrupt coalesces");
        assert!(monitor.wait_signal(Timeout::Millis(500)));
        assert!(token.consume());
        assert!(int.interrupt(), "interrupts deliver again after consumption");
    }

    #[test]
    fn destroy_refused_while_running() {
        let monitor = Arc::new(NativeMonitor::new());
        let gate = Arc::new(NativeMonitor::new());
        let gate_t = Arc::clone(&gate);
        let exec = TaskExecutor::spawn(
            "bridge-slow",
            Priority::Low,
            64 * 1024,
            Arc::clone(&monitor),
            move || {
                gate_t.wait_signal(Timeout::Millis(5000));
                7
            },
        )
        .expect("spawn executor");

        let exec = match exec.destroy() {
            Err(e) => e,
            Ok(()) => panic!("destroy must be refused while not DONE"),
        };
        gate.signal();
        assert!(monitor.wait_signal(Timeout::Millis(5000)));
        assert_eq!(exec.state(), ExecutorState::Done);
        exec.destroy().expect("destroy after completion");
    }

    #[test]
    fn priorities_map_to_platform_values() {
        assert!(Priority::Low.platform_value() < Priority::Med.platform_value());
        assert!(Priority::Med.platform_value() < Priority::High.platform_value());
    }
}
