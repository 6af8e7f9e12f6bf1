//! The M:N scheduler: a pool of OS threads cooperatively running fibers.

pub(crate) mod queue;
mod worker;

use crate::task::{Affinity, Task};
use crate::thread::Thread;
pub(crate) use queue::Queue;
pub use worker::current_worker;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("scheduler is terminated and cannot accept new tasks")]
    Terminated,
    #[error("start() called on a scheduler that is not NEW")]
    AlreadyStarted,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub thread_count: usize,
    pub use_caller: bool,
    pub name: String,
    pub stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            use_caller: false,
            name: "sched".to_string(),
            stack_size: fiber::DEFAULT_STACK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    New = 0,
    Running = 1,
    Stopping = 2,
    Terminated = 3,
}

/// Strategy hook letting the scheduler's idle behavior be overridden.
///
/// The default scheduler simply parks on the queue's condition variable.
/// [`crate::io::IoManager`] implements this trait to additionally drive an
/// epoll wait and fire timers while idle.
pub trait Idle: Send + Sync {
    /// Wakes any thread currently blocked in `idle`, without a task being
    /// available. Called after `stop()` and whenever `tickle()` is needed to
    /// break a sleeping worker out of an external wait.
    fn tickle(&self) {}

    /// Called by a worker that found the queue empty. May block. Must return
    /// once there's a realistic chance new work is available, and must not
    /// block indefinitely once `closing` is observed true after returning.
    fn idle(&self, queue: &Queue, worker: usize);

    /// Called by the worker loop right after resuming a fiber that yielded
    /// back to `Ready` (rather than terminating). The default behavior is to
    /// hand the fiber straight back for re-enqueueing with `Affinity::Any`.
    /// [`crate::io::IoManager`] overrides this to intercept a fiber that
    /// just registered I/O interest and parked itself rather than yielding
    /// voluntarily, returning `None` to signal it has taken ownership.
    fn on_fiber_yielded(&self, fiber: Box<fiber::Fiber>) -> Option<Box<fiber::Fiber>> {
        Some(fiber)
    }

    /// Whether the worker loop may exit once STOPPING and every worker is
    /// parked in `idle`. The default just checks the queue; [`crate::io::IoManager`]
    /// additionally requires no timers and no pending I/O registrations.
    fn quiescent(&self, queue: &Queue, thread_count: usize) -> bool {
        queue.quiescent(thread_count)
    }
}

/// Parks on the queue's `Condvar`. Used by a plain [`Scheduler`] with no I/O.
pub(crate) struct DefaultIdle;

impl Idle for DefaultIdle {
    fn idle(&self, queue: &Queue, _worker: usize) {
        // A short timeout bounds how long a worker can sleep without
        // re-checking shutdown state even if `tickle` is ever missed.
        queue.wait(Some(std::time::Duration::from_millis(200)));
    }
}

/// A pool of OS threads executing fibers from a shared queue.
///
/// Generic over the idle strategy so that [`crate::io::IoManager`] can reuse
/// the same worker-loop/queue/shutdown machinery while overriding what a
/// worker does when it finds no runnable task.
pub struct Scheduler<I: Idle = DefaultIdle> {
    queue: Arc<Queue>,
    idle: Arc<I>,
    config: SchedulerConfig,
    state: AtomicU8,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    caller_thread_index: Option<usize>,
}

impl Scheduler<DefaultIdle> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_idle(config, DefaultIdle)
    }
}

impl<I: Idle + 'static> Scheduler<I> {
    pub(crate) fn with_idle(config: SchedulerConfig, idle: I) -> Self {
        let caller_thread_index = if config.use_caller {
            Some(config.thread_count.saturating_sub(1))
        } else {
            None
        };
        Self {
            queue: Arc::new(Queue::new()),
            idle: Arc::new(idle),
            config,
            state: AtomicU8::new(State::New as u8),
            workers: std::sync::Mutex::new(Vec::new()),
            caller_thread_index,
        }
    }

    pub(crate) fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::New,
            1 => State::Running,
            2 => State::Stopping,
            _ => State::Terminated,
        }
    }

    /// Enqueues `task` with the given affinity. Legal in any state except
    /// [`State::Terminated`].
    pub fn submit(&self, task: Task, affinity: Affinity) -> Result<(), Error> {
        if self.state() == State::Terminated {
            return Err(Error::Terminated);
        }
        self.queue.push(task, affinity);
        self.idle.tickle();
        Ok(())
    }

    /// Spawns the worker threads (and, if `use_caller`, prepares the caller's
    /// scheduling fiber) and transitions NEW → RUNNING.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self
            .state
            .compare_exchange(
                State::New as u8,
                State::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        let spawned_count = if self.config.use_caller {
            self.config.thread_count.saturating_sub(1)
        } else {
            self.config.thread_count
        };

        let mut workers = self.workers.lock().unwrap();
        for idx in 0..spawned_count {
            let this = Arc::clone(self);
            let name = format!("{}-{idx}", self.config.name);
            let (_thread, handle) = Thread::spawn(name, move || {
                worker::run(&this, idx);
            });
            workers.push(handle);
        }
        Ok(())
    }

    /// Marks the scheduler STOPPING, tickles every worker, runs the caller's
    /// scheduling fiber (if `use_caller`) to drain, then joins every spawned
    /// worker. After this returns the scheduler is TERMINATED.
    pub fn stop(self: &Arc<Self>) {
        self.state.store(State::Stopping as u8, Ordering::Release);
        self.queue.tickle_all();
        self.idle.tickle();

        if let Some(idx) = self.caller_thread_index {
            worker::run(self, idx);
        }

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap();
            std::mem::take(&mut *workers)
        };
        for h in handles {
            let _ = h.join();
        }
        self.queue.close();
        self.state.store(State::Terminated as u8, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        matches!(self.state(), State::Stopping | State::Terminated)
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.config.thread_count
    }

    pub(crate) fn idle_strategy(&self) -> &I {
        &self.idle
    }

    pub(crate) fn idle_handle(&self) -> Arc<I> {
        self.idle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn submit_after_terminate_is_rejected() {
        let sched = Arc::new(Scheduler::new(SchedulerConfig {
            thread_count: 2,
            ..Default::default()
        }));
        sched.start().unwrap();
        sched.stop();
        let res = sched.submit(Task::from_fn(|| {}), Affinity::Any);
        assert!(matches!(res, Err(Error::Terminated)));
    }

    #[test]
    fn runs_submitted_callables() {
        let sched = Arc::new(Scheduler::new(SchedulerConfig {
            thread_count: 4,
            ..Default::default()
        }));
        sched.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let c = counter.clone();
            sched
                .submit(
                    Task::from_fn(move || {
                        c.fetch_add(1, Ordering::Relaxed);
                    }),
                    Affinity::Any,
                )
                .unwrap();
        }

        // give workers a moment to drain before stopping
        std::thread::sleep(std::time::Duration::from_millis(200));
        sched.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn worker_affinity_is_respected() {
        let sched = Arc::new(Scheduler::new(SchedulerConfig {
            thread_count: 3,
            ..Default::default()
        }));
        sched.start().unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for _ in 0..20 {
            let seen = seen.clone();
            sched
                .submit(
                    Task::from_fn(move || {
                        seen.lock().unwrap().push(worker::current_worker());
                    }),
                    Affinity::Worker(0),
                )
                .unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
        sched.stop();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().all(|w| *w == Some(0)));
    }
}
