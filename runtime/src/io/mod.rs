//! An epoll-backed I/O manager layered on top of [`crate::scheduler::Scheduler`].
//!
//! Rust has no struct inheritance, so "extends Scheduler" is modeled as
//! composition: [`IoManager`] wraps a `Scheduler<EpollIdle>`, where
//! [`EpollIdle`] is the [`crate::scheduler::Idle`] strategy that replaces
//! condvar parking with an `epoll_wait` that also drives the timer heap.

pub mod poller;
pub mod registration;

use crate::scheduler::{Idle, Queue, Scheduler, SchedulerConfig};
use crate::task::{Affinity, Task};
use crate::timer::TimerManager;
use fiber::Fiber;
use poller::{Epoll, EventFd};
use registration::{Direction, FdTable, ParkOutcome};
use std::cell::Cell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Registration(#[from] registration::Error),
    #[error("epoll setup failed: {0}")]
    Setup(#[source] std::io::Error),
    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::Error),
}

/// Upper bound on how long a single `idle()` iteration may block in
/// `epoll_wait`, so timers and shutdown are still checked periodically even
/// with nothing registered.
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

thread_local! {
    /// Set by `IoManager::add_event` just before the calling fiber is
    /// expected to call `yield_now()`. Consumed by `EpollIdle::on_fiber_yielded`
    /// once that yield actually happens.
    static PARK_REQUEST: Cell<Option<(RawFd, Direction)>> = const { Cell::new(None) };
}

pub struct IoManagerConfig {
    pub scheduler: SchedulerConfig,
}

impl Default for IoManagerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// The [`Idle`] strategy: an epoll instance, its wake eventfd, the fd
/// registration table and the timer heap, all shared with [`IoManager`].
pub(crate) struct EpollIdle {
    epoll: Epoll,
    wake: EventFd,
    fds: FdTable,
    timers: TimerManager,
    pending_events: AtomicUsize,
}

impl EpollIdle {
    fn new() -> Result<Self, Error> {
        let epoll = Epoll::new().map_err(Error::Setup)?;
        let wake = EventFd::new().map_err(Error::Setup)?;
        let token = u64::try_from(wake.fd()).unwrap_or(0);
        epoll
            .add(wake.fd(), Direction::Read.epoll_bit(), token)
            .map_err(Error::Setup)?;
        Ok(Self {
            epoll,
            wake,
            fds: FdTable::new(),
            timers: TimerManager::new(),
            pending_events: AtomicUsize::new(0),
        })
    }
}

impl Idle for EpollIdle {
    fn tickle(&self) {
        self.wake.notify();
    }

    fn idle(&self, queue: &Queue, _worker: usize) {
        let timeout = match self.timers.next_timeout() {
            Some(d) => d.min(MAX_IDLE_TIMEOUT),
            None => MAX_IDLE_TIMEOUT,
        };
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 256];
        let ready = match self.epoll.wait(&mut events, timeout_ms) {
            Ok(n) => n,
            Err(err) => {
                tracing::error!(error = %err, "epoll_wait failed");
                return;
            }
        };

        for event in &events[..ready] {
            let Ok(fd) = RawFd::try_from(event.u64) else {
                continue;
            };
            if fd == self.wake.fd() {
                self.wake.drain();
                continue;
            }
            if event.events & Direction::Read.epoll_bit() != 0 {
                self.deliver(queue, fd, Direction::Read);
            }
            if event.events & Direction::Write.epoll_bit() != 0 {
                self.deliver(queue, fd, Direction::Write);
            }
        }

        for fired in self.timers.list_expired() {
            queue.push(
                Task::from_fn(move || crate::timer::fire(&fired)),
                Affinity::Any,
            );
        }
    }

    fn on_fiber_yielded(&self, fiber: Box<Fiber>) -> Option<Box<Fiber>> {
        let request = PARK_REQUEST.with(Cell::take);
        let Some((fd, dir)) = request else {
            return Some(fiber);
        };
        match self.fds.park_current_fiber(fd, dir, fiber) {
            ParkOutcome::Parked => None,
            ParkOutcome::FiredBeforeParked(fiber) => {
                // The fd already fired while the fiber was still
                // `AwaitingFiber`; this resumes it the same way `deliver`
                // would have, so the registration's pending count is
                // released here instead.
                self.pending_events.fetch_sub(1, Ordering::AcqRel);
                Some(fiber)
            }
            ParkOutcome::NotRegistered(fiber) => Some(fiber),
        }
    }

    fn quiescent(&self, queue: &Queue, thread_count: usize) -> bool {
        queue.quiescent(thread_count)
            && self.timers.is_empty()
            && self.pending_events.load(Ordering::Acquire) == 0
    }
}

impl EpollIdle {
    fn deliver(&self, queue: &Queue, fd: RawFd, dir: Direction) {
        let (fired, remaining) = self.fds.fire(fd, dir);
        self.rearm(fd, remaining);
        if let Some(task) = fired.into_task() {
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
            queue.push(task, Affinity::Any);
        }
    }

    fn rearm(&self, fd: RawFd, directions: u32) {
        let token = u64::try_from(fd).unwrap_or(0);
        let result = if directions == 0 {
            self.epoll.remove(fd)
        } else {
            self.epoll.modify(fd, directions, token)
        };
        if let Err(err) = result {
            tracing::error!(fd, error = %err, "failed to rearm epoll registration");
        }
    }

    fn initial_arm(&self, fd: RawFd, directions: u32) -> std::io::Result<()> {
        // EPOLL_CTL_ADD if this is the fd's first registered direction,
        // EPOLL_CTL_MOD otherwise. We don't track "is this the first add"
        // separately; ADD failing with EEXIST just means a rearm, so try MOD
        // first since it's the common case once a caller is polling a fd
        // across multiple reads/writes.
        let token = u64::try_from(fd).unwrap_or(0);
        if self.epoll.modify(fd, directions, token).is_ok() {
            return Ok(());
        }
        self.epoll.add(fd, directions, token)
    }
}

/// A [`crate::scheduler::Scheduler`] extended with non-blocking I/O
/// readiness and timers, so fibers can block on a socket or a deadline
/// without blocking the worker thread underneath them.
pub struct IoManager {
    scheduler: Arc<Scheduler<EpollIdle>>,
    idle: Arc<EpollIdle>,
}

impl IoManager {
    pub fn new(config: IoManagerConfig) -> Result<Arc<Self>, Error> {
        let idle = EpollIdle::new()?;
        let scheduler = Arc::new(Scheduler::with_idle(config.scheduler, idle));
        let idle = scheduler.idle_handle();
        Ok(Arc::new(Self { scheduler, idle }))
    }

    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        self.scheduler.start().map_err(Error::Scheduler)
    }

    /// Stops the underlying scheduler, but only once the task queue is
    /// empty, no timers remain, and every pending I/O registration has
    /// fired — see [`IoManager::is_quiescent`].
    pub fn stop(self: &Arc<Self>) {
        self.scheduler.stop();
    }

    pub fn is_quiescent(&self) -> bool {
        self.scheduler.queue().is_empty()
            && self.idle.timers.is_empty()
            && self.idle.pending_events.load(Ordering::Acquire) == 0
    }

    pub fn submit(&self, task: Task, affinity: Affinity) -> Result<(), crate::scheduler::Error> {
        self.scheduler.submit(task, affinity)
    }

    pub fn add_timer(
        &self,
        delay: Duration,
        callback: impl FnMut() + Send + 'static,
        recurring: bool,
    ) -> crate::timer::TimerHandle {
        self.idle.timers.add_timer(delay, callback, recurring)
    }

    /// Registers interest in `dir` on `fd`. `fd` must already be
    /// non-blocking; that's the caller's responsibility.
    ///
    /// If `handler` is `None`, the implicit handler resumes the calling
    /// fiber: the caller is expected to call [`fiber::yield_now`]
    /// immediately afterward. Fails if `dir` is already registered on `fd`.
    pub fn add_event(
        &self,
        fd: RawFd,
        dir: Direction,
        handler: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), Error> {
        let implicit = handler.is_none();
        let directions = self.idle.fds.add_event(fd, dir, handler)?;
        self.idle.pending_events.fetch_add(1, Ordering::AcqRel);
        self.idle
            .initial_arm(fd, directions)
            .map_err(Error::Setup)?;
        if implicit {
            PARK_REQUEST.with(|c| c.set(Some((fd, dir))));
        }
        Ok(())
    }

    /// Unregisters `dir` on `fd` without firing whatever was waiting.
    pub fn del_event(&self, fd: RawFd, dir: Direction) {
        let (was_registered, remaining) = self.idle.fds.del_event(fd, dir);
        if was_registered {
            self.idle.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        self.idle.rearm(fd, remaining);
    }

    /// Unregisters `dir` on `fd` and fires whatever was waiting exactly
    /// once (used to wake a fiber whose fd is being closed).
    pub fn cancel_event(&self, fd: RawFd, dir: Direction) {
        let (fired, was_registered, remaining) = self.idle.fds.cancel_event(fd, dir);
        self.idle.rearm(fd, remaining);
        if was_registered {
            self.idle.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(task) = fired.into_task() {
            let _ = self.scheduler.submit(task, Affinity::Any);
        }
    }

    /// Cancels both directions on `fd`.
    pub fn cancel_all(&self, fd: RawFd) {
        for (fired, was_registered) in self.idle.fds.cancel_all(fd) {
            if was_registered {
                self.idle.pending_events.fetch_sub(1, Ordering::AcqRel);
            }
            if let Some(task) = fired.into_task() {
                let _ = self.scheduler.submit(task, Affinity::Any);
            }
        }
        self.idle.rearm(fd, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn pipe_readiness_wakes_registered_callback() {
        let mgr = IoManager::new(IoManagerConfig {
            scheduler: SchedulerConfig {
                thread_count: 2,
                ..Default::default()
            },
        })
        .unwrap();
        mgr.start().unwrap();

        let mut fds = [0; 2];
        // Safety: `fds` is a valid 2-element buffer for `pipe`.
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        // Safety: both fds were just created by `pipe` above.
        unsafe {
            let flags = libc::fcntl(read_fd, libc::F_GETFL);
            libc::fcntl(read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        mgr.add_event(
            read_fd,
            Direction::Read,
            Some(Box::new(move || {
                fired2.store(true, Ordering::Release);
            })),
        )
        .unwrap();

        // Safety: writing one byte to a valid pipe write end.
        unsafe {
            libc::write(write_fd, [1u8].as_ptr().cast(), 1);
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(fired.load(Ordering::Acquire));

        mgr.stop();
        // Safety: both ends were opened above and aren't used after this.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
