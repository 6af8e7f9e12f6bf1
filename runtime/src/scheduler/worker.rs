//! The per-thread worker loop.

use super::{Idle, Scheduler};
use crate::task::{Affinity, Task};
use fiber::{Fiber, FiberState};
use std::cell::Cell;
use std::sync::Arc;

thread_local! {
    /// This worker's index within its scheduler's pool, set for the
    /// duration of `run`. `None` on any thread that isn't currently
    /// executing a worker loop (including a fiber's own thread before it's
    /// ever resumed from one).
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The index of the worker loop currently running on this thread, if any.
///
/// Lets a task submitted with [`crate::task::Affinity::Worker`] confirm it
/// landed where it asked to, or any task read which of the pool's threads
/// it happens to be running on.
pub fn current_worker() -> Option<usize> {
    WORKER_INDEX.with(Cell::get)
}

/// Runs the worker loop for `worker` until the scheduler is STOPPING and the
/// queue is quiescent. Also used, unmodified, as the caller's scheduling
/// fiber body when `SchedulerConfig::use_caller` is set.
pub(crate) fn run<I: Idle + 'static>(scheduler: &Arc<Scheduler<I>>, worker: usize) {
    let thread_count = scheduler.thread_count();
    let queue = scheduler.queue();
    let prev = WORKER_INDEX.with(|c| c.replace(Some(worker)));

    loop {
        match queue.try_pop(worker) {
            Some(task) => execute(scheduler, task),
            None => {
                // Count this worker as idle for the whole span from here
                // until it either exits or goes back to `try_pop`, so the
                // quiescent check below (and whatever `idle()` itself does
                // to wait) sees this worker as parked too — otherwise the
                // checking worker could never be among the `thread_count`
                // idle workers `quiescent` requires.
                queue.enter_idle();
                if scheduler.is_stopping() && scheduler.idle_strategy().quiescent(queue, thread_count)
                {
                    queue.exit_idle();
                    break;
                }
                scheduler.idle_strategy().idle(queue, worker);
                queue.exit_idle();
            }
        }
    }

    WORKER_INDEX.with(|c| c.set(prev));
}

fn execute<I: Idle + 'static>(scheduler: &Arc<Scheduler<I>>, task: Task) {
    let fiber = match task {
        Task::Fiber(fiber) => fiber,
        Task::Callable(f) => {
            let stack_size = scheduler.config().stack_size;
            match Fiber::new(f, stack_size, true) {
                Ok(fiber) => Box::new(fiber),
                Err(err) => {
                    tracing::error!(error = %err, "failed to allocate transient fiber stack");
                    return;
                }
            }
        }
    };

    if fiber.state() != FiberState::Ready {
        tracing::error!(id = fiber.id(), "dequeued a non-Ready fiber; dropping");
        return;
    }

    if let Err(err) = fiber.resume() {
        tracing::error!(id = fiber.id(), error = %err, "failed to resume fiber");
        return;
    }

    if fiber.state() == FiberState::Ready {
        if let Some(fiber) = scheduler.idle_strategy().on_fiber_yielded(fiber) {
            let _ = scheduler.submit(Task::Fiber(fiber), Affinity::Any);
        }
    }
}
