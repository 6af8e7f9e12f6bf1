//! Queue entries: the unit of work the scheduler moves between threads.

use fiber::Fiber;

/// Where a task is allowed to run.
///
/// Most tasks can run on any worker; a task pinned to a specific worker
/// (for example, one that registered interest in an epoll instance that only
/// that worker polls) must stay there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Any,
    Worker(usize),
}

impl Affinity {
    pub(crate) fn matches(self, worker: usize) -> bool {
        match self {
            Affinity::Any => true,
            Affinity::Worker(w) => w == worker,
        }
    }
}

/// A scheduler work item: either a fiber to resume, or a plain closure to run
/// to completion on a worker thread (no fiber stack is involved).
pub enum Task {
    Fiber(Box<Fiber>),
    Callable(Box<dyn FnOnce() + Send>),
}

impl Task {
    pub fn from_fn(f: impl FnOnce() + Send + 'static) -> Self {
        Task::Callable(Box::new(f))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Callable(_) => f.debug_tuple("Callable").finish(),
        }
    }
}

pub(crate) struct Entry {
    pub task: Task,
    pub affinity: Affinity,
}
