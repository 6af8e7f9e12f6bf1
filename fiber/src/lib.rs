//! Stackful fibers: cooperative units of execution with their own stack.
//!
//! A [`Fiber`] pairs a [`stack::FiberStack`] with a saved CPU context. Calling
//! [`Fiber::resume`] switches the calling thread onto the fiber's stack; the
//! fiber runs until it calls [`yield_now`] (suspending itself and returning
//! control to whoever resumed it) or its entry function returns (terminating
//! it). The low-level register save/restore is implemented in per-architecture
//! assembly in the `arch` module and is never exposed directly.
//!
//! Unlike a typical stackful-coroutine crate, fibers here are allowed to
//! migrate between OS threads between yields: a fiber may be resumed on one
//! thread, yield, and later be resumed on a different thread by a scheduler
//! that picked it back up from a shared queue. Only one thread may be
//! *resuming* a given fiber at a time, and `Fiber` is `Send` to allow this.

mod arch;
pub mod stack;
mod utils;

use crate::stack::{DefaultFiberStack, FiberStack, StackPointer};
use crate::utils::EncodedValue;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Errors produced by precondition violations on [`Fiber`] operations.
///
/// In debug builds these preconditions are additionally checked with
/// `debug_assert!`, turning a violation into an immediate panic with a
/// more precise location; in release builds callers get this error instead
/// of undefined behavior or silent state corruption.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// [`Fiber::resume`] was called on a fiber that is not in [`FiberState::Ready`].
    #[error("cannot resume fiber {id}: not in the Ready state (state = {state:?})")]
    NotReady {
        /// Id of the offending fiber.
        id: u64,
        /// The fiber's actual state.
        state: FiberState,
    },
    /// [`Fiber::reset`] was called on a fiber that has already started and
    /// has not yet terminated.
    #[error("cannot reset fiber {id}: fiber has started and is not Term (state = {state:?})")]
    NotResettable {
        /// Id of the offending fiber.
        id: u64,
        /// The fiber's actual state.
        state: FiberState,
    },
    /// [`yield_now`] was called from a thread that has no fiber currently
    /// running.
    #[error("yield_now() called outside of a running fiber")]
    NoCurrentFiber,
}

/// Lifecycle state of a [`Fiber`].
///
/// There is deliberately no explicit "suspended" state distinct from `Ready`:
/// a fiber that has yielded is simply `Ready` again, indistinguishable from
/// one that has never run, since both are legal targets of `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberState {
    /// Never resumed, or resumed at least once and currently suspended.
    Ready,
    /// Currently executing on some thread.
    Running,
    /// The entry function has returned (or panicked). The fiber cannot be
    /// resumed again until [`Fiber::reset`].
    Term,
}

/// Default stack size for fibers that don't request a specific size.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// A handle to the parent-link cell embedded in a fiber's own stack by
/// `arch::init_stack`/`stack_init_trampoline`, located at a fixed offset
/// below the stack's top address. Reading/writing through it is how a fiber
/// finds its way back to whichever context resumed it.
#[repr(transparent)]
struct Suspend {
    stack_ptr: Cell<StackPointer>,
}

/// Offset, in bytes, of the parent-link cell below a fiber stack's top
/// address. Fixed by the `stack_init_trampoline`/`switch_and_link`/
/// `switch_yield` calling convention in `arch`, and identical on every
/// architecture this crate supports.
const PARENT_LINK_OFFSET: usize = 16;

impl Suspend {
    fn suspend(&self) {
        // Safety: `stack_ptr` always points at the parent link maintained by
        // the last `switch_and_link`/`switch_yield` call for this fiber.
        unsafe {
            let mut val = std::mem::ManuallyDrop::new(());
            let _: () = utils::decode_val(arch::switch_yield(
                utils::encode_val(&mut val),
                self.stack_ptr.as_ptr(),
            ));
        }
    }
}

struct InitialObject<F> {
    func: std::mem::MaybeUninit<F>,
}

thread_local! {
    /// The fiber currently `RUNNING` on this thread, if any. Updated by
    /// `resume` around the context switch so that `yield_now` and
    /// `current_id` can find it without a parameter.
    static CURRENT: Cell<Option<*const Fiber>> = const { Cell::new(None) };

    /// This thread's main fiber: a zero-stack placeholder representing the
    /// OS thread's own native stack, lazily created on first access.
    static MAIN: Fiber = Fiber::new_main();
}

static TOTAL_COUNT: AtomicU64 = AtomicU64::new(0);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A stackful, cooperatively-scheduled unit of execution.
///
/// Fibers are constructed with an entry closure and a stack, then driven to
/// completion (or indefinitely suspended and resumed) through [`resume`] and
/// [`yield_now`]. A fiber that has terminated can be given a new entry
/// closure and reused via [`reset`], which rewinds the existing stack
/// instead of allocating a new one.
///
/// [`resume`]: Fiber::resume
/// [`reset`]: Fiber::reset
pub struct Fiber {
    id: u64,
    stack: Option<DefaultFiberStack>,
    stack_ptr: Cell<Option<StackPointer>>,
    initial_stack_ptr: Cell<Option<StackPointer>>,
    state: Cell<FiberState>,
    /// True if this fiber is owned by a scheduler (affects nothing inside
    /// this crate directly, but is surfaced so `runtime::scheduler` can tell
    /// which "active" context a fiber should switch back to on yield).
    scheduler_owned: bool,
}

// Safety: a `Fiber` is only ever `RUNNING` on one thread at a time (enforced
// by `resume`'s precondition check), and its stack contains no thread-local
// state that would become invalid by migrating to another thread between
// resumes. This is the key redesign versus a typical stackful-coroutine
// crate, which keeps coroutines pinned to their creating thread: our
// scheduler hands fibers between worker threads across yield points, so
// `Fiber` must be `Send`.
unsafe impl Send for Fiber {}

impl Fiber {
    /// Constructs a new fiber with a freshly allocated stack of `stack_size`
    /// bytes (rounded up to the platform's page size, plus a guard page),
    /// ready to run `entry` on first [`resume`](Fiber::resume).
    pub fn new<F>(entry: F, stack_size: usize, scheduler_owned: bool) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultFiberStack::new(stack_size)?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        TOTAL_COUNT.fetch_add(1, Ordering::Relaxed);

        let (stack_ptr, _init_obj) = Self::init(&stack, entry);

        Ok(Self {
            id,
            stack: Some(stack),
            stack_ptr: Cell::new(Some(stack_ptr)),
            initial_stack_ptr: Cell::new(Some(stack_ptr)),
            state: Cell::new(FiberState::Ready),
            scheduler_owned,
        })
    }

    /// Builds the thread's placeholder "main fiber", representing the
    /// OS thread's own stack rather than an owned [`DefaultFiberStack`].
    fn new_main() -> Self {
        TOTAL_COUNT.fetch_add(1, Ordering::Relaxed);
        Self {
            id: 0,
            stack: None,
            stack_ptr: Cell::new(None),
            initial_stack_ptr: Cell::new(None),
            state: Cell::new(FiberState::Running),
            scheduler_owned: false,
        }
    }

    /// Lays out the entry closure on `stack` and returns the stack pointer
    /// `resume` should switch to on first entry.
    fn init<F>(stack: &DefaultFiberStack, entry: F) -> (StackPointer, StackPointer)
    where
        F: FnOnce() + Send + 'static,
    {
        unsafe extern "C" fn trampoline<F>(
            _arg: EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut InitialObject<F>,
        ) -> !
        where
            F: FnOnce() + Send + 'static,
        {
            // Safety: `parent_link` is a `#[repr(transparent)]`-compatible
            // reference to the parent link cell maintained on our own stack.
            unsafe {
                let suspend = &*(std::ptr::from_mut(parent_link).cast::<Suspend>());
                let obj = obj.as_ref().unwrap();
                let entry = obj.func.assume_init_read();

                let result = panic::catch_unwind(AssertUnwindSafe(entry));
                if let Err(payload) = result {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                        .unwrap_or("Box<dyn Any>");
                    tracing::error!(fiber = %"<panicked>", panic = msg, "fiber entry panicked; fiber terminated");
                }

                let mut unit = std::mem::ManuallyDrop::new(());
                arch::switch_and_reset(utils::encode_val(&mut unit), suspend.stack_ptr.as_ptr());
            }
        }

        unsafe {
            let (stack_ptr, init_obj) = arch::init_stack(
                stack,
                trampoline::<F>,
                InitialObject {
                    func: std::mem::MaybeUninit::new(entry),
                },
            );
            (stack_ptr, init_obj)
        }
    }

    /// Reconstructs a reference to this fiber's parent-link cell from its
    /// stack's top address. Only valid to call while this fiber is the one
    /// `Running` on the calling thread.
    fn suspend(&self) -> &Suspend {
        let top = self
            .stack
            .as_ref()
            .expect("main fiber has no parent-link slot")
            .top();
        // Safety: `arch::init_stack` always reserves and maintains this slot
        // before the fiber can be resumed for the first time, and every
        // subsequent `switch_and_link`/`switch_yield` keeps it up to date.
        unsafe { &*((top.get() - PARENT_LINK_OFFSET) as *const Suspend) }
    }

    /// This fiber's process-unique id, assigned at construction.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This fiber's current lifecycle state.
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    /// Whether this fiber is owned by a scheduler.
    pub fn scheduler_owned(&self) -> bool {
        self.scheduler_owned
    }

    /// Resumes this fiber, switching the calling thread onto its stack until
    /// it yields or returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] if this fiber is not in [`FiberState::Ready`].
    pub fn resume(&self) -> Result<(), Error> {
        debug_assert_eq!(
            self.state.get(),
            FiberState::Ready,
            "attempted to resume a fiber that is not Ready"
        );
        if self.state.get() != FiberState::Ready {
            return Err(Error::NotReady {
                id: self.id,
                state: self.state.get(),
            });
        }

        let stack_ptr = self.stack_ptr.get().expect("Ready fiber has no stack_ptr");
        let top = self
            .stack
            .as_ref()
            .map(|s| s.top())
            .expect("main fiber cannot be resumed");

        let prev = CURRENT.with(|c| c.replace(Some(self as *const Fiber)));
        self.state.set(FiberState::Running);

        // Safety: `stack_ptr` was produced by `init`/a prior `switch_yield`
        // for this fiber and is a valid suspension point.
        let (_, ret_sp) = unsafe {
            let mut unit = std::mem::ManuallyDrop::new(());
            arch::switch_and_link(utils::encode_val(&mut unit), stack_ptr, top)
        };

        self.stack_ptr.set(ret_sp);
        self.state
            .set(if ret_sp.is_some() { FiberState::Ready } else { FiberState::Term });

        CURRENT.with(|c| c.set(prev));
        Ok(())
    }

    /// Rewinds this fiber's existing stack and rebuilds it to run `entry`
    /// from the start on the next [`resume`](Fiber::resume).
    ///
    /// This reuses the already-allocated stack memory; it is the only way
    /// to put a fiber back into service after it reaches [`FiberState::Term`]
    /// (there is no implicit pooling elsewhere in this crate).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotResettable`] unless this fiber has never been
    /// resumed, or has reached [`FiberState::Term`].
    pub fn reset<F>(&mut self, entry: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let never_run = self.stack_ptr.get() == self.initial_stack_ptr.get();
        let resettable = never_run || self.state.get() == FiberState::Term;
        debug_assert!(resettable, "attempted to reset a fiber that has started and is not Term");
        if !resettable {
            return Err(Error::NotResettable {
                id: self.id,
                state: self.state.get(),
            });
        }

        let stack = self
            .stack
            .as_ref()
            .expect("main fiber cannot be reset");
        let (stack_ptr, _init_obj) = Self::init(stack, entry);
        self.stack_ptr.set(Some(stack_ptr));
        self.initial_stack_ptr.set(Some(stack_ptr));
        self.state.set(FiberState::Ready);
        Ok(())
    }

    /// Returns whether this fiber has been resumed at least once.
    pub fn started(&self) -> bool {
        self.stack_ptr.get() != self.initial_stack_ptr.get()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL_COUNT.fetch_sub(1, Ordering::Relaxed);
        // A fiber that owns a stack must have terminated (or never started)
        // before being dropped: its stack may still hold live Rust objects
        // from a suspended call frame that we have no way to unwind.
        if self.stack.is_some() {
            assert!(
                self.state.get() != FiberState::Running,
                "fiber {} dropped while Running",
                self.id
            );
        }
    }
}

/// Suspends the currently running fiber on this thread, returning control to
/// whoever called [`Fiber::resume`] on it. The suspended fiber transitions to
/// [`FiberState::Ready`] and may be resumed again, on this thread or another.
///
/// # Errors
///
/// Returns [`Error::NoCurrentFiber`] if called from a thread with no fiber
/// currently `Running` (i.e. from the thread's main fiber, or recursively
/// from a panic hook).
pub fn yield_now() -> Result<(), Error> {
    let current = CURRENT.with(Cell::get).ok_or(Error::NoCurrentFiber)?;

    // Safety: `current` was set by `resume` and is valid for the duration of
    // the call that is now suspending itself.
    let fiber = unsafe { &*current };
    debug_assert_eq!(fiber.state.get(), FiberState::Running);

    fiber.state.set(FiberState::Ready);
    fiber.suspend().suspend();
    // We're back: some thread resumed us again, which already set our state
    // to Running and pushed a fresh `CURRENT` entry around the switch.
    Ok(())
}

/// Invokes `f` with a reference to the fiber currently running on this
/// thread. If no fiber submitted through [`Fiber::new`] is running, this
/// lazily creates (on first call) and passes the thread's main fiber, a
/// placeholder representing the OS thread's own native stack.
pub fn with_current<R>(f: impl FnOnce(&Fiber) -> R) -> R {
    match CURRENT.with(Cell::get) {
        // Safety: `current` was set by `resume` and is valid for the
        // duration of its switch, which outlives this call.
        Some(ptr) => f(unsafe { &*ptr }),
        None => MAIN.with(f),
    }
}

/// The id of the fiber currently running on this thread (`0` for the
/// thread's main fiber).
pub fn current_id() -> u64 {
    with_current(Fiber::id)
}

/// Process-wide count of live [`Fiber`]s (constructed minus destroyed),
/// including each thread's main fiber.
pub fn total_count() -> u64 {
    TOTAL_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn basic_yield_resume() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let fiber = Fiber::new(
            move || {
                for _ in 0..3 {
                    c.fetch_add(1, Ordering::SeqCst);
                    yield_now().unwrap();
                }
            },
            DEFAULT_STACK_SIZE,
            false,
        )
        .unwrap();

        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume().unwrap();
        fiber.resume().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // fourth resume runs the fiber to completion (no more yields queued)
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn resume_term_is_rejected() {
        let fiber = Fiber::new(|| {}, DEFAULT_STACK_SIZE, false).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
        assert!(matches!(fiber.resume(), Err(Error::NotReady { .. })));
    }

    #[test]
    fn reset_reuses_stack() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut fiber = Fiber::new(|| {}, DEFAULT_STACK_SIZE, false).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);

        let c = counter.clone();
        fiber.reset(move || {
            c.fetch_add(11, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn reset_while_running_is_rejected() {
        let mut fiber = Fiber::new(
            || {
                yield_now().unwrap();
            },
            DEFAULT_STACK_SIZE,
            false,
        )
        .unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        // started, but not Term: reset must fail.
        assert!(matches!(
            fiber.reset(|| {}),
            Err(Error::NotResettable { .. })
        ));
    }

    #[test]
    fn panicking_entry_terminates_fiber() {
        let fiber = Fiber::new(|| panic!("boom"), DEFAULT_STACK_SIZE, false).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn total_count_tracks_construction_and_drop() {
        let before = total_count();
        {
            let _a = Fiber::new(|| {}, DEFAULT_STACK_SIZE, false).unwrap();
            let _b = Fiber::new(|| {}, DEFAULT_STACK_SIZE, false).unwrap();
            assert_eq!(total_count(), before + 2);
        }
        assert_eq!(total_count(), before);
    }

    /// `reset` rewinds the existing stack rather than allocating a new one:
    /// a local variable's address taken inside the entry closure should land
    /// in the same memory region both times.
    #[test]
    fn reset_runs_on_same_stack_region() {
        let addrs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stack_top = {
            let a = addrs.clone();
            let mut fiber = Fiber::new(
                move || {
                    let local = 0u8;
                    a.lock().unwrap().push(std::ptr::from_ref(&local) as usize);
                },
                DEFAULT_STACK_SIZE,
                false,
            )
            .unwrap();
            fiber.resume().unwrap();

            let a = addrs.clone();
            fiber
                .reset(move || {
                    let local = 0u8;
                    a.lock().unwrap().push(std::ptr::from_ref(&local) as usize);
                })
                .unwrap();
            fiber.resume().unwrap();
            addrs.lock().unwrap().clone()
        };

        assert_eq!(stack_top.len(), 2);
        // Both local-variable addresses must fall within the same
        // DEFAULT_STACK_SIZE-sized window: reset reused the allocation
        // instead of handing the entry a fresh one.
        let diff = stack_top[0].abs_diff(stack_top[1]);
        assert!(
            diff < DEFAULT_STACK_SIZE,
            "reset allocated a new stack region: addresses {:#x} and {:#x} are {diff} bytes apart",
            stack_top[0],
            stack_top[1]
        );
    }

    proptest! {
        /// Resuming a fiber whose entry yields `n` times and then returns
        /// must observe exactly `n` increments after `n` resumes, and
        /// terminate on resume `n + 1` (§8, invariant 1 and scenario S1
        /// generalized to an arbitrary yield count).
        #[test]
        fn resume_n_times_yields_n_times(n in 0usize..50) {
            let counter = Arc::new(AtomicUsize::new(0));
            let c = counter.clone();
            let fiber = Fiber::new(
                move || {
                    for _ in 0..n {
                        c.fetch_add(1, Ordering::SeqCst);
                        yield_now().unwrap();
                    }
                },
                DEFAULT_STACK_SIZE,
                false,
            )
            .unwrap();

            for _ in 0..n {
                fiber.resume().unwrap();
                prop_assert_eq!(fiber.state(), FiberState::Ready);
            }
            prop_assert_eq!(counter.load(Ordering::SeqCst), n);
            fiber.resume().unwrap();
            prop_assert_eq!(fiber.state(), FiberState::Term);
        }
    }
}
