//! Per-fd readiness bookkeeping.

use crate::task::Task;
use fiber::Fiber;
use std::os::fd::RawFd;
use std::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub(crate) const fn bit(self) -> u8 {
        match self {
            Direction::Read => 0b01,
            Direction::Write => 0b10,
        }
    }

    pub(crate) fn epoll_bit(self) -> u32 {
        let bits = match self {
            Direction::Read => libc::EPOLLIN,
            Direction::Write => libc::EPOLLOUT,
        };
        u32::try_from(bits).expect("EPOLLIN/EPOLLOUT fit in u32")
    }
}

/// What to do when a direction becomes ready.
enum Slot {
    /// No interest registered.
    Empty,
    /// `add_event(.., None)` was called; the owning fiber hasn't finished
    /// parking (calling `yield_now`) yet.
    AwaitingFiber,
    /// The fd fired while still `AwaitingFiber` — the owning fiber, once it
    /// does park, must be resumed immediately rather than left registered.
    FiredBeforeParked,
    /// The owning fiber parked and is waiting to be resumed.
    Fiber(Box<Fiber>),
    /// An explicit callback to run once, not tied to any fiber.
    Callback(Box<dyn FnOnce() + Send>),
}

struct RegState {
    registered: u8,
    read: Slot,
    write: Slot,
}

impl RegState {
    fn new() -> Self {
        Self {
            registered: 0,
            read: Slot::Empty,
            write: Slot::Empty,
        }
    }

    fn slot(&mut self, dir: Direction) -> &mut Slot {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

pub(crate) struct Registration {
    state: Mutex<RegState>,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("fd {fd} direction {dir:?} is already registered")]
    AlreadyRegistered { fd: RawFd, dir: Direction },
    #[error("fd table could not grow to index {0}")]
    TableFull(RawFd),
}

/// What the caller of [`FdTable::fire`] / [`FdTable::park_current_fiber`]
/// should do with a slot that was consumed.
pub(crate) enum Fired {
    Fiber(Box<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
    /// Nothing was waiting (the direction was unregistered in the meantime).
    Nothing,
}

impl Fired {
    pub fn into_task(self) -> Option<Task> {
        match self {
            Fired::Fiber(f) => Some(Task::Fiber(f)),
            Fired::Callback(cb) => Some(Task::from_fn(cb)),
            Fired::Nothing => None,
        }
    }
}

/// What [`FdTable::park_current_fiber`] did with the fiber handed to it.
pub(crate) enum ParkOutcome {
    /// Stored in the `Fiber` slot; still pending, nothing to resume now.
    Parked,
    /// The fd fired before the fiber parked; resolves the registration the
    /// same way [`Fired`] does, and the fiber must be resumed right away.
    FiredBeforeParked(Box<Fiber>),
    /// Nothing was registered for this `(fd, dir)` anymore; hand the fiber
    /// back without touching any accounting.
    NotRegistered(Box<Fiber>),
}

const GROWTH_CHUNK: usize = 256;

/// The fd → [`Registration`] table: a coarse `RwLock` around the vector
/// (grown in chunks, rarely written) plus a per-fd mutex for the frequent
/// direction-level mutations.
pub(crate) struct FdTable {
    slots: RwLock<Vec<Option<Registration>>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    fn ensure_capacity(&self, fd: RawFd) -> Result<(), Error> {
        let idx = usize::try_from(fd).map_err(|_| Error::TableFull(fd))?;
        let needed = idx + 1;
        let len = self.slots.read().unwrap().len();
        if len >= needed {
            return Ok(());
        }
        let mut slots = self.slots.write().unwrap();
        if slots.len() < needed {
            let grown = needed.div_ceil(GROWTH_CHUNK) * GROWTH_CHUNK;
            slots.resize_with(grown, || None);
        }
        Ok(())
    }

    /// Registers interest in `dir` on `fd`. Returns the union of registered
    /// directions' epoll bits, for the caller to rearm the epoll entry with.
    pub fn add_event(
        &self,
        fd: RawFd,
        dir: Direction,
        handler: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<u32, Error> {
        self.ensure_capacity(fd)?;
        let idx = usize::try_from(fd).unwrap();
        let slots = self.slots.read().unwrap();
        let entry = slots[idx].get_or_insert_with(Registration::new_cell);
        let mut state = entry.state.lock().unwrap();
        if state.registered & dir.bit() != 0 {
            return Err(Error::AlreadyRegistered { fd, dir });
        }
        state.registered |= dir.bit();
        *state.slot(dir) = match handler {
            Some(cb) => Slot::Callback(cb),
            None => Slot::AwaitingFiber,
        };
        Ok(union_epoll_bits(state.registered))
    }

    /// Called by the scheduler after a fiber it just resumed yields back
    /// `Ready`: if that fiber had called `add_event(.., None)` for `dir` on
    /// `fd` just before yielding, attaches it so it can be resumed on
    /// readiness. Returns [`ParkOutcome::FiredBeforeParked`] if the race
    /// described on [`Slot::FiredBeforeParked`] means it should be resumed
    /// immediately instead — the caller is responsible for treating that the
    /// same as any other delivered event (the registration it resolves was
    /// never handed to `deliver`).
    pub fn park_current_fiber(
        &self,
        fd: RawFd,
        dir: Direction,
        fiber: Box<Fiber>,
    ) -> ParkOutcome {
        let Ok(idx) = usize::try_from(fd) else {
            return ParkOutcome::NotRegistered(fiber);
        };
        let slots = self.slots.read().unwrap();
        let Some(Some(entry)) = slots.get(idx) else {
            return ParkOutcome::NotRegistered(fiber);
        };
        let mut state = entry.state.lock().unwrap();
        match state.slot(dir) {
            Slot::AwaitingFiber => {
                *state.slot(dir) = Slot::Fiber(fiber);
                ParkOutcome::Parked
            }
            slot @ Slot::FiredBeforeParked => {
                *slot = Slot::Empty;
                state.registered &= !dir.bit();
                ParkOutcome::FiredBeforeParked(fiber)
            }
            _ => ParkOutcome::NotRegistered(fiber),
        }
    }

    /// Consumes and returns whatever is waiting on `fd`'s `dir`, clearing
    /// the registered bit. Returns the remaining union of registered
    /// directions for rearming.
    pub fn fire(&self, fd: RawFd, dir: Direction) -> (Fired, u32) {
        let slots = self.slots.read().unwrap();
        let Some(Some(entry)) = slots.get(usize::try_from(fd).unwrap_or(usize::MAX)) else {
            return (Fired::Nothing, 0);
        };
        let mut state = entry.state.lock().unwrap();
        let slot = std::mem::replace(state.slot(dir), Slot::Empty);
        let fired = match slot {
            Slot::Fiber(f) => {
                state.registered &= !dir.bit();
                Fired::Fiber(f)
            }
            Slot::Callback(cb) => {
                state.registered &= !dir.bit();
                Fired::Callback(cb)
            }
            Slot::AwaitingFiber => {
                // The fiber hasn't parked yet; leave the bit set and mark the
                // slot so `park_current_fiber` resumes it immediately.
                *state.slot(dir) = Slot::FiredBeforeParked;
                Fired::Nothing
            }
            Slot::FiredBeforeParked | Slot::Empty => Fired::Nothing,
        };
        (fired, union_epoll_bits(state.registered))
    }

    /// Unregisters `dir` on `fd` without firing whatever was waiting.
    /// Returns whether `dir` was actually registered (so the caller knows
    /// whether a pending-event count needs releasing) alongside the
    /// remaining union of registered directions for rearming.
    pub fn del_event(&self, fd: RawFd, dir: Direction) -> (bool, u32) {
        let slots = self.slots.read().unwrap();
        let Some(Some(entry)) = slots.get(usize::try_from(fd).unwrap_or(usize::MAX)) else {
            return (false, 0);
        };
        let mut state = entry.state.lock().unwrap();
        let was_registered = state.registered & dir.bit() != 0;
        *state.slot(dir) = Slot::Empty;
        state.registered &= !dir.bit();
        (was_registered, union_epoll_bits(state.registered))
    }

    /// Unregisters `dir` on `fd` and fires whatever was waiting exactly
    /// once.
    pub fn cancel_event(&self, fd: RawFd, dir: Direction) -> (Fired, bool, u32) {
        self.fire_unconditionally(fd, dir)
    }

    /// Consumes whatever is in `dir`'s slot regardless of what it is (unlike
    /// [`FdTable::fire`], an `AwaitingFiber` slot is resolved here too, not
    /// left for `park_current_fiber`), reporting whether a direction was
    /// actually registered so the caller releases its pending-event count
    /// exactly once, independent of whether a task came out of it.
    fn fire_unconditionally(&self, fd: RawFd, dir: Direction) -> (Fired, bool, u32) {
        let slots = self.slots.read().unwrap();
        let Some(Some(entry)) = slots.get(usize::try_from(fd).unwrap_or(usize::MAX)) else {
            return (Fired::Nothing, false, 0);
        };
        let mut state = entry.state.lock().unwrap();
        let was_registered = state.registered & dir.bit() != 0;
        let slot = std::mem::replace(state.slot(dir), Slot::Empty);
        state.registered &= !dir.bit();
        let fired = match slot {
            Slot::Fiber(f) => Fired::Fiber(f),
            Slot::Callback(cb) => Fired::Callback(cb),
            Slot::AwaitingFiber | Slot::FiredBeforeParked | Slot::Empty => Fired::Nothing,
        };
        (fired, was_registered, union_epoll_bits(state.registered))
    }

    /// Cancels both directions on `fd`, firing whatever was waiting on
    /// either. Each entry reports whether that direction was actually
    /// registered, for pending-event accounting.
    pub fn cancel_all(&self, fd: RawFd) -> Vec<(Fired, bool)> {
        let mut out = Vec::with_capacity(2);
        let (a, a_registered, _) = self.fire_unconditionally(fd, Direction::Read);
        out.push((a, a_registered));
        let (b, b_registered, _) = self.fire_unconditionally(fd, Direction::Write);
        out.push((b, b_registered));
        out
    }
}

impl Registration {
    fn new_cell() -> Self {
        Self {
            state: Mutex::new(RegState::new()),
        }
    }
}

fn union_epoll_bits(registered: u8) -> u32 {
    let mut bits = 0;
    if registered & Direction::Read.bit() != 0 {
        bits |= Direction::Read.epoll_bit();
    }
    if registered & Direction::Write.bit() != 0 {
        bits |= Direction::Write.epoll_bit();
    }
    bits
}
