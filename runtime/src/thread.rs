//! A named OS thread wrapper with a stable numeric identity.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Option<&'static Thread>> = const { Cell::new(None) };
}

/// A worker or caller thread spawned by the scheduler.
///
/// Every `Thread` has a process-unique numeric `id` (distinct from the OS
/// thread id, which isn't stable or meaningful across platforms) and a
/// best-effort name applied through `pthread_setname_np` on unix.
#[derive(Debug)]
pub struct Thread {
    id: u64,
    name: String,
}

impl Thread {
    /// Spawns a new OS thread named `name`, running `entry` on it.
    ///
    /// Blocks until the new thread has published its `Thread::current()`
    /// self-pointer, so that code immediately following `spawn` can rely on
    /// peer threads already exposing their identity.
    pub fn spawn<F>(name: impl Into<String>, entry: F) -> (Self, JoinHandle<()>)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();

        let spawn_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(spawn_name.clone())
            .spawn(move || {
                set_name(&spawn_name);
                let this = Thread {
                    id,
                    name: spawn_name,
                };
                CURRENT.with(|c| c.set(Some(Box::leak(Box::new(this)))));
                barrier2.wait();
                entry();
            })
            .expect("failed to spawn OS thread");

        barrier.wait();
        (Thread { id, name }, handle)
    }

    /// This thread's process-unique numeric id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This thread's best-effort name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the calling OS thread's `Thread` wrapper, or `None` if the
    /// calling thread was not spawned through [`Thread::spawn`].
    pub fn current() -> Option<&'static Thread> {
        CURRENT.with(Cell::get)
    }

    /// Returns the id of the calling OS thread's `Thread` wrapper, or `None`
    /// if the calling thread was not spawned through [`Thread::spawn`].
    pub fn current_id() -> Option<u64> {
        Self::current().map(Thread::id)
    }
}

#[cfg(unix)]
fn set_name(name: &str) {
    // Linux caps thread names (including the NUL terminator) at 16 bytes.
    const MAX_LEN: usize = 15;
    let truncated = if name.len() > MAX_LEN {
        // Slicing at MAX_LEN could land inside a multi-byte char; back up
        // to the nearest char boundary instead of panicking.
        let mut end = MAX_LEN;
        while end > 0 && !name.is_char_boundary(end) {
            end -= 1;
        }
        &name[..end]
    } else {
        name
    };
    let Ok(cname) = std::ffi::CString::new(truncated) else {
        return;
    };
    // Safety: `cname` is a valid, NUL-terminated C string; failure to set the
    // name is not a correctness issue, only cosmetic, so the result is
    // intentionally ignored.
    unsafe {
        libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_thread_publishes_identity_before_spawn_returns() {
        let (thread, handle) = Thread::spawn("worker-test", || {
            assert!(Thread::current_id().is_some());
        });
        assert_eq!(thread.name(), "worker-test");
        handle.join().unwrap();
    }

    #[test]
    fn ids_are_unique() {
        let (a, ha) = Thread::spawn("a", || {});
        let (b, hb) = Thread::spawn("b", || {});
        assert_ne!(a.id(), b.id());
        ha.join().unwrap();
        hb.join().unwrap();
    }

    #[test]
    fn non_ascii_name_longer_than_max_len_does_not_panic() {
        // Every char is 3 bytes, so byte 15 lands mid-character; truncation
        // must back up to a char boundary instead of slicing through one.
        let (thread, handle) = Thread::spawn("世界世界世界世界世界", || {});
        handle.join().unwrap();
        assert_eq!(thread.name(), "世界世界世界世界世界");
    }
}
