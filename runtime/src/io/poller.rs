//! Raw `epoll`/`eventfd` FFI, in the direct-syscall style `fiber`'s stack
//! allocator already uses for `mmap`/`mprotect`.

use std::io;
use std::os::fd::RawFd;

/// Thin wrapper around an `epoll_create1` instance. Closed on drop.
pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        // Safety: no preconditions; EPOLL_CLOEXEC avoids leaking the fd
        // across `fork`+`exec`.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn add(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    pub fn modify(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        // Safety: `event` is ignored by the kernel for EPOLL_CTL_DEL on
        // modern Linux but older kernels require a non-null pointer.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let ret = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, &mut event) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: token,
        };
        // Safety: `event` is a valid, live `epoll_event`.
        let ret = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits for readiness, retrying internally on `EINTR`. `timeout_ms` of
    /// `-1` blocks indefinitely.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let capacity = libc::c_int::try_from(events.len()).unwrap_or(libc::c_int::MAX);
        loop {
            // Safety: `events` is a valid buffer of at least `capacity` entries.
            let ret =
                unsafe { libc::epoll_wait(self.fd, events.as_mut_ptr(), capacity, timeout_ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(usize::try_from(ret).unwrap_or(0));
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // Safety: `fd` was opened by `epoll_create1` in `new` and is not
        // shared.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A self-pipe used to interrupt a blocked `epoll_wait` from another thread.
pub(crate) struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        // Safety: no preconditions.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wakes anything blocked in `epoll_wait` on this fd's readability.
    pub fn notify(&self) {
        let value: u64 = 1;
        // Safety: `fd` is a valid eventfd; writing 8 bytes is the documented
        // protocol. EAGAIN (counter already saturated) is fine to ignore:
        // a pending wake is still pending.
        unsafe {
            libc::write(self.fd, std::ptr::from_ref(&value).cast(), 8);
        }
    }

    /// Drains the counter so the fd stops being readable.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        // Safety: `buf` is sized for the eventfd read protocol.
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr().cast(), 8);
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        // Safety: `fd` was opened by `eventfd` in `new` and is not shared.
        unsafe {
            libc::close(self.fd);
        }
    }
}
