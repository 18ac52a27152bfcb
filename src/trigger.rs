//! A thread-safe way to interrupt a hub waiting on I/O.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::hub::Hub;

/// One-way wakeup pipe: any thread may [`pull`](Trigger::pull), the hub side
/// [`wait`](Trigger::wait)s. The only legal cross-thread touch on a hub.
#[derive(Debug)]
pub struct Trigger {
    hub: Hub,
    gun: RawFd,
    trigger: RawFd,
    closed: AtomicBool,
}

impl Trigger {
    /// Creates the pipe pair on `hub`. Both ends are nonblocking.
    pub fn new(hub: &Hub) -> crate::Result<Trigger> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
            return Err(crate::Error::Io(io::Error::last_os_error()));
        }
        Ok(Trigger {
            hub: hub.clone(),
            gun: fds[0],
            trigger: fds[1],
            closed: AtomicBool::new(false),
        })
    }

    /// Suspends the current task until another thread pulls the trigger,
    /// draining one pending wakeup.
    pub fn wait(&self, timeout: Option<Duration>) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(bad_fd());
        }
        self.hub.readable(&self.gun, timeout)?;

        let mut byte = 0u8;
        let count = unsafe { libc::read(self.gun, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if count < 0 {
            let error = io::Error::last_os_error();
            // a concurrent wait already drained the pipe; readiness stands
            if error.raw_os_error() != Some(libc::EAGAIN) {
                return Err(crate::Error::Io(error));
            }
        }
        Ok(())
    }

    /// Wakes the hub out of its readiness probe. Callable from any thread.
    ///
    /// Returns quietly when the pipe is full: the pending bytes will wake the
    /// probe regardless, so wakeups coalesce.
    pub fn pull(&self) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(bad_fd());
        }
        loop {
            let count =
                unsafe { libc::write(self.trigger, b"x".as_ptr() as *const libc::c_void, 1) };
            if count >= 0 {
                return Ok(());
            }
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(()),
                _ => return Err(crate::Error::Io(error)),
            }
        }
    }

    /// Releases both descriptors, exactly once. Later operations report
    /// `EBADF`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(self.gun);
                libc::close(self.trigger);
            }
        }
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.close();
    }
}

fn bad_fd() -> crate::Error {
    crate::Error::Io(io::Error::from_raw_os_error(libc::EBADF))
}
