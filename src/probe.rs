//! Readiness probe over poll(2).
//!
//! Level-triggered: an entry is reported ready as long as the condition
//! holds, so a resumed task can simply retry its syscall.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::hub::Interest;

/// One registered fd wait, ready to be handed to the kernel. The same fd may
/// appear in any number of entries.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Entry {
    pub(crate) key: usize,
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    /// Keys of the entries whose conditions hold.
    Ready(Vec<usize>),
    TimedOut,
    /// A signal arrived; retry with a refreshed timeout.
    Interrupted,
}

/// Blocks until any entry is ready, the timeout elapses, or a signal arrives.
/// `None` waits indefinitely.
pub(crate) fn probe(entries: &[Entry], timeout: Option<Duration>) -> Outcome {
    let mut fds: Vec<libc::pollfd> = entries
        .iter()
        .map(|entry| libc::pollfd {
            fd: entry.fd,
            events: events(entry.interest),
            revents: 0,
        })
        .collect();

    let count = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            poll_timeout(timeout),
        )
    };
    if count < 0 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::EINTR) {
            return Outcome::Interrupted;
        }
        panic!("readiness probe failed: {error}");
    }
    if count == 0 {
        return Outcome::TimedOut;
    }

    let ready = entries
        .iter()
        .zip(&fds)
        .filter(|(_, pollfd)| fired(pollfd.events, pollfd.revents))
        .map(|(entry, _)| entry.key)
        .collect();
    Outcome::Ready(ready)
}

fn events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READ) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::POLLOUT;
    }
    if interest.contains(Interest::EXC) {
        events |= libc::POLLPRI;
    }
    events
}

/// Error conditions wake a wait regardless of its mask, matching select().
fn fired(events: libc::c_short, revents: libc::c_short) -> bool {
    revents & (events | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
}

/// poll(2) takes whole milliseconds; round up so deadlines never fire early.
fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => {
            let millis = duration
                .as_secs()
                .saturating_mul(1_000)
                .saturating_add(u64::from(duration.subsec_nanos().div_ceil(1_000_000)));
            millis.min(libc::c_int::MAX as u64) as libc::c_int
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (UnixStream, UnixStream) {
        let (left, right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        right.set_nonblocking(true).unwrap();
        (left, right)
    }

    #[test]
    fn fresh_socket_is_writable() {
        let (left, _right) = pair();
        let entries = [Entry {
            key: 7,
            fd: left.as_raw_fd(),
            interest: Interest::WRITE,
        }];

        let outcome = probe(&entries, Some(Duration::from_secs(1)));

        assert!(matches!(outcome, Outcome::Ready(keys) if keys == [7]));
    }

    #[test]
    fn combined_interest_fires_on_either_condition() {
        let (left, _right) = pair();
        let entries = [Entry {
            key: 3,
            fd: left.as_raw_fd(),
            interest: Interest::READ | Interest::WRITE,
        }];

        // nothing to read, but the socket is writable
        let outcome = probe(&entries, Some(Duration::from_secs(1)));

        assert!(matches!(outcome, Outcome::Ready(keys) if keys == [3]));
    }

    #[test]
    fn empty_socket_times_out() {
        let (left, _right) = pair();
        let entries = [Entry {
            key: 0,
            fd: left.as_raw_fd(),
            interest: Interest::READ,
        }];

        let outcome = probe(&entries, Some(Duration::from_millis(10)));

        assert!(matches!(outcome, Outcome::TimedOut));
    }

    #[test]
    fn closed_peer_fires_a_read_wait() {
        let (left, right) = pair();
        drop(right);
        let entries = [Entry {
            key: 0,
            fd: left.as_raw_fd(),
            interest: Interest::READ,
        }];

        let outcome = probe(&entries, Some(Duration::from_secs(1)));

        assert!(matches!(outcome, Outcome::Ready(keys) if keys == [0]));
    }

    #[test]
    fn timeouts_round_up_to_whole_milliseconds() {
        assert_eq!(poll_timeout(None), -1);
        assert_eq!(poll_timeout(Some(Duration::ZERO)), 0);
        assert_eq!(poll_timeout(Some(Duration::from_micros(1_500))), 2);
        assert_eq!(poll_timeout(Some(Duration::from_millis(250))), 250);
    }
}
