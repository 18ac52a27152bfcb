//! Nonblocking socket operations that read like blocking ones.
//!
//! Every function suspends the calling task through [`Hub::poll`] instead of
//! blocking the thread. Sockets are expected to be in nonblocking mode;
//! [`connect`] and [`accept`] arrange that themselves.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::hub::Hub;
use crate::util::{find, prefixes};
use crate::Error;

/// Connects to `addr` without blocking other tasks.
///
/// An in-progress connect becomes a write-readiness wait followed by an
/// `SO_ERROR` inspection; a nonzero code is surfaced as the socket error.
pub fn connect(hub: &Hub, addr: SocketAddr, timeout: Option<Duration>) -> crate::Result<TcpStream> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // owns fd from here on
    let stream = unsafe { TcpStream::from_raw_fd(fd) };

    let (storage, length) = addr_to_sockaddr(addr);
    loop {
        let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, length) };
        if ret == 0 {
            return Ok(stream);
        }
        let error = io::Error::last_os_error();
        match error.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EALREADY) => break,
            Some(libc::EINTR) => continue,
            _ => return Err(Error::Io(error)),
        }
    }

    hub.writeable(&stream, timeout)?;

    let code = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if code != 0 {
        return Err(Error::Io(io::Error::from_raw_os_error(code)));
    }
    Ok(stream)
}

/// Accepts one connection; the returned stream is nonblocking.
pub fn accept(
    hub: &Hub,
    listener: &TcpListener,
    timeout: Option<Duration>,
) -> crate::Result<(TcpStream, SocketAddr)> {
    let deadline = deadline_from(timeout);
    loop {
        hub.readable(listener, remaining(deadline))?;
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(true)?;
                return Ok((stream, addr));
            }
            // another waiter took the connection; wait for the next one
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
            Err(error) => return Err(Error::Io(error)),
        }
    }
}

/// Sends once, suspending until the socket is writeable.
pub fn send(
    hub: &Hub,
    sock: &impl AsRawFd,
    data: &[u8],
    timeout: Option<Duration>,
) -> crate::Result<usize> {
    hub.writeable(sock, timeout)?;
    let count = unsafe {
        libc::send(
            sock.as_raw_fd(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if count < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(count as usize)
}

/// Sends the whole buffer, recomputing the remaining timeout between writes.
pub fn sendall(
    hub: &Hub,
    sock: &impl AsRawFd,
    data: &[u8],
    timeout: Option<Duration>,
) -> crate::Result<()> {
    let deadline = deadline_from(timeout);
    let mut sent = 0;
    while sent < data.len() {
        sent += send(hub, sock, &data[sent..], remaining(deadline))?;
    }
    Ok(())
}

/// Receives once, suspending until the socket is readable. A return of zero
/// means the peer closed.
pub fn recv(
    hub: &Hub,
    sock: &impl AsRawFd,
    buffer: &mut [u8],
    timeout: Option<Duration>,
) -> crate::Result<usize> {
    hub.readable(sock, timeout)?;
    recv_raw(sock.as_raw_fd(), buffer, 0)
}

/// Receives exactly `n` bytes. A peer close short of `n` is
/// [`Error::ConnectionLost`].
pub fn recv_bytes(
    hub: &Hub,
    sock: &impl AsRawFd,
    n: usize,
    timeout: Option<Duration>,
) -> crate::Result<Vec<u8>> {
    let bufsize = recv_buffer_size(sock)?;
    let deadline = deadline_from(timeout);
    let mut data = Vec::with_capacity(n);
    let mut chunk = vec![0; bufsize];
    while data.len() < n {
        let want = (n - data.len()).min(bufsize);
        let count = recv(hub, sock, &mut chunk[..want], remaining(deadline))?;
        if count == 0 {
            return Err(Error::ConnectionLost);
        }
        data.extend_from_slice(&chunk[..count]);
    }
    Ok(data)
}

/// Receives through the first occurrence of `term` (inclusive), consuming
/// nothing past it. Bytes that could be the start of a straddling terminator
/// stay in the kernel buffer until the rest arrives.
pub fn recv_until(
    hub: &Hub,
    sock: &impl AsRawFd,
    term: &[u8],
    timeout: Option<Duration>,
) -> crate::Result<Vec<u8>> {
    assert!(!term.is_empty(), "recv_until requires a terminator");
    let bufsize = recv_buffer_size(sock)?.max(term.len());
    let deadline = deadline_from(timeout);
    let mut data = Vec::new();
    let mut chunk = vec![0; bufsize];
    loop {
        hub.readable(sock, remaining(deadline))?;
        let peeked = recv_raw(sock.as_raw_fd(), &mut chunk, libc::MSG_PEEK)?;
        if peeked == 0 {
            return Err(Error::ConnectionLost);
        }
        let window = &chunk[..peeked];

        if let Some(position) = find(window, term) {
            let take = position + term.len();
            let count = recv_raw(sock.as_raw_fd(), &mut chunk[..take], 0)?;
            data.extend_from_slice(&chunk[..count]);
            return Ok(data);
        }

        // hold back any suffix that could be the start of the terminator
        let mut keep = 0;
        for prefix in prefixes(term) {
            if window.ends_with(prefix) {
                keep = prefix.len();
                break;
            }
        }
        let consume = peeked - keep;
        if consume > 0 {
            let count = recv_raw(sock.as_raw_fd(), &mut chunk[..consume], 0)?;
            data.extend_from_slice(&chunk[..count]);
        }
    }
}

fn recv_raw(fd: RawFd, buffer: &mut [u8], flags: libc::c_int) -> crate::Result<usize> {
    let count = unsafe {
        libc::recv(
            fd,
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
            flags,
        )
    };
    if count < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(count as usize)
}

fn recv_buffer_size(sock: &impl AsRawFd) -> crate::Result<usize> {
    let size = getsockopt_int(sock.as_raw_fd(), libc::SOL_SOCKET, libc::SO_RCVBUF)?;
    Ok(size.max(1) as usize)
}

fn getsockopt_int(fd: RawFd, level: libc::c_int, option: libc::c_int) -> crate::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut length = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            level,
            option,
            &mut value as *mut _ as *mut libc::c_void,
            &mut length,
        )
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(value)
}

fn addr_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin };
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6 };
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn deadline_from(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}

/// Time left until `deadline`. An elapsed deadline polls with a zero timeout,
/// which surfaces as `Timeout` on the next dispatch cycle.
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::os::unix::net::UnixStream;

    use crate::queue::Queue;

    use super::*;

    fn pair() -> (UnixStream, UnixStream) {
        let (left, right) = UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        right.set_nonblocking(true).unwrap();
        (left, right)
    }

    #[test]
    fn send_and_recv_round_trip() {
        let hub = Hub::new();
        let (left, right) = pair();

        let sent = send(&hub, &left, b"hello", None).unwrap();
        assert_eq!(sent, 5);

        let mut buffer = [0; 16];
        let received = recv(&hub, &right, &mut buffer, None).unwrap();
        assert_eq!(&buffer[..received], b"hello");
    }

    #[test]
    fn sendall_pushes_past_a_full_buffer() {
        let hub = Hub::new();
        let (left, right) = pair();
        let data: Vec<u8> = (0..1_000_000u32).map(|n| n as u8).collect();
        let received = Queue::new(&hub);

        hub.spawn({
            let hub = hub.clone();
            let received = received.clone();
            let total = data.len();
            move || {
                let bytes = recv_bytes(&hub, &right, total, None).unwrap();
                received.append(bytes, None).unwrap();
            }
        });

        sendall(&hub, &left, &data, None).unwrap();

        assert_eq!(received.pop(None).unwrap(), data);
    }

    #[test]
    fn recv_bytes_reports_connection_lost() {
        let hub = Hub::new();
        let (left, right) = pair();

        (&left).write_all(b"abc").unwrap();
        drop(left);

        let error = recv_bytes(&hub, &right, 10, None).unwrap_err();
        assert!(matches!(error, Error::ConnectionLost));
    }

    #[test]
    fn recv_until_stops_at_the_terminator() {
        let hub = Hub::new();
        let (left, right) = pair();

        (&left).write_all(b"line one\nline two\n").unwrap();

        assert_eq!(recv_until(&hub, &right, b"\n", None).unwrap(), b"line one\n");
        assert_eq!(recv_until(&hub, &right, b"\n", None).unwrap(), b"line two\n");
    }

    #[test]
    fn recv_until_handles_a_straddled_terminator() {
        let hub = Hub::new();
        let (left, right) = pair();

        (&left).write_all(b"abc\r").unwrap();
        hub.call_later(Duration::from_millis(20), {
            let hub = hub.clone();
            move || sendall(&hub, &left, b"\nrest", None).unwrap()
        });

        let line = recv_until(&hub, &right, b"\r\n", None).unwrap();
        assert_eq!(line, b"abc\r\n");

        // the bytes past the terminator were left unconsumed
        let mut buffer = [0; 16];
        let count = recv(&hub, &right, &mut buffer, None).unwrap();
        assert_eq!(&buffer[..count], b"rest");
    }

    #[test]
    fn recv_times_out() {
        let hub = Hub::new();
        let (_left, right) = pair();

        let mut buffer = [0; 16];
        let error = recv(&hub, &right, &mut buffer, Some(Duration::from_millis(10))).unwrap_err();

        assert!(matches!(error, Error::Timeout));
    }

    #[test]
    fn connect_and_accept_over_loopback() {
        let hub = Hub::new();
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        hub.spawn({
            let hub = hub.clone();
            move || {
                let (stream, _addr) = accept(&hub, &listener, Some(Duration::from_secs(5))).unwrap();
                sendall(&hub, &stream, b"hi", None).unwrap();
            }
        });

        let stream = connect(&hub, addr, Some(Duration::from_secs(5))).unwrap();
        let greeting = recv_bytes(&hub, &stream, 2, Some(Duration::from_secs(5))).unwrap();

        assert_eq!(greeting, b"hi");
        hub.run();
    }
}
