//! Positioned vector I/O on raw file descriptors.
//!
//! mio surfaces readiness but not `writev`/`readv`/`sendmsg`/`sendto`; those
//! go straight through `libc`. `IoSlice`/`IoSliceMut` are ABI-compatible with
//! `iovec`, so multi-segment buffers flush in one syscall without repacking.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Largest iovec batch handed to the kernel in one call. POSIX guarantees at
/// least this many; Linux caps at exactly this (UIO_MAXIOV), and exceeding it
/// fails the whole syscall with `EINVAL`.
pub const IOV_MAX: usize = 1024;

/// Writes the leading `IOV_MAX` segments in one `writev(2)` call. Partial
/// writes are normal and reported truthfully; interrupted calls are retried.
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let bufs = &bufs[..bufs.len().min(IOV_MAX)];
    loop {
        let n = unsafe {
            libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as libc::c_int)
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Reads into the leading `IOV_MAX` segments in one `readv(2)` call.
pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    let take = bufs.len().min(IOV_MAX);
    let bufs = &mut bufs[..take];
    loop {
        let n = unsafe {
            libc::readv(fd, bufs.as_mut_ptr() as *mut libc::iovec, bufs.len() as libc::c_int)
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sends all segments with `sendmsg(2)`, requesting `MSG_ZEROCOPY` on Linux.
///
/// On return the kernel owns the pages until its completion notification
/// arrives on the socket's error queue; callers that cannot track those
/// notifications must not reuse the buffers and should call [`writev`]
/// instead. Falls back to [`writev`] transparently where the flag is
/// unsupported, and on non-Linux targets.
#[cfg(target_os = "linux")]
pub fn sendmsg_zero_copy(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let bufs = &bufs[..bufs.len().min(IOV_MAX)];
    loop {
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;
        let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_ZEROCOPY) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EINVAL) | Some(libc::ENOBUFS) | Some(libc::EOPNOTSUPP) => {
                return writev(fd, bufs)
            }
            _ => return Err(err),
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn sendmsg_zero_copy(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    writev(fd, bufs)
}

/// Sends one datagram to `addr` with `sendto(2)`. Datagram sends are atomic,
/// so this is safe from any thread.
pub fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = sockaddr_from(addr);
    loop {
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Enables `SO_KEEPALIVE` with the given idle time where the platform
/// supports tuning it.
pub(crate) fn set_keep_alive(fd: RawFd, idle_secs: u32) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    #[cfg(target_os = "linux")]
    {
        let idle = idle_secs.max(1) as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                &idle as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = idle_secs;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::os::fd::AsRawFd;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn test_writev_gathers_segments() {
        let (writer, mut reader) = stream_pair();
        let bufs = [IoSlice::new(b"hello "), IoSlice::new(b"world")];
        let n = writev(writer.as_raw_fd(), &bufs).unwrap();
        assert_eq!(n, 11);

        let mut out = [0u8; 11];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn test_readv_scatters_into_segments() {
        let (writer, reader) = stream_pair();
        let bufs = [IoSlice::new(b"abcdefgh")];
        writev(writer.as_raw_fd(), &bufs).unwrap();

        let mut first = [0u8; 3];
        let mut second = [0u8; 5];
        let mut iovs = [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)];
        let n = readv(reader.as_raw_fd(), &mut iovs).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&first, b"abc");
        assert_eq!(&second, b"defgh");
    }

    #[test]
    fn test_sendmsg_zero_copy_delivers() {
        let (writer, mut reader) = stream_pair();
        let payload = vec![0x5au8; 4096];
        let bufs = [IoSlice::new(&payload)];
        let n = sendmsg_zero_copy(writer.as_raw_fd(), &bufs).unwrap();
        assert!(n > 0);

        let mut out = vec![0u8; n];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, payload[..n]);
    }

    #[test]
    fn test_writev_caps_iovec_count() {
        let (writer, mut reader) = stream_pair();
        let byte = [7u8; 1];
        let bufs: Vec<IoSlice<'_>> = (0..IOV_MAX + 200).map(|_| IoSlice::new(&byte)).collect();

        // More segments than the kernel accepts in one call must not fail;
        // the tail stays unwritten and is reported as a partial write.
        let n = writev(writer.as_raw_fd(), &bufs).unwrap();
        assert!(n > 0 && n <= IOV_MAX);

        let mut out = vec![0u8; n];
        reader.read_exact(&mut out).unwrap();
        assert!(out.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_send_to_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = receiver.local_addr().unwrap();

        let n = send_to(sender.as_raw_fd(), b"ping", &dest).unwrap();
        assert_eq!(n, 4);

        let mut buf = [0u8; 16];
        let (got, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..got], b"ping");
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_partial_write_reported() {
        let (writer, _reader) = stream_pair();
        writer.set_nonblocking(true).unwrap();

        // Flood until the socket buffer fills; the final successful writev
        // must report whatever the kernel actually took.
        let chunk = vec![1u8; 256 * 1024];
        let mut wrote_partial_or_blocked = false;
        for _ in 0..64 {
            match writev(writer.as_raw_fd(), &[IoSlice::new(&chunk)]) {
                Ok(n) if n < chunk.len() => {
                    wrote_partial_or_blocked = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wrote_partial_or_blocked = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(wrote_partial_or_blocked);
    }
}
