//! TCP socket tuning.
//!
//! Commands such as `RDY` and `FIN` are tiny; Nagle's algorithm would hold
//! them back waiting for more data, so every broker socket gets `TCP_NODELAY`.
//!
//! # Safety
//!
//! The raw descriptor is borrowed into a `socket2::Socket` for the duration of
//! one `setsockopt` call and then forgotten so it is never closed twice.

#![allow(unsafe_code)]

use std::io;

/// Enable `TCP_NODELAY` on a compio `TcpStream`.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &compio::net::TcpStream) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let res = sock.set_nodelay(true);
        std::mem::forget(sock);
        res
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let res = sock.set_nodelay(true);
        std::mem::forget(sock);
        res
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = stream;
        Ok(())
    }
}
