use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;

use mio::net::{TcpListener, TcpStream};

/// Parses `host` and `port` into a `SocketAddr`, the way command-line
/// arguments for this program are expected to name a destination.
pub fn parse_address(host: &str, port: u16) -> io::Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("not a valid IP address: {host}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// Binds and starts listening on `addr`. The returned listener is
/// non-blocking, as required to drive it from a `mio::Poll`.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr)
}

/// Initiates a non-blocking connection to `addr`. The connect may still be
/// in progress when this returns; callers must wait for the stream to
/// become writable and then check `take_error` before trusting it.
pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    set_socket_buf_size(&stream, TUNNEL_SOCKET_BUF, TUNNEL_SOCKET_BUF)?;
    Ok(stream)
}

/// Kernel send/receive buffer size applied to the tunnel socket; the
/// multiplexed stream carries every client's traffic, so it's sized well
/// above a single client's buffer rather than left at the OS default.
const TUNNEL_SOCKET_BUF: usize = 64 * 1024;

/// Tunes the socket's kernel send/receive buffer sizes. Mirrors the
/// `setsockopt(SO_SNDBUF/SO_RCVBUF)` tuning this codebase applies to every
/// TCP socket it owns, rather than leaving them at the OS default.
pub fn set_socket_buf_size(stream: &TcpStream, send: usize, recv: usize) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    let send = send as libc::c_int;
    let recv = recv as libc::c_int;
    unsafe {
        let rc = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            std::ptr::from_ref(&send).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::from_ref(&recv).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
