use std::io;
use std::mem;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

/// Opens a socket bound to `port` on all interfaces and joined to `group`.
///
/// Address reuse is enabled before binding so several processes on one host
/// can listen to the same group and port.
pub fn bind_receiver(
    group: Ipv4Addr,
    port: u16,
    recv_buf_size: Option<usize>,
    poll_interval: Duration,
) -> io::Result<UdpSocket> {
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    set_option(&fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    set_option(&fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    if let Some(size) = recv_buf_size {
        let size = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
        set_option(&fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size)?;
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
    };
    let res = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }

    let socket = UdpSocket::from(fd);
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_read_timeout(Some(poll_interval))?;
    Ok(socket)
}

/// Opens an unbound-port sender with the given multicast hop limit and
/// loopback enabled, so receivers on this host see our own traffic.
pub fn bind_sender(ttl: u8) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_multicast_ttl_v4(ttl as u32)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

fn set_option(fd: &OwnedFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
