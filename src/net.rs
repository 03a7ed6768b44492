//! TCP settings for long-lived connections.
//!
//! Idle WebSocket connections are dropped by NATs and load balancers unless
//! something keeps the path warm, so both legs of a pairing get TCP keep-alive
//! probing on top of low-latency mode.

use std::time::Duration;
use tokio::net::TcpStream;

/// Enable TCP_NODELAY and TCP keep-alive with the given idle time
pub fn harden(stream: &TcpStream, keepalive: Duration) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    set_keepalive(stream, keepalive)
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream, idle: Duration) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;

    let secs = idle.as_secs().clamp(1, libc::c_int::MAX as u64) as libc::c_int;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs)?;
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, secs)?;
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPALIVE, secs)?;
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    )))]
    let _ = secs;

    Ok(())
}

#[cfg(unix)]
fn setsockopt(
    fd: std::os::unix::io::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream, _idle: Duration) -> std::io::Result<()> {
    Ok(())
}
