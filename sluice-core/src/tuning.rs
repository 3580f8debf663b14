//! Socket tuning applied right after a connect succeeds.
//!
//! - **TCP_NODELAY**: requests are small and latency bound; on by default
//! - **SO_SNDBUF / SO_RCVBUF**: optional buffer sizing for bulk ingestion
//! - **SO_KEEPALIVE**: OS-level dead peer detection under the application
//!   keep-alive, with per-socket timings on Linux

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

/// TCP socket options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm.
    pub nodelay: bool,

    /// SO_SNDBUF. None = system default.
    pub send_buffer: Option<usize>,

    /// SO_RCVBUF. None = system default.
    pub recv_buffer: Option<usize>,

    /// OS keep-alive. None = leave disabled.
    pub keepalive: Option<TcpKeepalive>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            send_buffer: None,
            recv_buffer: None,
            keepalive: Some(TcpKeepalive::default()),
        }
    }
}

impl TcpConfig {
    /// Options for bulk uploads: Nagle on, large buffers.
    pub fn high_throughput() -> Self {
        Self {
            nodelay: false,
            send_buffer: Some(256 * 1024),
            recv_buffer: Some(256 * 1024),
            keepalive: Some(TcpKeepalive::default()),
        }
    }

    /// Apply to a connected stream.
    ///
    /// Every option is attempted; the first error is returned.
    #[cfg(unix)]
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        use libc::{IPPROTO_TCP, SO_KEEPALIVE, SO_RCVBUF, SO_SNDBUF, SOL_SOCKET, TCP_NODELAY};

        let fd = stream.as_raw_fd();
        let mut first_err = None;
        let mut record = |res: io::Result<()>| {
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        };

        record(set_int(fd, IPPROTO_TCP, TCP_NODELAY, self.nodelay as libc::c_int));

        if let Some(size) = self.send_buffer {
            record(set_int(fd, SOL_SOCKET, SO_SNDBUF, clamp(size)));
        }
        if let Some(size) = self.recv_buffer {
            record(set_int(fd, SOL_SOCKET, SO_RCVBUF, clamp(size)));
        }

        if let Some(ref keepalive) = self.keepalive {
            record(set_int(fd, SOL_SOCKET, SO_KEEPALIVE, 1));
            record(keepalive.apply_to_fd(fd));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Apply to a connected stream (non-Unix: nodelay only).
    #[cfg(not(unix))]
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)
    }
}

/// OS keep-alive timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpKeepalive {
    /// Idle time before the first probe.
    #[serde(with = "crate::config::duration_serde")]
    pub time: Duration,
    /// Interval between probes.
    #[serde(with = "crate::config::duration_serde")]
    pub interval: Duration,
    /// Unanswered probes before the socket is reset.
    pub retries: u32,
}

impl Default for TcpKeepalive {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            retries: 6,
        }
    }
}

impl TcpKeepalive {
    #[cfg(target_os = "linux")]
    fn apply_to_fd(&self, fd: RawFd) -> io::Result<()> {
        use libc::{IPPROTO_TCP, TCP_KEEPCNT, TCP_KEEPIDLE, TCP_KEEPINTVL};

        set_int(fd, IPPROTO_TCP, TCP_KEEPIDLE, secs(self.time))?;
        set_int(fd, IPPROTO_TCP, TCP_KEEPINTVL, secs(self.interval))?;
        set_int(fd, IPPROTO_TCP, TCP_KEEPCNT, self.retries.min(i32::MAX as u32) as libc::c_int)
    }

    // Timings are Linux only; elsewhere SO_KEEPALIVE uses system defaults.
    #[cfg(all(unix, not(target_os = "linux")))]
    fn apply_to_fd(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn set_int(fd: RawFd, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> io::Result<()> {
    // SAFETY: `fd` is an open socket owned by the caller's stream and `val`
    // outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
#[inline]
fn clamp(size: usize) -> libc::c_int {
    size.min(libc::c_int::MAX as usize) as libc::c_int
}

#[cfg(target_os = "linux")]
#[inline]
fn secs(d: Duration) -> libc::c_int {
    d.as_secs().clamp(1, libc::c_int::MAX as u64) as libc::c_int
}
