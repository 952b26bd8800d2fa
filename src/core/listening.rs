// src/core/listening.rs

//! The listening-socket registry: descriptor-bearing records for every bound,
//! listening socket, plus the open/configure/close passes the cycle runs over
//! them. Sockets are inherited across reloads by fd and across binary
//! upgrades through the reserved environment variable.

use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{error, info, warn};

use crate::core::errors::PeridotError;

/// Environment variable carrying inherited descriptors across exec, spelled
/// literally for compatibility.
pub const INHERIT_ENV: &str = "NGINX";

/// Default listen(2) backlog.
pub const DEFAULT_BACKLOG: i32 = 511;

/// Accept-phase timeout applied by the event subsystem.
pub const DEFAULT_POST_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LsFlags: u32 {
        /// fd is open.
        const OPEN        = 1 << 0;
        /// Matched by the next cycle; must survive the commit close pass.
        const REMAIN      = 1 << 1;
        /// Skipped by every pass.
        const IGNORE      = 1 << 2;
        /// bind() has been issued by this process.
        const BOUND       = 1 << 3;
        /// fd was inherited from the environment or a previous cycle.
        const INHERITED   = 1 << 4;
        /// listen() must be (re-)issued, e.g. after a backlog change.
        const LISTEN      = 1 << 5;
        const NONBLOCKING = 1 << 6;
        /// Accept coordination is delegated to the event subsystem.
        const SHARED      = 1 << 7;
        const KEEPALIVE   = 1 << 8;
        #[cfg(target_os = "linux")]
        const DEFERRED    = 1 << 9;
        #[cfg(target_os = "linux")]
        const FASTOPEN    = 1 << 10;
        const IPV6ONLY    = 1 << 11;
    }
}

/// Callback invoked by the event subsystem for each accepted connection.
pub type ConnectionHandler = fn(RawFd);

#[derive(Debug)]
pub struct Listening {
    pub fd: RawFd,
    pub addr: SocketAddr,
    pub addr_text: String,
    pub backlog: i32,
    pub rcvbuf: Option<i32>,
    pub sndbuf: Option<i32>,
    pub handler: Option<ConnectionHandler>,
    /// Size of the per-connection pool the consumer creates on accept.
    pub pool_size: usize,
    pub post_accept_timeout: Duration,
    /// Index of the matching entry in the previous cycle, valid only during
    /// the reload handshake; cleared in worker init.
    pub previous: Option<usize>,
    /// Connection slot the event subsystem attached to this socket.
    pub connection: Option<usize>,
    pub flags: LsFlags,
    #[cfg(target_os = "linux")]
    pub fastopen_qlen: i32,
}

impl Listening {
    pub fn new(addr: SocketAddr) -> Listening {
        Listening {
            fd: -1,
            addr,
            addr_text: addr.to_string(),
            backlog: DEFAULT_BACKLOG,
            rcvbuf: None,
            sndbuf: None,
            handler: None,
            pool_size: 0,
            post_accept_timeout: DEFAULT_POST_ACCEPT_TIMEOUT,
            previous: None,
            connection: None,
            flags: LsFlags::empty(),
            #[cfg(target_os = "linux")]
            fastopen_qlen: 0,
        }
    }

    /// Builds an entry for a descriptor inherited through the environment.
    pub fn inherited(fd: RawFd, addr: SocketAddr) -> Listening {
        let mut ls = Listening::new(addr);
        ls.fd = fd;
        ls.flags = LsFlags::INHERITED | LsFlags::OPEN | LsFlags::BOUND;
        ls
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in)
                    .write(sin);
            }
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
            unsafe {
                (&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
                    .write(sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn set_int_opt(fd: RawFd, level: i32, opt: i32, value: i32) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const i32 as *const libc::c_void,
            mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Marks a descriptor nonblocking.
pub fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Open-sockets pass: create, bind and listen on every entry that does not
/// yet carry a descriptor. Address conflicts are retried a few times to ride
/// out a predecessor that has not finished closing.
pub fn open_listening_sockets(listening: &mut [Listening]) -> Result<(), PeridotError> {
    for attempt in 0..5u32 {
        let mut failed = false;

        for ls in listening.iter_mut() {
            if ls.flags.contains(LsFlags::IGNORE) || ls.fd != -1 {
                continue;
            }

            let domain = if ls.addr.is_ipv4() {
                libc::AF_INET
            } else {
                libc::AF_INET6
            };

            let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
            if fd == -1 {
                return Err(PeridotError::Bind {
                    addr: ls.addr_text.clone(),
                    source: nix::errno::Errno::last(),
                });
            }

            if let Err(e) = set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
                error!(addr = %ls.addr_text, "setsockopt(SO_REUSEADDR) failed: {e}");
                let errno = nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0));
                unsafe { libc::close(fd) };
                return Err(PeridotError::Bind {
                    addr: ls.addr_text.clone(),
                    source: errno,
                });
            }

            let (storage, socklen) = sockaddr_from(&ls.addr);
            let rc = unsafe {
                libc::bind(
                    fd,
                    &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                    socklen,
                )
            };
            if rc == -1 {
                let errno = nix::errno::Errno::last();
                unsafe { libc::close(fd) };
                if errno == nix::errno::Errno::EADDRINUSE && attempt < 4 {
                    warn!(addr = %ls.addr_text, "address in use, retrying bind");
                    failed = true;
                    continue;
                }
                return Err(PeridotError::Bind {
                    addr: ls.addr_text.clone(),
                    source: errno,
                });
            }

            if unsafe { libc::listen(fd, ls.backlog) } == -1 {
                let errno = nix::errno::Errno::last();
                unsafe { libc::close(fd) };
                return Err(PeridotError::Bind {
                    addr: ls.addr_text.clone(),
                    source: errno,
                });
            }

            ls.fd = fd;
            ls.flags |= LsFlags::OPEN | LsFlags::BOUND | LsFlags::LISTEN;
            info!(addr = %ls.addr_text, fd, "listening");
        }

        if !failed {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    Err(PeridotError::Reload("could not bind listening sockets".into()))
}

/// Configure-sockets pass: applies per-entry options. Failures are reported
/// but never abort the pass; each option is a platform capability.
pub fn configure_listening_sockets(listening: &mut [Listening]) {
    for ls in listening.iter_mut() {
        if ls.fd == -1 || ls.flags.contains(LsFlags::IGNORE) {
            continue;
        }

        if let Some(rcvbuf) = ls.rcvbuf
            && let Err(e) = set_int_opt(ls.fd, libc::SOL_SOCKET, libc::SO_RCVBUF, rcvbuf)
        {
            warn!(addr = %ls.addr_text, "setsockopt(SO_RCVBUF, {rcvbuf}) failed: {e}");
        }

        if let Some(sndbuf) = ls.sndbuf
            && let Err(e) = set_int_opt(ls.fd, libc::SOL_SOCKET, libc::SO_SNDBUF, sndbuf)
        {
            warn!(addr = %ls.addr_text, "setsockopt(SO_SNDBUF, {sndbuf}) failed: {e}");
        }

        if ls.flags.contains(LsFlags::KEEPALIVE)
            && let Err(e) = set_int_opt(ls.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)
        {
            warn!(addr = %ls.addr_text, "setsockopt(SO_KEEPALIVE) failed: {e}");
        }

        if ls.flags.contains(LsFlags::IPV6ONLY)
            && ls.addr.is_ipv6()
            && let Err(e) = set_int_opt(ls.fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1)
        {
            warn!(addr = %ls.addr_text, "setsockopt(IPV6_V6ONLY) failed: {e}");
        }

        #[cfg(target_os = "linux")]
        {
            if ls.flags.contains(LsFlags::DEFERRED)
                && let Err(e) = set_int_opt(
                    ls.fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_DEFER_ACCEPT,
                    ls.post_accept_timeout.as_secs() as i32,
                )
            {
                warn!(addr = %ls.addr_text, "setsockopt(TCP_DEFER_ACCEPT) failed: {e}");
            }

            if ls.flags.contains(LsFlags::FASTOPEN)
                && let Err(e) = set_int_opt(
                    ls.fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_FASTOPEN,
                    ls.fastopen_qlen,
                )
            {
                warn!(addr = %ls.addr_text, "setsockopt(TCP_FASTOPEN) failed: {e}");
            }
        }

        // re-listen picks up a changed backlog on an inherited fd
        if ls.flags.contains(LsFlags::INHERITED | LsFlags::LISTEN)
            && unsafe { libc::listen(ls.fd, ls.backlog) } == -1
        {
            warn!(
                addr = %ls.addr_text,
                "listen(backlog={}) failed: {}",
                ls.backlog,
                std::io::Error::last_os_error()
            );
        }

        if ls.flags.contains(LsFlags::NONBLOCKING)
            && let Err(e) = set_nonblocking(ls.fd)
        {
            warn!(addr = %ls.addr_text, "fcntl(O_NONBLOCK) failed: {e}");
        }
    }
}

/// Close-sockets pass: closes every open entry not marked to remain.
pub fn close_listening_sockets(listening: &mut [Listening]) {
    for ls in listening.iter_mut() {
        if !ls.flags.contains(LsFlags::OPEN) || ls.flags.contains(LsFlags::REMAIN) {
            continue;
        }
        if unsafe { libc::close(ls.fd) } == -1 {
            error!(
                addr = %ls.addr_text,
                "close() failed: {}",
                std::io::Error::last_os_error()
            );
        }
        ls.fd = -1;
        ls.flags.remove(LsFlags::OPEN | LsFlags::BOUND | LsFlags::LISTEN);
    }
}

/// Serializes the listening set for the reserved environment variable:
/// `fd:addr` pairs joined by `;`.
pub fn format_inherited_env(listening: &[Listening]) -> String {
    let mut out = String::new();
    for ls in listening {
        if ls.fd == -1 || ls.flags.contains(LsFlags::IGNORE) {
            continue;
        }
        if !out.is_empty() {
            out.push(';');
        }
        out.push_str(&format!("{}:{}", ls.fd, ls.addr_text));
    }
    out
}

/// Parses the reserved environment variable back into listening entries.
/// Each pair splits at the first `:` so IPv6 address text survives.
pub fn parse_inherited_env(value: &str) -> Result<Vec<Listening>, PeridotError> {
    let mut out = Vec::new();
    for pair in value.split(';').filter(|p| !p.is_empty()) {
        let (fd_text, addr_text) = pair.split_once(':').ok_or_else(|| {
            PeridotError::Fatal(format!("malformed inherited socket entry \"{pair}\""))
        })?;

        let fd: RawFd = fd_text.parse().map_err(|_| {
            PeridotError::Fatal(format!("malformed inherited descriptor \"{fd_text}\""))
        })?;
        let addr: SocketAddr = addr_text.parse().map_err(|_| {
            PeridotError::Fatal(format!("malformed inherited address \"{addr_text}\""))
        })?;

        out.push(Listening::inherited(fd, addr));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherited_env_round_trips() {
        let mut a = Listening::new("127.0.0.1:8080".parse().unwrap());
        a.fd = 7;
        a.flags = LsFlags::OPEN;
        let mut b = Listening::new("[::1]:9090".parse().unwrap());
        b.fd = 9;
        b.flags = LsFlags::OPEN;

        let env = format_inherited_env(&[a, b]);
        let parsed = parse_inherited_env(&env).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].fd, 7);
        assert_eq!(parsed[0].addr, "127.0.0.1:8080".parse().unwrap());
        assert!(parsed[0].flags.contains(LsFlags::INHERITED));
        assert_eq!(parsed[1].fd, 9);
        assert_eq!(parsed[1].addr, "[::1]:9090".parse().unwrap());
    }

    #[test]
    fn malformed_env_is_rejected() {
        assert!(parse_inherited_env("nonsense").is_err());
        assert!(parse_inherited_env("x:127.0.0.1:80").is_err());
    }

    #[test]
    fn open_close_cycle_on_loopback() {
        let mut set = vec![Listening::new("127.0.0.1:0".parse().unwrap())];
        open_listening_sockets(&mut set).unwrap();
        assert!(set[0].fd >= 0);
        assert!(set[0].flags.contains(LsFlags::OPEN | LsFlags::BOUND | LsFlags::LISTEN));

        configure_listening_sockets(&mut set);

        close_listening_sockets(&mut set);
        assert_eq!(set[0].fd, -1);
        assert!(!set[0].flags.contains(LsFlags::OPEN));
    }

    #[test]
    fn remain_survives_the_close_pass() {
        let mut set = vec![Listening::new("127.0.0.1:0".parse().unwrap())];
        open_listening_sockets(&mut set).unwrap();
        set[0].flags |= LsFlags::REMAIN;

        close_listening_sockets(&mut set);
        assert!(set[0].fd >= 0);

        set[0].flags.remove(LsFlags::REMAIN);
        close_listening_sockets(&mut set);
    }
}
