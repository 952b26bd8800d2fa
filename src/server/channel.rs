// src/server/channel.rs

//! Master/worker command channel: a Unix-domain socketpair per worker over
//! which fixed-layout records travel, with descriptors attached as ancillary
//! SCM_RIGHTS data when a command carries one. Channel commands land in the
//! same flags the signal handler sets, so both paths share handling code.

use std::mem;
use std::os::fd::RawFd;
use std::ptr;

use libc::c_void;
use tracing::{error, trace};

use crate::core::errors::PeridotError;

/// Introduce a sibling worker: `pid`, `slot` and its channel write end.
pub const CMD_OPEN_CHANNEL: u32 = 1;
/// Forget a sibling worker.
pub const CMD_CLOSE_CHANNEL: u32 = 2;
/// Graceful shutdown.
pub const CMD_QUIT: u32 = 3;
/// Forced shutdown.
pub const CMD_TERMINATE: u32 = 4;
/// Reopen registered files.
pub const CMD_REOPEN: u32 = 5;

/// The fixed wire record. Endianness is native: both sides are the same
/// binary on the same host.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMsg {
    pub command: u32,
    pub pid: i32,
    pub slot: i32,
    /// Transmitted out-of-band when >= 0; absent when -1.
    pub fd: RawFd,
}

impl ChannelMsg {
    pub fn command_only(command: u32) -> ChannelMsg {
        ChannelMsg {
            command,
            pid: 0,
            slot: 0,
            fd: -1,
        }
    }
}

#[repr(C, align(8))]
struct CmsgSpace([u8; 64]);

/// Creates the per-worker socketpair, both ends nonblocking.
pub fn create_channel() -> Result<[RawFd; 2], PeridotError> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } == -1 {
        return Err(PeridotError::sys("socketpair", nix::errno::Errno::last()));
    }
    for fd in fds {
        if let Err(e) = crate::core::listening::set_nonblocking(fd) {
            error!("fcntl(O_NONBLOCK) on channel failed: {e}");
        }
    }
    Ok(fds)
}

pub fn close_channel(fds: &[RawFd; 2]) {
    for fd in fds {
        if *fd != -1 && unsafe { libc::close(*fd) } == -1 {
            error!(fd, "close() on channel failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Sends one record, attaching `msg.fd` as SCM_RIGHTS when it is valid.
pub fn write_channel(s: RawFd, msg: &ChannelMsg) -> Result<(), PeridotError> {
    let mut record = *msg;

    let mut iov = libc::iovec {
        iov_base: &mut record as *mut ChannelMsg as *mut c_void,
        iov_len: mem::size_of::<ChannelMsg>(),
    };

    let mut control = CmsgSpace([0; 64]);
    let mut mh: libc::msghdr = unsafe { mem::zeroed() };
    mh.msg_iov = &mut iov;
    mh.msg_iovlen = 1;

    if msg.fd >= 0 {
        unsafe {
            mh.msg_control = control.0.as_mut_ptr() as *mut c_void;
            mh.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

            let cmsg = libc::CMSG_FIRSTHDR(&mh);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, msg.fd);
        }
    }

    let n = unsafe { libc::sendmsg(s, &mh, 0) };
    if n == -1 {
        return Err(PeridotError::sys("sendmsg", nix::errno::Errno::last()));
    }

    trace!(command = msg.command, pid = msg.pid, "channel message sent");
    Ok(())
}

pub enum ChannelRead {
    Message(ChannelMsg),
    /// The peer closed its end.
    Closed,
    WouldBlock,
}

/// Receives one record. A descriptor carried as ancillary data replaces the
/// record's `fd` field.
pub fn read_channel(s: RawFd) -> Result<ChannelRead, PeridotError> {
    let mut record = ChannelMsg::command_only(0);

    let mut iov = libc::iovec {
        iov_base: &mut record as *mut ChannelMsg as *mut c_void,
        iov_len: mem::size_of::<ChannelMsg>(),
    };

    let mut control = CmsgSpace([0; 64]);
    let mut mh: libc::msghdr = unsafe { mem::zeroed() };
    mh.msg_iov = &mut iov;
    mh.msg_iovlen = 1;
    mh.msg_control = control.0.as_mut_ptr() as *mut c_void;
    mh.msg_controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as _;

    let n = unsafe { libc::recvmsg(s, &mut mh, 0) };
    if n == -1 {
        let errno = nix::errno::Errno::last();
        if errno == nix::errno::Errno::EAGAIN {
            return Ok(ChannelRead::WouldBlock);
        }
        return Err(PeridotError::sys("recvmsg", errno));
    }
    if n == 0 {
        return Ok(ChannelRead::Closed);
    }
    if (n as usize) != mem::size_of::<ChannelMsg>() {
        return Err(PeridotError::Signal(format!(
            "channel message truncated: {n} bytes"
        )));
    }

    if record.command == CMD_OPEN_CHANNEL {
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&mh) };
        if cmsg.is_null() {
            return Err(PeridotError::Signal(
                "channel message carried no descriptor".into(),
            ));
        }
        unsafe {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                record.fd = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
            }
        }
    }

    if mh.msg_flags & libc::MSG_TRUNC != 0 {
        error!("channel message truncated by the kernel");
    }

    trace!(command = record.command, pid = record.pid, "channel message received");
    Ok(ChannelRead::Message(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_round_trips() {
        let fds = create_channel().unwrap();

        let msg = ChannelMsg {
            command: CMD_QUIT,
            pid: 1234,
            slot: 3,
            fd: -1,
        };
        write_channel(fds[0], &msg).unwrap();

        match read_channel(fds[1]).unwrap() {
            ChannelRead::Message(got) => assert_eq!(got, msg),
            _ => panic!("expected a message"),
        }
        close_channel(&fds);
    }

    #[test]
    fn open_channel_transfers_a_descriptor() {
        let fds = create_channel().unwrap();
        let payload = create_channel().unwrap();

        let msg = ChannelMsg {
            command: CMD_OPEN_CHANNEL,
            pid: 1,
            slot: 0,
            fd: payload[0],
        };
        write_channel(fds[0], &msg).unwrap();

        match read_channel(fds[1]).unwrap() {
            ChannelRead::Message(got) => {
                assert_eq!(got.command, CMD_OPEN_CHANNEL);
                // the kernel delivers a fresh descriptor, not the sender's number
                assert!(got.fd >= 0);
                unsafe { libc::close(got.fd) };
            }
            _ => panic!("expected a message"),
        }

        close_channel(&fds);
        close_channel(&payload);
    }

    #[test]
    fn empty_channel_would_block() {
        let fds = create_channel().unwrap();
        match read_channel(fds[1]).unwrap() {
            ChannelRead::WouldBlock => {}
            _ => panic!("expected WouldBlock"),
        }
        close_channel(&fds);
    }
}
