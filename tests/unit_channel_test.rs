//! Channel commands across a real fork, the way the master drives a worker.
//! Kept alone in this binary because it reaps its own child.

use std::time::{Duration, Instant};

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};
use peridot::server::channel::{
    CMD_QUIT, ChannelMsg, ChannelRead, create_channel, read_channel, write_channel,
};

#[test]
fn test_quit_command_crosses_the_fork_boundary() {
    let fds = create_channel().unwrap();

    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            // worker side: poll the read end until the command arrives
            unsafe { libc::close(fds[0]) };
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match read_channel(fds[1]) {
                    Ok(ChannelRead::Message(msg)) if msg.command == CMD_QUIT => {
                        unsafe { libc::_exit(0) }
                    }
                    Ok(ChannelRead::Message(_)) => unsafe { libc::_exit(3) },
                    Ok(ChannelRead::WouldBlock) => {
                        if Instant::now() > deadline {
                            unsafe { libc::_exit(4) }
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(ChannelRead::Closed) => unsafe { libc::_exit(5) },
                    Err(_) => unsafe { libc::_exit(6) },
                }
            }
        }
        ForkResult::Parent { child } => {
            unsafe { libc::close(fds[1]) };

            let msg = ChannelMsg {
                command: CMD_QUIT,
                pid: 0,
                slot: 0,
                fd: -1,
            };
            write_channel(fds[0], &msg).unwrap();

            match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, code) => assert_eq!(code, 0),
                other => panic!("unexpected wait status {other:?}"),
            }
            unsafe { libc::close(fds[0]) };
        }
    }
}
