// src/server/events.rs

//! The seam to the external event subsystem. The core calls
//! `process_events_and_timers` once per worker-loop iteration; a real I/O
//! multiplexer implements the trait. The built-in `PollProcessor` is the
//! minimal implementation the stock binary runs: it watches the command
//! channel and otherwise sleeps.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::core::cycle::Cycle;
use crate::server::process::CHANNEL_FD;
use crate::server::worker;

pub trait EventProcessor {
    fn process_events_and_timers(&mut self, cycle: &mut Cycle);
}

/// Blocks until the command channel is readable, a signal interrupts the
/// wait, or `timeout` elapses.
pub fn wait_channel(timeout: Duration) {
    let fd = CHANNEL_FD.load(Ordering::Acquire);
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;

    if fd == -1 {
        // no channel in single-process mode; sleep is interrupted by signals
        std::thread::sleep(timeout.min(Duration::from_millis(500)));
        return;
    }

    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, ms) };
}

pub struct PollProcessor {
    pub timeout: Duration,
}

impl Default for PollProcessor {
    fn default() -> PollProcessor {
        PollProcessor {
            timeout: Duration::from_millis(500),
        }
    }
}

impl EventProcessor for PollProcessor {
    fn process_events_and_timers(&mut self, _cycle: &mut Cycle) {
        wait_channel(self.timeout);
        worker::handle_channel_messages();
    }
}
