//! Signal-to-flag translation with real deliveries. Kept alone in this
//! binary: handlers and timers are process-global.

use std::time::{Duration, Instant};

use peridot::server::signals;

#[test]
fn test_raised_signals_set_their_flags() {
    signals::init().unwrap();

    unsafe { libc::raise(libc::SIGUSR2) };
    assert!(signals::take(&signals::CHANGE_BINARY));
    assert!(!signals::take(&signals::CHANGE_BINARY));

    unsafe { libc::raise(libc::SIGWINCH) };
    assert!(signals::take(&signals::NOACCEPT));

    unsafe { libc::raise(libc::SIGHUP) };
    assert!(signals::take(&signals::RECONFIGURE));

    // SIGPIPE is ignored rather than flagged; surviving the raise is the test
    unsafe { libc::raise(libc::SIGPIPE) };

    // the backoff timer fires SIGALRM into its flag
    signals::arm_timer(10).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !signals::take(&signals::SIGALRM) {
        assert!(Instant::now() < deadline, "SIGALRM never arrived");
        std::thread::sleep(Duration::from_millis(5));
    }
}
