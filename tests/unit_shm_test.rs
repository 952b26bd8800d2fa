//! Shared-zone visibility across fork: the mapping is created before the
//! fork, so parent and child address the same slab. Kept alone in this
//! binary because it reaps its own child.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};
use peridot::core::shm::ShmZone;

#[test]
fn test_child_writes_are_visible_through_the_zone() {
    let mut zone = ShmZone {
        name: "t1".into(),
        size: 256 * 1024,
        tag: 1,
        addr: None,
        exists: false,
        init: None,
        data: std::ptr::null_mut(),
    };
    zone.map().unwrap();
    let slab = zone.slab().unwrap();

    let cell = slab.alloc_zeroed(std::mem::size_of::<AtomicUsize>()).unwrap();
    let counter: &AtomicUsize = unsafe { &*(cell.as_ptr() as *const AtomicUsize) };

    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            // same mapping, same address: plain stores are enough
            counter.store(7777, Ordering::SeqCst);
            unsafe { libc::_exit(0) }
        }
        ForkResult::Parent { child } => {
            match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, code) => assert_eq!(code, 0),
                other => panic!("unexpected wait status {other:?}"),
            }

            // give the store a moment in case the child was slow to schedule
            let mut seen = counter.load(Ordering::SeqCst);
            for _ in 0..100 {
                if seen == 7777 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
                seen = counter.load(Ordering::SeqCst);
            }
            assert_eq!(seen, 7777, "child's write must be visible in the parent");

            slab.free(cell);
            zone.unmap();
        }
    }
}
