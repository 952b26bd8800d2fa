use std::os::fd::IntoRawFd;

use peridot::core::pool::{ALIGNMENT, Pool};

#[test]
fn test_alignment_of_mixed_allocations() {
    let pool = Pool::create(4096).unwrap();

    for size in [1usize, 3, 7, 8, 15, 64, 255] {
        let p = pool.alloc(size).unwrap();
        assert_eq!(
            p.as_ptr() as usize % ALIGNMENT,
            0,
            "allocation of {size} bytes is misaligned"
        );
    }
}

#[test]
fn test_unaligned_allocations_pack_tightly() {
    let pool = Pool::create(4096).unwrap();

    let a = pool.alloc_unaligned(3).unwrap();
    let b = pool.alloc_unaligned(3).unwrap();
    assert_eq!(unsafe { a.as_ptr().add(3) }, b.as_ptr());
}

#[test]
fn test_zeroed_allocation_is_zeroed() {
    let pool = Pool::create(4096).unwrap();
    let p = pool.alloc_zeroed(128).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 128) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn test_over_aligned_allocation_goes_to_large_list() {
    let pool = Pool::create(4096).unwrap();
    let p = pool.alloc_over_aligned(64, 256).unwrap();
    assert_eq!(p.as_ptr() as usize % 256, 0);
    assert!(pool.owns_large(p));
    pool.free_large(p).unwrap();
}

#[test]
fn test_large_slot_reuse_after_free() {
    let pool = Pool::create(1024).unwrap();
    let big = pool.max() + 1;

    let a = pool.alloc(big).unwrap();
    pool.free_large(a).unwrap();
    // the vacated head slot is reused by the next large allocation
    let b = pool.alloc(big).unwrap();
    assert!(pool.owns_large(b));
    pool.free_large(b).unwrap();
}

#[test]
fn test_strdup_copies_into_pool() {
    let pool = Pool::create(4096).unwrap();
    let s = pool.strdup("hello cycle").unwrap();
    assert_eq!(s, "hello cycle");
}

#[test]
fn test_cstrdup_terminates() {
    let pool = Pool::create(4096).unwrap();
    let p = pool.cstrdup("pid.path").unwrap();
    let back = unsafe { std::ffi::CStr::from_ptr(p) };
    assert_eq!(back.to_str().unwrap(), "pid.path");
}

#[test]
fn test_file_cleanup_closes_descriptor_on_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let file = std::fs::File::create(dir.path().join("log")).unwrap();
    let fd = file.into_raw_fd();

    {
        let pool = Pool::create(4096).unwrap();
        pool.add_file_cleanup(fd, "log").unwrap();
    }

    // the cleanup ran: the descriptor is gone
    let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    assert_eq!(rc, -1);
}

#[test]
fn test_run_file_cleanups_targets_one_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let fd_a = std::fs::File::create(dir.path().join("a")).unwrap().into_raw_fd();
    let fd_b = std::fs::File::create(dir.path().join("b")).unwrap().into_raw_fd();

    let pool = Pool::create(4096).unwrap();
    pool.add_file_cleanup(fd_a, "a").unwrap();
    pool.add_file_cleanup(fd_b, "b").unwrap();

    pool.run_file_cleanups(fd_a);

    assert_eq!(unsafe { libc::fcntl(fd_a, libc::F_GETFD) }, -1);
    // the other descriptor is untouched until the pool goes away
    assert_ne!(unsafe { libc::fcntl(fd_b, libc::F_GETFD) }, -1);

    drop(pool);
    assert_eq!(unsafe { libc::fcntl(fd_b, libc::F_GETFD) }, -1);
}

#[test]
fn test_chain_links_are_cached_per_pool() {
    let pool = Pool::create(4096).unwrap();

    let link = pool.chain_link().unwrap() as *mut _;
    pool.free_chain_link(link);
    let again = pool.chain_link().unwrap() as *mut _;
    assert_eq!(link, again);
}

#[test]
fn test_reset_keeps_cleanups_pending() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RUNS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn bump(_: *mut libc::c_void) {
        RUNS.fetch_add(1, Ordering::SeqCst);
    }

    {
        let pool = Pool::create(4096).unwrap();
        pool.add_cleanup(0).unwrap().handler = Some(bump);
        pool.reset();
        assert_eq!(RUNS.load(Ordering::SeqCst), 0);
    }
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);
}
