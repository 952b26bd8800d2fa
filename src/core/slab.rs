// src/core/slab.rs

//! Slab allocator embedded at the base of every shared-memory zone. The
//! header, the page descriptor table and the pages themselves all live inside
//! the mapped region, so every process attached to the zone sees the same
//! allocator state. A cross-process spinlock at the header base serializes
//! mutations.
//!
//! Slot sizes are powers of two between `min_shift` and half a page; larger
//! requests take whole page runs.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use tracing::error;

use crate::core::pool::page_size;

const INVALID: u32 = u32::MAX;

/// Page descriptor states.
const PAGE_FREE: u32 = 0;
const PAGE_SLOTS: u32 = 1;
const PAGE_RUN_HEAD: u32 = 2;
const PAGE_RUN_BODY: u32 = 3;

/// Enough classes for page sizes up to 64 KiB.
const MAX_CLASSES: usize = 16;

#[repr(C)]
struct SlabPage {
    /// One bit per slot; valid only in the `PAGE_SLOTS` state.
    bitmap: u64,
    state: u32,
    /// Slot size shift (`PAGE_SLOTS`) or run length (`PAGE_RUN_HEAD`).
    shift_or_run: u32,
    /// Next page in the per-class partial list.
    next: u32,
    used: u32,
}

#[repr(C)]
pub struct SlabHeader {
    lock: AtomicU32,
    page_count: u32,
    page_shift: u32,
    min_shift: u32,
    /// Heads of the per-class partial-page lists.
    partial: [u32; MAX_CLASSES],
    /// First page address inside the region.
    start: usize,
    end: usize,
    /// Opaque root pointer for the zone's consumer, carried in-band so every
    /// attached process finds it.
    pub data: AtomicUsize,
}

/// A view over a slab region. Copyable; the backing state is all inside the
/// shared mapping.
#[derive(Clone, Copy)]
pub struct SlabPool {
    header: NonNull<SlabHeader>,
}

struct Guard<'a>(&'a AtomicU32);

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

fn lock(l: &AtomicU32) -> Guard<'_> {
    let mut spins = 0u32;
    while l
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        spins += 1;
        if spins < 128 {
            std::hint::spin_loop();
        } else {
            // another process holds the lock; give the scheduler a chance
            std::thread::yield_now();
        }
    }
    Guard(l)
}

impl SlabPool {
    /// Lays out a fresh slab over `[addr, addr + size)`. The caller maps the
    /// region and guarantees it is exclusively owned until `init` returns.
    ///
    /// # Safety
    /// `addr` must be valid, writable, and at least `size` bytes,
    /// with `size` large enough for the header plus one page.
    pub unsafe fn init(addr: NonNull<u8>, size: usize) -> SlabPool {
        let page_sz = page_size();
        let page_shift = page_sz.trailing_zeros();
        let base = addr.as_ptr() as usize;

        // carve: header, descriptor table, then page-aligned payload
        let header_end = base + std::mem::size_of::<SlabHeader>();
        let budget = base + size - header_end;
        let mut page_count = budget / (page_sz + std::mem::size_of::<SlabPage>());
        let mut start =
            (header_end + page_count * std::mem::size_of::<SlabPage>() + page_sz - 1)
                & !(page_sz - 1);
        while page_count > 0 && start + page_count * page_sz > base + size {
            page_count -= 1;
            start = (header_end + page_count * std::mem::size_of::<SlabPage>() + page_sz - 1)
                & !(page_sz - 1);
        }

        let header = addr.cast::<SlabHeader>();
        unsafe {
            let h = header.as_ptr();
            (*h).lock = AtomicU32::new(0);
            (*h).page_count = page_count as u32;
            (*h).page_shift = page_shift;
            // keep slot bitmaps within one u64 per page
            (*h).min_shift = page_shift - 6;
            (*h).partial = [INVALID; MAX_CLASSES];
            (*h).start = start;
            (*h).end = start + page_count * page_sz;
            (*h).data = AtomicUsize::new(0);

            let pages = Self::pages_ptr(h);
            for i in 0..page_count {
                pages.add(i).write(SlabPage {
                    bitmap: 0,
                    state: PAGE_FREE,
                    shift_or_run: 0,
                    next: INVALID,
                    used: 0,
                });
            }
        }

        SlabPool { header }
    }

    /// Attaches to an already-initialized slab region.
    ///
    /// # Safety
    /// `addr` must point at a region previously laid out by `init`.
    pub unsafe fn from_addr(addr: NonNull<u8>) -> SlabPool {
        SlabPool {
            header: addr.cast(),
        }
    }

    unsafe fn pages_ptr(h: *mut SlabHeader) -> *mut SlabPage {
        unsafe { (h as *mut u8).add(std::mem::size_of::<SlabHeader>()) as *mut SlabPage }
    }

    fn pages(&self) -> *mut SlabPage {
        unsafe { Self::pages_ptr(self.header.as_ptr()) }
    }

    fn lock(&self) -> Guard<'_> {
        lock(unsafe { &(*self.header.as_ptr()).lock })
    }

    pub fn data(&self) -> &AtomicUsize {
        unsafe { &(*self.header.as_ptr()).data }
    }

    /// Allocates `size` bytes from the shared region. Returns `None` when the
    /// region is exhausted.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let h = self.header.as_ptr();
        let (page_sz, min_shift, start) =
            unsafe { (1usize << (*h).page_shift, (*h).min_shift, (*h).start) };
        let _guard = self.lock();

        if size > page_sz / 2 {
            return self.alloc_pages(size.div_ceil(page_sz));
        }

        let shift = slot_shift(size, min_shift);
        let class = (shift - min_shift) as usize;
        let slots = (page_sz >> shift) as u32;

        unsafe {
            let pages = self.pages();

            let mut idx = (*h).partial[class];
            if idx == INVALID {
                idx = self.take_free_page()?;
                let p = pages.add(idx as usize);
                (*p).state = PAGE_SLOTS;
                (*p).shift_or_run = shift;
                (*p).bitmap = 0;
                (*p).used = 0;
                (*p).next = (*h).partial[class];
                (*h).partial[class] = idx;
            }

            let p = pages.add(idx as usize);
            let slot = (!(*p).bitmap).trailing_zeros();
            debug_assert!(slot < slots);
            (*p).bitmap |= 1u64 << slot;
            (*p).used += 1;

            if (*p).used == slots {
                // full: drop from the partial list
                (*h).partial[class] = (*p).next;
                (*p).next = INVALID;
            }

            let addr = start + (idx as usize) * page_sz + ((slot as usize) << shift);
            Some(NonNull::new_unchecked(addr as *mut u8))
        }
    }

    /// Zero-filled variant of `alloc`.
    pub fn alloc_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
        let p = self.alloc(size)?;
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0, size) };
        Some(p)
    }

    fn take_free_page(&self) -> Option<u32> {
        let h = self.header.as_ptr();
        unsafe {
            let pages = self.pages();
            for i in 0..(*h).page_count {
                if (*pages.add(i as usize)).state == PAGE_FREE {
                    return Some(i);
                }
            }
        }
        None
    }

    fn alloc_pages(&self, n: usize) -> Option<NonNull<u8>> {
        let h = self.header.as_ptr();
        unsafe {
            let page_sz = 1usize << (*h).page_shift;
            let pages = self.pages();
            let mut run = 0usize;
            for i in 0..(*h).page_count as usize {
                if (*pages.add(i)).state == PAGE_FREE {
                    run += 1;
                    if run == n {
                        let first = i + 1 - n;
                        (*pages.add(first)).state = PAGE_RUN_HEAD;
                        (*pages.add(first)).shift_or_run = n as u32;
                        for j in first + 1..=i {
                            (*pages.add(j)).state = PAGE_RUN_BODY;
                        }
                        let addr = (*h).start + first * page_sz;
                        return Some(NonNull::new_unchecked(addr as *mut u8));
                    }
                } else {
                    run = 0;
                }
            }
        }
        None
    }

    /// Returns an allocation to the slab. A pointer the slab does not own is
    /// reported and ignored.
    pub fn free(&self, p: NonNull<u8>) {
        let h = self.header.as_ptr();
        let (page_sz, page_shift, min_shift, start, end) = unsafe {
            (
                1usize << (*h).page_shift,
                (*h).page_shift,
                (*h).min_shift,
                (*h).start,
                (*h).end,
            )
        };
        let addr = p.as_ptr() as usize;

        if addr < start || addr >= end {
            error!("slab free(): pointer outside the zone");
            return;
        }

        let _guard = self.lock();
        let idx = (addr - start) >> page_shift;

        unsafe {
            let pages = self.pages();
            let page = pages.add(idx);

            match (*page).state {
                PAGE_RUN_HEAD => {
                    let n = (*page).shift_or_run as usize;
                    for j in idx..idx + n {
                        (*pages.add(j)).state = PAGE_FREE;
                        (*pages.add(j)).shift_or_run = 0;
                    }
                }
                PAGE_SLOTS => {
                    let shift = (*page).shift_or_run;
                    let class = (shift - min_shift) as usize;
                    let slots = (page_sz >> shift) as u32;
                    let slot = ((addr - start) & (page_sz - 1)) >> shift;

                    if (*page).bitmap & (1u64 << slot) == 0 {
                        error!("slab free(): slot already free");
                        return;
                    }

                    if (*page).used == slots {
                        // was full; it can serve allocations again
                        (*page).next = (*h).partial[class];
                        (*h).partial[class] = idx as u32;
                    }

                    (*page).bitmap &= !(1u64 << slot);
                    (*page).used -= 1;

                    if (*page).used == 0 {
                        self.unlink_partial(class, idx as u32);
                        (*page).state = PAGE_FREE;
                        (*page).shift_or_run = 0;
                    }
                }
                _ => error!("slab free(): pointer to a free page"),
            }
        }
    }

    unsafe fn unlink_partial(&self, class: usize, idx: u32) {
        unsafe {
            let hmut = self.header.as_ptr();
            let pages = self.pages();

            let mut cur = (*hmut).partial[class];
            if cur == idx {
                (*hmut).partial[class] = (*pages.add(idx as usize)).next;
                return;
            }
            while cur != INVALID {
                let next = (*pages.add(cur as usize)).next;
                if next == idx {
                    (*pages.add(cur as usize)).next = (*pages.add(idx as usize)).next;
                    return;
                }
                cur = next;
            }
        }
    }

    #[cfg(test)]
    fn free_page_count(&self) -> usize {
        let h = self.header.as_ptr();
        let _guard = self.lock();
        unsafe {
            let pages = self.pages();
            (0..(*h).page_count as usize)
                .filter(|&i| (*pages.add(i)).state == PAGE_FREE)
                .count()
        }
    }
}

fn slot_shift(size: usize, min_shift: u32) -> u32 {
    let needed = usize::BITS - size.saturating_sub(1).leading_zeros();
    needed.max(min_shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc, dealloc};

    struct Region {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl Region {
        fn new(size: usize) -> Region {
            let layout = Layout::from_size_align(size, page_size()).unwrap();
            let ptr = NonNull::new(unsafe { alloc(layout) }).unwrap();
            Region { ptr, layout }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn slot_allocations_come_from_one_page() {
        let region = Region::new(64 * 1024);
        let slab = unsafe { SlabPool::init(region.ptr, 64 * 1024) };

        let a = slab.alloc(100).unwrap();
        let b = slab.alloc(100).unwrap();
        // both round up to the same class and land in the same page
        assert_eq!(
            a.as_ptr() as usize >> page_size().trailing_zeros(),
            b.as_ptr() as usize >> page_size().trailing_zeros(),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn free_returns_slots_for_reuse() {
        let region = Region::new(64 * 1024);
        let slab = unsafe { SlabPool::init(region.ptr, 64 * 1024) };

        let a = slab.alloc(128).unwrap();
        slab.free(a);
        let b = slab.alloc(128).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn page_runs_allocate_and_release() {
        let region = Region::new(256 * 1024);
        let slab = unsafe { SlabPool::init(region.ptr, 256 * 1024) };
        let before = slab.free_page_count();

        let big = slab.alloc(3 * page_size()).unwrap();
        assert_eq!(slab.free_page_count(), before - 3);
        slab.free(big);
        assert_eq!(slab.free_page_count(), before);
    }

    #[test]
    fn exhaustion_returns_none() {
        let region = Region::new(32 * 1024);
        let slab = unsafe { SlabPool::init(region.ptr, 32 * 1024) };
        let mut taken = Vec::new();
        while let Some(p) = slab.alloc(page_size()) {
            taken.push(p);
        }
        assert!(slab.alloc(page_size()).is_none());
        assert!(!taken.is_empty());
    }

    #[test]
    fn reattach_sees_the_same_state() {
        let region = Region::new(64 * 1024);
        let slab = unsafe { SlabPool::init(region.ptr, 64 * 1024) };
        slab.data().store(0x1234, Ordering::Release);

        let other = unsafe { SlabPool::from_addr(region.ptr) };
        assert_eq!(other.data().load(Ordering::Acquire), 0x1234);
    }
}
