// src/core/pool.rs

//! The pool allocator: a bump-allocated chain of fixed-size blocks with an
//! overflow list for large allocations and registered cleanup handlers that
//! run when the pool is destroyed.
//!
//! A pool is owned by a single thread of control. Small allocations are never
//! freed individually; they are reclaimed all at once by `reset` or when the
//! pool is dropped. Large allocations (above `max`) live on a separate list
//! and may be freed explicitly with `free_large`.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use libc::{c_char, c_void};
use once_cell::sync::Lazy;
use tracing::{debug, error, trace};

use crate::core::errors::PeridotError;

/// Alignment of the blocks themselves.
pub const POOL_ALIGNMENT: usize = 16;

/// Alignment applied to small allocations by `alloc`.
pub const ALIGNMENT: usize = std::mem::size_of::<usize>();

/// Default block size for pools created without an explicit size.
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

/// Returns the cached system page size.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[inline]
fn align_ptr(p: *mut u8, align: usize) -> *mut u8 {
    ((p as usize + align - 1) & !(align - 1)) as *mut u8
}

/// Per-block header, embedded at the start of every block in the chain.
#[repr(C)]
struct Block {
    last: *mut u8,
    end: *mut u8,
    next: *mut Block,
    failed: u32,
}

/// A node in the large-allocation list. The node itself is pool-allocated;
/// the memory it tracks is a dedicated heap block.
#[repr(C)]
struct Large {
    alloc: *mut u8,
    size: usize,
    align: usize,
    next: *mut Large,
}

/// The handler signature for registered cleanups.
pub type CleanupHandler = unsafe fn(*mut c_void);

/// A registered cleanup record. `handler` is invoked with `data` exactly once
/// when the pool is destroyed, unless it has been cleared beforehand.
#[repr(C)]
pub struct Cleanup {
    pub handler: Option<CleanupHandler>,
    pub data: *mut c_void,
    next: *mut Cleanup,
}

/// A free-list node for buffer chains, cached per pool.
#[repr(C)]
pub struct Chain {
    pub buf: *mut c_void,
    pub next: *mut Chain,
}

/// Data slot for the canonical file cleanup handlers.
#[repr(C)]
pub struct FileCleanup {
    pub fd: RawFd,
    /// NUL-terminated, pool-allocated path.
    pub name: *const c_char,
}

#[derive(Debug)]
pub struct Pool {
    /// First block of the chain. The chain is never empty.
    head: Cell<*mut Block>,
    /// First block whose failure count is still low enough to be worth
    /// scanning on allocation.
    current: Cell<*mut Block>,
    large: Cell<*mut Large>,
    cleanup: Cell<*mut Cleanup>,
    chain: Cell<*mut Chain>,
    /// Size every block in this chain is allocated with.
    size: usize,
    /// Upper bound for a "small" allocation served from the block chain.
    max: usize,
}

impl Pool {
    /// Allocates one aligned block of `size` bytes and reserves the block
    /// header at its head. `size` must exceed the header size.
    pub fn create(size: usize) -> Result<Rc<Pool>, PeridotError> {
        if size <= std::mem::size_of::<Block>() {
            return Err(PeridotError::Alloc(size));
        }

        let block = unsafe { alloc_block(size)? };
        let max = (size - std::mem::size_of::<Block>()).min(page_size() - 1);

        debug!(size, max, "pool created");

        Ok(Rc::new(Pool {
            head: Cell::new(block),
            current: Cell::new(block),
            large: Cell::new(ptr::null_mut()),
            cleanup: Cell::new(ptr::null_mut()),
            chain: Cell::new(ptr::null_mut()),
            size,
            max,
        }))
    }

    /// The small-allocation threshold for this pool.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Aligned allocation. Requests up to `max` bytes are served from the
    /// block chain; anything bigger goes to the large list.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, PeridotError> {
        if size <= self.max {
            self.alloc_small(size, true)
        } else {
            self.alloc_large(size, ALIGNMENT)
        }
    }

    /// As `alloc`, without alignment padding.
    pub fn alloc_unaligned(&self, size: usize) -> Result<NonNull<u8>, PeridotError> {
        if size <= self.max {
            self.alloc_small(size, false)
        } else {
            self.alloc_large(size, ALIGNMENT)
        }
    }

    /// `alloc` followed by a zero fill.
    pub fn alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>, PeridotError> {
        let p = self.alloc(size)?;
        unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    /// Allocation with an explicit alignment. Always routed through the
    /// large list so it can be released independently of the block chain.
    pub fn alloc_over_aligned(
        &self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, PeridotError> {
        self.alloc_large(size, align)
    }

    /// Allocates an uninitialized, properly aligned slot for a `T`.
    pub fn alloc_uninit<T>(&self) -> Result<NonNull<T>, PeridotError> {
        let size = std::mem::size_of::<T>();
        let p = if std::mem::align_of::<T>() <= ALIGNMENT {
            self.alloc(size)?
        } else {
            self.alloc_over_aligned(size, std::mem::align_of::<T>())?
        };
        Ok(p.cast())
    }

    /// Copies `s` into pool memory and returns a borrow of the copy.
    pub fn strdup<'a>(&'a self, s: &str) -> Result<&'a str, PeridotError> {
        let p = self.alloc_unaligned(s.len())?;
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), p.as_ptr(), s.len());
            Ok(std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                p.as_ptr(),
                s.len(),
            )))
        }
    }

    /// Copies `s` into pool memory as a NUL-terminated C string.
    pub fn cstrdup(&self, s: &str) -> Result<*const c_char, PeridotError> {
        let p = self.alloc_unaligned(s.len() + 1)?;
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), p.as_ptr(), s.len());
            *p.as_ptr().add(s.len()) = 0;
        }
        Ok(p.as_ptr() as *const c_char)
    }

    fn alloc_small(&self, size: usize, align: bool) -> Result<NonNull<u8>, PeridotError> {
        unsafe {
            let mut p = self.current.get();

            while !p.is_null() {
                let mut m = (*p).last;
                if align {
                    m = align_ptr(m, ALIGNMENT);
                }

                if (m as usize) <= (*p).end as usize
                    && (*p).end as usize - m as usize >= size
                {
                    (*p).last = m.add(size);
                    return Ok(NonNull::new_unchecked(m));
                }

                p = (*p).next;
            }

            self.alloc_block_chained(size, align)
        }
    }

    /// Allocates a fresh block of the original block size, links it at the
    /// tail, and serves `size` bytes from it. Blocks that keep failing are
    /// skipped by advancing `current`.
    unsafe fn alloc_block_chained(
        &self,
        size: usize,
        align: bool,
    ) -> Result<NonNull<u8>, PeridotError> {
        let block = unsafe { alloc_block(self.size)? };

        unsafe {
            let mut m = (block as *mut u8).add(std::mem::size_of::<Block>());
            if align {
                m = align_ptr(m, ALIGNMENT);
            }
            (*block).last = m.add(size);

            // Count a failure against every block the scan passed over and
            // move `current` beyond the ones that keep filling up.
            let mut p = self.current.get();
            while !(*p).next.is_null() {
                if (*p).failed > 4 {
                    self.current.set((*p).next);
                }
                (*p).failed += 1;
                p = (*p).next;
            }
            (*p).next = block;

            Ok(NonNull::new_unchecked(m))
        }
    }

    fn alloc_large(&self, size: usize, align: usize) -> Result<NonNull<u8>, PeridotError> {
        let layout =
            Layout::from_size_align(size, align).map_err(|_| PeridotError::Alloc(size))?;
        let p = unsafe { alloc::alloc(layout) };
        if p.is_null() {
            return Err(PeridotError::Alloc(size));
        }

        trace!(size, "large allocation");

        unsafe {
            // Reuse a vacated slot near the head of the list, but give up
            // after a few entries to keep the scan bounded.
            let mut l = self.large.get();
            let mut n = 0;
            while !l.is_null() {
                if (*l).alloc.is_null() {
                    (*l).alloc = p;
                    (*l).size = size;
                    (*l).align = align;
                    return Ok(NonNull::new_unchecked(p));
                }
                if n > 3 {
                    break;
                }
                n += 1;
                l = (*l).next;
            }

            let rec = match self.alloc(std::mem::size_of::<Large>()) {
                Ok(rec) => rec.cast::<Large>().as_ptr(),
                Err(e) => {
                    alloc::dealloc(p, layout);
                    return Err(e);
                }
            };

            (*rec).alloc = p;
            (*rec).size = size;
            (*rec).align = align;
            (*rec).next = self.large.get();
            self.large.set(rec);

            Ok(NonNull::new_unchecked(p))
        }
    }

    /// Frees a large allocation. Small allocations cannot be freed
    /// individually; passing one returns `LargeNotFound`.
    pub fn free_large(&self, p: NonNull<u8>) -> Result<(), PeridotError> {
        unsafe {
            let mut l = self.large.get();
            while !l.is_null() {
                if (*l).alloc == p.as_ptr() {
                    trace!(ptr = ?p, "large free");
                    alloc::dealloc(
                        (*l).alloc,
                        Layout::from_size_align_unchecked((*l).size, (*l).align),
                    );
                    (*l).alloc = ptr::null_mut();
                    return Ok(());
                }
                l = (*l).next;
            }
        }
        Err(PeridotError::LargeNotFound)
    }

    /// Reports whether `p` is currently tracked by the large list.
    pub fn owns_large(&self, p: NonNull<u8>) -> bool {
        unsafe {
            let mut l = self.large.get();
            while !l.is_null() {
                if (*l).alloc == p.as_ptr() {
                    return true;
                }
                l = (*l).next;
            }
        }
        false
    }

    /// Frees every large allocation and rewinds every block to just past its
    /// header. Blocks and the cleanup list stay intact.
    pub fn reset(&self) {
        unsafe {
            let mut l = self.large.get();
            while !l.is_null() {
                if !(*l).alloc.is_null() {
                    alloc::dealloc(
                        (*l).alloc,
                        Layout::from_size_align_unchecked((*l).size, (*l).align),
                    );
                }
                l = (*l).next;
            }

            let mut p = self.head.get();
            while !p.is_null() {
                (*p).last = (p as *mut u8).add(std::mem::size_of::<Block>());
                (*p).failed = 0;
                p = (*p).next;
            }
        }

        self.current.set(self.head.get());
        self.large.set(ptr::null_mut());
        self.chain.set(ptr::null_mut());
    }

    /// Pushes a new cleanup record (LIFO), optionally with a pool-allocated
    /// data slot of `size` bytes.
    pub fn add_cleanup(&self, size: usize) -> Result<&mut Cleanup, PeridotError> {
        let c = self.alloc(std::mem::size_of::<Cleanup>())?.cast::<Cleanup>();

        let data = if size > 0 {
            self.alloc(size)?.as_ptr() as *mut c_void
        } else {
            ptr::null_mut()
        };

        unsafe {
            (*c.as_ptr()).handler = None;
            (*c.as_ptr()).data = data;
            (*c.as_ptr()).next = self.cleanup.get();
            self.cleanup.set(c.as_ptr());

            trace!(cleanup = ?c, "add cleanup");

            Ok(&mut *c.as_ptr())
        }
    }

    /// Registers a close-on-destroy cleanup for `fd`, labelled with `name`
    /// for diagnostics.
    pub fn add_file_cleanup(&self, fd: RawFd, name: &str) -> Result<(), PeridotError> {
        let name = self.cstrdup(name)?;
        let c = self.add_cleanup(std::mem::size_of::<FileCleanup>())?;
        unsafe {
            let fc = c.data as *mut FileCleanup;
            (*fc).fd = fd;
            (*fc).name = name;
        }
        c.handler = Some(cleanup_file);
        Ok(())
    }

    /// Invokes and clears only the close-file cleanups matching `fd`.
    pub fn run_file_cleanups(&self, fd: RawFd) {
        unsafe {
            let mut c = self.cleanup.get();
            while !c.is_null() {
                if (*c).handler == Some(cleanup_file as CleanupHandler) {
                    let fc = (*c).data as *const FileCleanup;
                    if (*fc).fd == fd {
                        ((*c).handler.take().unwrap_unchecked())((*c).data);
                        return;
                    }
                }
                c = (*c).next;
            }
        }
    }

    /// Pops a cached chain link, or allocates a fresh one.
    pub fn chain_link(&self) -> Result<&mut Chain, PeridotError> {
        unsafe {
            let cached = self.chain.get();
            if !cached.is_null() {
                self.chain.set((*cached).next);
                (*cached).next = ptr::null_mut();
                return Ok(&mut *cached);
            }
        }

        let c = self.alloc(std::mem::size_of::<Chain>())?.cast::<Chain>();
        unsafe {
            (*c.as_ptr()).buf = ptr::null_mut();
            (*c.as_ptr()).next = ptr::null_mut();
            Ok(&mut *c.as_ptr())
        }
    }

    /// Returns a chain link to the per-pool cache.
    pub fn free_chain_link(&self, link: *mut Chain) {
        unsafe {
            (*link).next = self.chain.get();
        }
        self.chain.set(link);
    }

    /// If `tail` is the end of the most recent allocation in some block and
    /// the block has `extra` trailing bytes free, bumps the block pointer and
    /// returns true. Used by the dynamic array to grow in place.
    pub(crate) fn extend_in_place(&self, tail: *mut u8, extra: usize) -> bool {
        unsafe {
            let mut p = self.head.get();
            while !p.is_null() {
                if (*p).last == tail && (*p).end as usize - tail as usize >= extra {
                    (*p).last = tail.add(extra);
                    return true;
                }
                p = (*p).next;
            }
        }
        false
    }

    /// Best-effort rewind: if `[start, start+len)` is the most recent
    /// allocation in some block, hands the space back. No-op otherwise.
    pub(crate) fn rewind_tail(&self, start: *mut u8, len: usize) -> bool {
        unsafe {
            let mut p = self.head.get();
            while !p.is_null() {
                if (*p).last == start.add(len) {
                    (*p).last = start;
                    return true;
                }
                p = (*p).next;
            }
        }
        false
    }

    #[cfg(test)]
    fn block_count(&self) -> usize {
        let mut n = 0;
        unsafe {
            let mut p = self.head.get();
            while !p.is_null() {
                n += 1;
                p = (*p).next;
            }
        }
        n
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        unsafe {
            let mut c = self.cleanup.get();
            while !c.is_null() {
                if let Some(handler) = (*c).handler {
                    trace!(cleanup = ?c, "run cleanup");
                    handler((*c).data);
                }
                c = (*c).next;
            }

            let mut l = self.large.get();
            while !l.is_null() {
                if !(*l).alloc.is_null() {
                    alloc::dealloc(
                        (*l).alloc,
                        Layout::from_size_align_unchecked((*l).size, (*l).align),
                    );
                }
                l = (*l).next;
            }

            let mut p = self.head.get();
            while !p.is_null() {
                let next = (*p).next;
                alloc::dealloc(
                    p as *mut u8,
                    Layout::from_size_align_unchecked(self.size, POOL_ALIGNMENT),
                );
                p = next;
            }
        }

        debug!("pool destroyed");
    }
}

unsafe fn alloc_block(size: usize) -> Result<*mut Block, PeridotError> {
    let layout =
        Layout::from_size_align(size, POOL_ALIGNMENT).map_err(|_| PeridotError::Alloc(size))?;
    let m = unsafe { alloc::alloc(layout) };
    if m.is_null() {
        return Err(PeridotError::Alloc(size));
    }

    let block = m as *mut Block;
    unsafe {
        (*block).last = m.add(std::mem::size_of::<Block>());
        (*block).end = m.add(size);
        (*block).next = ptr::null_mut();
        (*block).failed = 0;
    }
    Ok(block)
}

/// Canonical cleanup handler: closes the held descriptor.
pub unsafe fn cleanup_file(data: *mut c_void) {
    let fc = data as *const FileCleanup;
    unsafe {
        trace!(fd = (*fc).fd, "file cleanup");
        if libc::close((*fc).fd) == -1 {
            error!(
                fd = (*fc).fd,
                "close() failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Canonical cleanup handler: unlinks the path, then closes the descriptor.
pub unsafe fn cleanup_delete_file(data: *mut c_void) {
    let fc = data as *const FileCleanup;
    unsafe {
        if libc::unlink((*fc).name) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                error!("unlink() failed: {err}");
            }
        }
        if libc::close((*fc).fd) == -1 {
            error!(
                fd = (*fc).fd,
                "close() failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}
