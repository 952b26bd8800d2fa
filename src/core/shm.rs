// src/core/shm.rs

//! Shared-memory zones: named, sized, owner-tagged regions mapped into every
//! process. Each mapped zone starts with a slab pool whose header carries a
//! cross-process mutex; that header is the only in-band metadata the core
//! writes.
//!
//! Zones are registered before a cycle is committed and mapped during commit.
//! Across reloads a zone with identical name, tag and size keeps its mapping;
//! anything else is unmapped and created afresh.

use std::ptr::{self, NonNull};

use libc::c_void;
use tracing::{debug, error};

use crate::core::errors::PeridotError;
use crate::core::list::List;
use crate::core::slab::SlabPool;

/// Called once the zone's region is mapped. `old_data` is the previous
/// generation's consumer pointer when the mapping was preserved across a
/// reload, `None` on a fresh mapping.
pub type ZoneInitFn =
    Box<dyn Fn(&mut ShmZone, Option<NonNull<c_void>>) -> Result<(), PeridotError>>;

pub struct ShmZone {
    pub name: String,
    pub size: usize,
    /// Opaque owner identity; two zones with the same name but different
    /// tags belong to different owners and never merge.
    pub tag: u64,
    pub addr: Option<NonNull<u8>>,
    /// True when the mapping was adopted from the previous cycle.
    pub exists: bool,
    pub init: Option<ZoneInitFn>,
    /// Consumer payload pointer, handed to the next generation on reuse.
    pub data: *mut c_void,
}

impl std::fmt::Debug for ShmZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmZone")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("tag", &self.tag)
            .field("addr", &self.addr)
            .field("exists", &self.exists)
            .field("init", &self.init.as_ref().map(|_| "<fn>"))
            .field("data", &self.data)
            .finish()
    }
}

impl ShmZone {
    fn new(name: String, size: usize, tag: u64) -> ShmZone {
        ShmZone {
            name,
            size,
            tag,
            addr: None,
            exists: false,
            init: None,
            data: ptr::null_mut(),
        }
    }

    /// Maps the region and lays the slab pool over it.
    pub fn map(&mut self) -> Result<(), PeridotError> {
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(PeridotError::sys("mmap", nix::errno::Errno::last()));
        }

        let addr = unsafe { NonNull::new_unchecked(p as *mut u8) };
        unsafe { SlabPool::init(addr, self.size) };
        self.addr = Some(addr);

        debug!(name = %self.name, size = self.size, "shared zone mapped");
        Ok(())
    }

    /// Releases this process's view of the mapping.
    pub fn unmap(&mut self) {
        if let Some(addr) = self.addr.take() {
            debug!(name = %self.name, "shared zone unmapped");
            if unsafe { libc::munmap(addr.as_ptr() as *mut c_void, self.size) } == -1 {
                error!(
                    name = %self.name,
                    "munmap() failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    /// The slab pool embedded in the mapped region.
    pub fn slab(&self) -> Option<SlabPool> {
        self.addr.map(|addr| unsafe { SlabPool::from_addr(addr) })
    }

    /// Runs the registered initializer against the mapped region.
    pub fn run_init(&mut self, old_data: Option<NonNull<c_void>>) -> Result<(), PeridotError> {
        let init = self.init.take();
        let result = match &init {
            Some(f) => f(self, old_data),
            None => Ok(()),
        };
        self.init = init;
        result
    }
}

/// Finds or appends a zone descriptor. An existing entry with the same name
/// must agree on `tag`, and on `size` when both sides specify one.
pub fn register_zone<'a>(
    zones: &'a mut List<ShmZone>,
    name: &str,
    size: usize,
    tag: u64,
) -> Result<&'a mut ShmZone, PeridotError> {
    for zone in zones.iter_mut() {
        if zone.name != name {
            continue;
        }

        if zone.tag != tag {
            return Err(PeridotError::ZoneTagMismatch(name.to_owned()));
        }

        if size != 0 && zone.size != 0 && size != zone.size {
            return Err(PeridotError::ZoneSizeConflict(
                name.to_owned(),
                size,
                zone.size,
            ));
        }
        if zone.size == 0 {
            zone.size = size;
        }

        // the borrow checker cannot see that we return out of the loop
        return Ok(unsafe { &mut *(zone as *mut ShmZone) });
    }

    zones.push(ShmZone::new(name.to_owned(), size, tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::Pool;

    #[test]
    fn register_is_idempotent_per_owner() {
        let pool = Pool::create(4096).unwrap();
        let mut zones: List<ShmZone> = List::new(&pool, 4).unwrap();

        let a = register_zone(&mut zones, "z1", 4096, 7).unwrap() as *const ShmZone;
        let b = register_zone(&mut zones, "z1", 4096, 7).unwrap() as *const ShmZone;
        assert_eq!(a, b);
        assert_eq!(zones.len(), 1);
    }

    #[test]
    fn tag_mismatch_is_rejected() {
        let pool = Pool::create(4096).unwrap();
        let mut zones: List<ShmZone> = List::new(&pool, 4).unwrap();

        register_zone(&mut zones, "z1", 4096, 7).unwrap();
        let err = register_zone(&mut zones, "z1", 4096, 8).unwrap_err();
        assert!(matches!(err, PeridotError::ZoneTagMismatch(_)));
    }

    #[test]
    fn size_conflict_is_rejected() {
        let pool = Pool::create(4096).unwrap();
        let mut zones: List<ShmZone> = List::new(&pool, 4).unwrap();

        register_zone(&mut zones, "z1", 4096, 7).unwrap();
        let err = register_zone(&mut zones, "z1", 8192, 7).unwrap_err();
        assert!(matches!(err, PeridotError::ZoneSizeConflict(..)));
    }

    #[test]
    fn late_size_fills_a_placeholder() {
        let pool = Pool::create(4096).unwrap();
        let mut zones: List<ShmZone> = List::new(&pool, 4).unwrap();

        register_zone(&mut zones, "z1", 0, 7).unwrap();
        let zone = register_zone(&mut zones, "z1", 8192, 7).unwrap();
        assert_eq!(zone.size, 8192);
    }

    #[test]
    fn map_initializes_a_slab() {
        let mut zone = ShmZone::new("z1".into(), 64 * 1024, 1);
        zone.map().unwrap();
        let slab = zone.slab().unwrap();
        assert!(slab.alloc(128).is_some());
        zone.unmap();
        assert!(zone.addr.is_none());
    }
}
