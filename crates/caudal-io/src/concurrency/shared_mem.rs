//! Byte regions visible to every worker.
//!
//! Two flavours exist. Anonymous regions are created before any worker is
//! spawned and are inherited through `fork` (or simply shared on the heap in
//! thread mode). System V segments additionally carry an id, so a worker
//! that was spawned *before* the region existed can attach it later; the id
//! travels to the worker in a semaphore message. Segments are created with
//! `IPC_RMID` pre-armed so the kernel reclaims them when the last attachment
//! goes away.

use super::ConcurrencyMode;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

/// A zero-initialised byte region shared between workers.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    size: usize,
    kind: RegionKind,
}

enum RegionKind {
    Heap(std::alloc::Layout),
    Mmap,
    SysV,
}

// SAFETY: the region is plain shared bytes; all concurrent access goes
// through atomics or is sequenced by the engine's semaphores.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

const HEAP_ALIGN: usize = 64;

impl SharedRegion {
    /// Allocate an anonymous region: a `MAP_SHARED | MAP_ANONYMOUS` mapping
    /// in process mode, an aligned heap block in thread mode.
    pub fn anonymous(mode: ConcurrencyMode, size: usize) -> io::Result<Self> {
        assert!(size > 0);
        match mode {
            ConcurrencyMode::Processes => {
                // SAFETY: fresh anonymous mapping, checked for MAP_FAILED.
                let ptr = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        size,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self {
                    ptr: NonNull::new(ptr.cast()).expect("mmap returned null"),
                    size,
                    kind: RegionKind::Mmap,
                })
            }
            ConcurrencyMode::Threads => {
                let layout = std::alloc::Layout::from_size_align(size, HEAP_ALIGN)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                // SAFETY: non-zero size, valid layout; zeroed allocation.
                let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
                let ptr = NonNull::new(ptr)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "alloc failed"))?;
                Ok(Self {
                    ptr,
                    size,
                    kind: RegionKind::Heap(layout),
                })
            }
        }
    }

    /// Allocate a System V segment and return its id alongside the region.
    ///
    /// Only meaningful in process mode; thread mode falls back to
    /// [`SharedRegion::anonymous`] with id `-1` since every worker already
    /// shares the address space.
    pub fn with_id(mode: ConcurrencyMode, size: usize) -> io::Result<(i32, Self)> {
        if mode == ConcurrencyMode::Threads {
            return Ok((-1, Self::anonymous(mode, size)?));
        }
        static NEXT_KEY: AtomicI32 = AtomicI32::new(1);
        // SAFETY: System V calls with error checking; the mapping stays
        // valid until shmdt since IPC_RMID only reclaims after the last
        // detach.
        unsafe {
            let id = loop {
                let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
                let id = libc::shmget(
                    key,
                    size,
                    libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
                );
                if id != -1 {
                    break id;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EEXIST) {
                    return Err(err);
                }
            };
            let ptr = libc::shmat(id, std::ptr::null(), 0);
            if ptr as isize == -1 {
                return Err(io::Error::last_os_error());
            }
            let mut ds: libc::shmid_ds = std::mem::zeroed();
            if libc::shmctl(id, libc::IPC_RMID, &mut ds) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok((
                id,
                Self {
                    ptr: NonNull::new(ptr.cast()).expect("shmat returned null"),
                    size,
                    kind: RegionKind::SysV,
                },
            ))
        }
    }

    /// Attach an existing System V segment by id.
    pub fn attach(id: i32, size: usize) -> io::Result<Self> {
        // SAFETY: attach-by-id with error checking.
        let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr.cast()).expect("shmat returned null"),
            size,
            kind: RegionKind::SysV,
        })
    }

    /// Base pointer of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the region is empty (never true; regions have a size).
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        match &self.kind {
            RegionKind::Heap(layout) => unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), *layout);
            },
            RegionKind::Mmap => unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.size);
            },
            RegionKind::SysV => unsafe {
                libc::shmdt(self.ptr.as_ptr().cast());
            },
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_is_zeroed() {
        let region = SharedRegion::anonymous(ConcurrencyMode::Threads, 4096).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn mmap_region_is_writable() {
        let region = SharedRegion::anonymous(ConcurrencyMode::Processes, 4096).unwrap();
        unsafe {
            *region.as_ptr() = 0xAB;
            assert_eq!(*region.as_ptr(), 0xAB);
        }
    }

    #[test]
    fn sysv_segment_attaches_by_id() {
        let (id, region) = SharedRegion::with_id(ConcurrencyMode::Processes, 4096).unwrap();
        assert!(id >= 0);
        unsafe {
            *region.as_ptr() = 0x5A;
        }
        let other = SharedRegion::attach(id, 4096).unwrap();
        unsafe {
            assert_eq!(*other.as_ptr(), 0x5A);
        }
    }
}
