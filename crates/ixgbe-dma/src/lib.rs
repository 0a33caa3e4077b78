//! Huge-page-backed DMA memory.
//!
//! Every region handed to a descriptor ring or packet buffer pool comes from
//! here: a virtual mapping backed by either ordinary pinned pages or
//! `hugetlbfs` huge pages, paired with the physical address the NIC's DMA
//! engine needs to address it. Virtual-to-physical translation goes through
//! `/proc/self/pagemap`, the same mechanism every userspace driver without
//! IOMMU/VFIO support relies on.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::process;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::debug;

use ixgbe_intel_ethernet::PhysicalAddress;

/// Errors raised while allocating or translating DMA memory.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("requested size {size} is not valid for a DMA allocation")]
    InvalidArgument { size: usize },

    #[error("contiguous allocation of {size} bytes exceeds the huge page size")]
    ResourceExhausted { size: usize },

    #[error("insufficient permission to read /proc/self/pagemap (are you root?)")]
    PermissionDenied,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const HUGE_PAGE_BITS: u32 = 21;
/// Size, in bytes, of the huge pages this driver uses (2 MiB).
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_BITS;

const DEFAULT_HUGEPAGE_DIR: &str = "/mnt/huge";

static HUGEPAGE_ID: AtomicUsize = AtomicUsize::new(0);
static HUGEPAGE_DIR: OnceLock<String> = OnceLock::new();

fn hugepage_dir() -> &'static str {
    HUGEPAGE_DIR.get_or_init(|| {
        std::env::var("IXGBE_HUGEPAGE_DIR").unwrap_or_else(|_| DEFAULT_HUGEPAGE_DIR.to_string())
    })
}

fn system_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
}

/// An immutable virt/phys/size triple describing one DMA-capable mapping.
///
/// Construction is restricted to this crate; every other crate only ever
/// receives an already-allocated region from [`HugepageAllocator::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: PhysicalAddress,
    size: usize,
}

// SAFETY: a `DmaRegion` is a plain descriptor of memory the driver owns
// exclusively; moving the handle across threads does not touch the pages.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    pub(crate) fn new(virt: NonNull<u8>, phys: PhysicalAddress, size: usize) -> Self {
        DmaRegion { virt, phys, size }
    }

    /// Virtual base address of the mapping, as seen by this process.
    pub fn virt(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Physical (bus) base address of the mapping, as seen by the device.
    pub fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Allocates and frees huge-page- or regular-page-backed DMA memory.
pub struct HugepageAllocator;

impl HugepageAllocator {
    /// Allocates `size` bytes of DMA memory.
    ///
    /// `huge` selects huge-page backing; `contiguous` requires the returned
    /// region to be physically contiguous, which this allocator can only
    /// guarantee within a single huge page.
    pub fn allocate(size: usize, huge: bool, contiguous: bool) -> Result<DmaRegion, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument { size });
        }

        if !huge {
            return Self::allocate_regular(size);
        }

        let size = round_up_to_huge_page(size);
        if contiguous && size > HUGE_PAGE_SIZE {
            return Err(Error::ResourceExhausted { size });
        }

        let id = HUGEPAGE_ID.fetch_add(1, Ordering::SeqCst);
        let path = format!("{}/ixgbe-{}-{}", hugepage_dir(), process::id(), id);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_HUGETLB,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let _ = fs::remove_file(&path);
            return Err(std::io::Error::last_os_error().into());
        }

        if unsafe { libc::mlock(ptr, size) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr, size);
            }
            let _ = fs::remove_file(&path);
            return Err(err.into());
        }

        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, size);
        }

        let phys = virt_to_phys(ptr as usize)?;
        let virt = NonNull::new(ptr as *mut u8).expect("mmap returned a non-null pointer");
        let region = DmaRegion::new(virt, PhysicalAddress::new(phys as u64), size);

        debug!(
            "allocated {} bytes of huge-page DMA memory at virt={:p} phys={:#x}",
            size,
            region.virt(),
            phys
        );

        Ok(region)
    }

    fn allocate_regular(size: usize) -> Result<DmaRegion, Error> {
        let page_size = system_page_size();
        let rounded = round_up_to(size, page_size);

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        if unsafe { libc::mlock(ptr, rounded) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr, rounded);
            }
            return Err(err.into());
        }

        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, rounded);
        }

        let phys = virt_to_phys(ptr as usize)?;
        let virt = NonNull::new(ptr as *mut u8).expect("mmap returned a non-null pointer");
        let region = DmaRegion::new(virt, PhysicalAddress::new(phys as u64), rounded);

        debug!(
            "allocated {} bytes of pinned DMA memory at virt={:p} phys={:#x}",
            rounded,
            region.virt(),
            phys
        );

        Ok(region)
    }

    /// Releases a region previously returned by [`allocate`](Self::allocate).
    ///
    /// Freeing any address inside the region works: the base is recovered by
    /// rounding down to the page boundary implied by the region's own size.
    pub fn free(region: DmaRegion) {
        let page_size = if region.size() >= HUGE_PAGE_SIZE {
            HUGE_PAGE_SIZE
        } else {
            system_page_size()
        };
        let base = (region.virt() as usize) & !(page_size - 1);

        unsafe {
            libc::munlock(base as *mut libc::c_void, region.size());
            libc::munmap(base as *mut libc::c_void, region.size());
        }

        debug!("freed {} bytes of DMA memory at virt={:#x}", region.size(), base);
    }
}

fn round_up_to(size: usize, alignment: usize) -> usize {
    if size % alignment == 0 {
        size
    } else {
        ((size / alignment) + 1) * alignment
    }
}

fn round_up_to_huge_page(size: usize) -> usize {
    round_up_to(size, HUGE_PAGE_SIZE)
}

/// Resolves the physical address backing a virtual address in this process.
fn virt_to_phys(addr: usize) -> Result<usize, Error> {
    let page_size = system_page_size();

    let mut file = open_pagemap()?;
    file.seek(SeekFrom::Start(
        (addr / page_size * std::mem::size_of::<u64>()) as u64,
    ))?;

    let mut buffer = [0u8; std::mem::size_of::<u64>()];
    file.read_exact(&mut buffer)?;
    let entry = u64::from_ne_bytes(buffer);

    let phys = (entry & ((1u64 << 54) - 1)) as usize * page_size + addr % page_size;
    Ok(phys)
}

fn open_pagemap() -> Result<File, Error> {
    match File::open("/proc/self/pagemap") {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(Error::PermissionDenied),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_size() {
        assert!(matches!(
            HugepageAllocator::allocate(0, false, false),
            Err(Error::InvalidArgument { size: 0 })
        ));
    }

    #[test]
    fn regular_allocation_round_trips_and_zeroes() {
        let region = HugepageAllocator::allocate(4096, false, false).expect("allocate");
        assert!(region.size() >= 4096);
        let slice = unsafe { std::slice::from_raw_parts(region.virt(), region.size()) };
        assert!(slice.iter().all(|&b| b == 0));
        HugepageAllocator::free(region);
    }

    #[test]
    fn rounds_up_to_huge_page_multiple() {
        assert_eq!(round_up_to_huge_page(1), HUGE_PAGE_SIZE);
        assert_eq!(round_up_to_huge_page(HUGE_PAGE_SIZE), HUGE_PAGE_SIZE);
        assert_eq!(round_up_to_huge_page(HUGE_PAGE_SIZE + 1), 2 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn contiguous_oversized_request_is_rejected() {
        let err = HugepageAllocator::allocate(HUGE_PAGE_SIZE + 1, true, true).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { .. }));
    }
}
