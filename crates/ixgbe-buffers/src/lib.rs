//! Packet buffer pools: fixed-size buffers carved out of a single DMA
//! region, handed out LIFO, and tracked by a process-wide registry so a
//! buffer can always find its way back to the pool it came from.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lazy_static::lazy_static;
use log::debug;
use volatile::Volatile;

use ixgbe_dma::{DmaRegion, HugepageAllocator, HUGE_PAGE_SIZE};
use ixgbe_intel_ethernet::PhysicalAddress;

/// Errors raised by buffer pool construction or buffer access.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool capacity {capacity} * stride {stride} does not fit in its DMA region")]
    InvalidArgument { capacity: u32, stride: u32 },

    #[error("access at offset {offset} of length {len} overruns a {stride}-byte buffer")]
    OutOfBounds { offset: usize, len: usize, stride: u32 },

    #[error(transparent)]
    Dma(#[from] ixgbe_dma::Error),
}

/// Size, in bytes, of the fixed header every packet buffer begins with.
pub const HEADER_SIZE: usize = 64;
/// Conventional total buffer size (header + payload) used by this driver.
pub const DEFAULT_STRIDE: u32 = 2048;

/// The NIC's DMA engine reads `physical_address` and the driver's own RX/TX
/// paths read and write `size` on every packet; both go through
/// [`Volatile`] so the compiler can't reorder or elide those accesses.
#[repr(C)]
struct RawHeader {
    physical_address: Volatile<u64>,
    memory_pool_id: Volatile<u32>,
    _reserved0: u32,
    size: Volatile<u32>,
    _reserved1: [u8; 44],
}

// Fails to compile if the layout ever drifts from the fixed 64-byte header
// the device format requires.
const _: () = assert!(std::mem::size_of::<RawHeader>() == HEADER_SIZE);

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

lazy_static! {
    static ref POOL_REGISTRY: RwLock<HashMap<u32, Arc<Mutex<BufferPool>>>> =
        RwLock::new(HashMap::new());
}

/// Looks up a pool by the id stored in a buffer's header.
pub fn pool_by_id(id: u32) -> Option<Arc<Mutex<BufferPool>>> {
    POOL_REGISTRY.read().unwrap().get(&id).cloned()
}

/// A fixed-capacity LIFO of fixed-size buffers, all carved from one DMA region.
pub struct BufferPool {
    id: u32,
    capacity: u32,
    stride: u32,
    region: DmaRegion,
    free_stack: Vec<u32>,
}

impl BufferPool {
    /// Allocates a new huge-page-backed pool and registers it process-wide.
    pub fn new(capacity: u32, stride: u32) -> Result<Arc<Mutex<BufferPool>>, Error> {
        if stride == 0 || HUGE_PAGE_SIZE as u32 % stride != 0 {
            return Err(Error::InvalidArgument { capacity, stride });
        }
        let total = capacity as u64 * stride as u64;

        let region = HugepageAllocator::allocate(total as usize, true, false)?;
        if total > region.size() as u64 {
            HugepageAllocator::free(region);
            return Err(Error::InvalidArgument { capacity, stride });
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::SeqCst);
        let mut free_stack = Vec::with_capacity(capacity as usize);

        for i in 0..capacity {
            let header_virt = unsafe { region.virt().add(i as usize * stride as usize) };
            let header_phys = region.phys().value() + i as u64 * stride as u64;
            let header = RawHeader {
                physical_address: Volatile::new(header_phys + HEADER_SIZE as u64),
                memory_pool_id: Volatile::new(id),
                _reserved0: 0,
                size: Volatile::new(0),
                _reserved1: [0; 44],
            };
            unsafe {
                (header_virt as *mut RawHeader).write(header);
            }
            free_stack.push(i);
        }

        let pool = Arc::new(Mutex::new(BufferPool {
            id,
            capacity,
            stride,
            region,
            free_stack,
        }));

        POOL_REGISTRY.write().unwrap().insert(id, Arc::clone(&pool));
        debug!(
            "registered pool {} with {} buffers of {} bytes each",
            id, capacity, stride
        );

        Ok(pool)
    }

    /// Process-wide unique id of this pool.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Total number of buffers this pool was created with.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of buffers currently free.
    pub fn size(&self) -> u32 {
        self.free_stack.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.free_stack.is_empty()
    }

    /// Removes one free buffer from the pool, LIFO, or `None` if exhausted.
    pub fn pop(&mut self) -> Option<PacketBuffer> {
        let index = self.free_stack.pop()?;
        let ptr = unsafe { self.region.virt().add(index as usize * self.stride as usize) };
        let ptr = NonNull::new(ptr).expect("pool buffer pointer is never null");
        Some(PacketBuffer {
            ptr,
            pool_id: self.id,
            stride: self.stride,
        })
    }

    /// Returns a buffer to this pool.
    ///
    /// Rejects buffers that do not belong to this pool.
    pub fn push(&mut self, buffer: PacketBuffer) -> Result<(), Error> {
        if buffer.pool_id != self.id {
            return Err(Error::InvalidArgument {
                capacity: self.capacity,
                stride: self.stride,
            });
        }
        let base = self.region.virt() as usize;
        let offset = buffer.ptr.as_ptr() as usize - base;
        let index = (offset / self.stride as usize) as u32;
        self.free_stack.push(index);
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        POOL_REGISTRY.write().unwrap().remove(&self.id);
        HugepageAllocator::free(self.region);
    }
}

/// A cheap, copyable handle to one packet buffer: a header pointer plus the
/// id of the pool it came from. Ordered by virtual address.
#[derive(Clone, Copy, Debug)]
pub struct PacketBuffer {
    ptr: NonNull<u8>,
    pool_id: u32,
    stride: u32,
}

// SAFETY: a `PacketBuffer` is a bare pointer into DMA memory the driver owns
// exclusively while the buffer is checked out of its pool.
unsafe impl Send for PacketBuffer {}

impl PartialEq for PacketBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl Eq for PacketBuffer {}

impl PartialOrd for PacketBuffer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PacketBuffer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ptr.as_ptr() as usize).cmp(&(other.ptr.as_ptr() as usize))
    }
}

impl PacketBuffer {
    fn header(&self) -> &RawHeader {
        unsafe { &*(self.ptr.as_ptr() as *const RawHeader) }
    }

    fn header_mut(&mut self) -> &mut RawHeader {
        unsafe { &mut *(self.ptr.as_ptr() as *mut RawHeader) }
    }

    /// Virtual address of this buffer's header (payload starts 64 bytes in).
    pub fn virtual_address(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Physical address of the payload, as read from the header.
    pub fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.header().physical_address.read())
    }

    /// Id of the pool this buffer was allocated from.
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Current payload length in bytes.
    pub fn size(&self) -> u32 {
        self.header().size.read()
    }

    /// Sets the payload length in bytes.
    pub fn set_size(&mut self, size: u32) {
        self.header_mut().size.write(size);
    }

    fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(HEADER_SIZE),
                self.stride as usize - HEADER_SIZE,
            )
        }
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(HEADER_SIZE),
                self.stride as usize - HEADER_SIZE,
            )
        }
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), Error> {
        if offset + len > self.stride as usize - HEADER_SIZE {
            return Err(Error::OutOfBounds {
                offset,
                len,
                stride: self.stride,
            });
        }
        Ok(())
    }

    pub fn get(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.payload()[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn put(&mut self, offset: usize, buf: &[u8]) -> Result<(), Error> {
        self.check_bounds(offset, buf.len())?;
        self.payload_mut()[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    pub fn get_u8(&self, offset: usize) -> Result<u8, Error> {
        self.check_bounds(offset, 1)?;
        Ok(self.payload()[offset])
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) -> Result<(), Error> {
        self.check_bounds(offset, 1)?;
        self.payload_mut()[offset] = value;
        Ok(())
    }

    pub fn get_u16(&self, offset: usize) -> Result<u16, Error> {
        self.check_bounds(offset, 2)?;
        let bytes: [u8; 2] = self.payload()[offset..offset + 2].try_into().unwrap();
        Ok(u16::from_ne_bytes(bytes))
    }

    pub fn put_u16(&mut self, offset: usize, value: u16) -> Result<(), Error> {
        self.check_bounds(offset, 2)?;
        self.payload_mut()[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    pub fn get_u32(&self, offset: usize) -> Result<u32, Error> {
        self.check_bounds(offset, 4)?;
        let bytes: [u8; 4] = self.payload()[offset..offset + 4].try_into().unwrap();
        Ok(u32::from_ne_bytes(bytes))
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) -> Result<(), Error> {
        self.check_bounds(offset, 4)?;
        self.payload_mut()[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    pub fn get_u64(&self, offset: usize) -> Result<u64, Error> {
        self.check_bounds(offset, 8)?;
        let bytes: [u8; 8] = self.payload()[offset..offset + 8].try_into().unwrap();
        Ok(u64::from_ne_bytes(bytes))
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) -> Result<(), Error> {
        self.check_bounds(offset, 8)?;
        self.payload_mut()[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_stride_not_dividing_huge_page() {
        let err = BufferPool::new(4, 3000).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn pop_push_conserves_free_count() {
        let pool = BufferPool::new(8, DEFAULT_STRIDE).expect("pool");
        let mut guard = pool.lock().unwrap();
        assert_eq!(guard.size(), 8);

        let buf = guard.pop().expect("buffer");
        assert_eq!(guard.size(), 7);

        guard.push(buf).expect("push back");
        assert_eq!(guard.size(), 8);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = BufferPool::new(2, DEFAULT_STRIDE).expect("pool");
        let mut guard = pool.lock().unwrap();
        assert!(guard.pop().is_some());
        assert!(guard.pop().is_some());
        assert!(guard.pop().is_none());
        assert!(guard.is_empty());
    }

    #[test]
    fn buffer_header_is_initialized_correctly() {
        let pool = BufferPool::new(1, DEFAULT_STRIDE).expect("pool");
        let mut guard = pool.lock().unwrap();
        let id = guard.id();
        let buf = guard.pop().expect("buffer");

        assert_eq!(buf.pool_id(), id);
        assert_eq!(buf.size(), 0);
        assert_eq!(
            buf.physical_address().value(),
            guard.region.phys().value() + HEADER_SIZE as u64
        );
    }

    #[test]
    fn payload_put_get_round_trips() {
        let pool = BufferPool::new(1, DEFAULT_STRIDE).expect("pool");
        let mut guard = pool.lock().unwrap();
        let mut buf = guard.pop().expect("buffer");

        buf.put_u32(0, 0xdead_beef).expect("put");
        assert_eq!(buf.get_u32(0).expect("get"), 0xdead_beef);

        let mut out = [0u8; 4];
        buf.get(0, &mut out).expect("bulk get");
        assert_eq!(u32::from_ne_bytes(out), 0xdead_beef);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let pool = BufferPool::new(1, DEFAULT_STRIDE).expect("pool");
        let mut guard = pool.lock().unwrap();
        let buf = guard.pop().expect("buffer");
        assert!(buf.get_u8(DEFAULT_STRIDE as usize).is_err());
    }

    #[test]
    fn pool_is_findable_by_id_until_dropped() {
        let pool = BufferPool::new(1, DEFAULT_STRIDE).expect("pool");
        let id = pool.lock().unwrap().id();
        assert!(pool_by_id(id).is_some());
        drop(pool);
        assert!(pool_by_id(id).is_none());
    }

    #[test]
    fn handles_order_by_virtual_address() {
        let pool = BufferPool::new(2, DEFAULT_STRIDE).expect("pool");
        let mut guard = pool.lock().unwrap();
        let a = guard.pop().unwrap();
        let b = guard.pop().unwrap();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo.virtual_address() < hi.virtual_address());
    }
}
