//! The receive descriptor ring: one per queue, driven entirely by polling.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use log::debug;

use ixgbe_buffers::{BufferPool, PacketBuffer};
use ixgbe_dma::{DmaRegion, HugepageAllocator};
use ixgbe_intel_ethernet::descriptors::{AdvancedRxDescriptor, RxDescriptor};

use crate::error::Error;
use crate::queue_registers::IxgbeRxQueueRegisters;
use crate::regs;

/// A single receive descriptor ring and the buffers backing it.
pub struct RxQueue {
    index: u8,
    regs: IxgbeRxQueueRegisters,
    ring: DmaRegion,
    descriptors: NonNull<AdvancedRxDescriptor>,
    capacity: u16,
    cursor: u16,
    last_consumed: u16,
    buffers: Vec<PacketBuffer>,
    pool: Arc<Mutex<BufferPool>>,
}

// SAFETY: an `RxQueue` is only ever driven by the one thread that owns it.
unsafe impl Send for RxQueue {}

impl RxQueue {
    /// Allocates the descriptor ring, programs the queue's registers, and
    /// fills every slot with a buffer popped from `pool`.
    ///
    /// # Safety
    /// `bar0` must point at a live BAR0 mapping covering this queue's
    /// register block for as long as the returned `RxQueue` is used.
    pub unsafe fn init(
        index: u8,
        bar0: *mut u8,
        capacity: u16,
        pool: Arc<Mutex<BufferPool>>,
    ) -> Result<Self, Error> {
        assert!(capacity.is_power_of_two() && capacity <= 4096);

        let ring = HugepageAllocator::allocate(capacity as usize * 16, true, true)?;
        std::ptr::write_bytes(ring.virt(), 0xFF, ring.size());

        let mut regs = IxgbeRxQueueRegisters::new(bar0, index);
        regs.set_rdbal(ring.phys().value() as u32);
        regs.set_rdbah((ring.phys().value() >> 32) as u32);
        regs.set_rdlen(ring.size() as u32);
        regs.set_rdh(0);
        regs.set_rdt(0);
        regs.srrctl
            .write(regs::SRRCTL_DESCTYPE_ADV_1BUFFER | regs::SRRCTL_DROP_EN);

        let descriptors = NonNull::new(ring.virt() as *mut AdvancedRxDescriptor)
            .expect("ring base is never null");

        let mut buffers = Vec::with_capacity(capacity as usize);
        {
            let mut guard = pool.lock().unwrap();
            for slot in 0..capacity {
                let buffer = guard.pop().ok_or(Error::ResourceExhausted)?;
                let desc = &mut *descriptors.as_ptr().add(slot as usize);
                desc.init(buffer.physical_address());
                buffers.push(buffer);
            }
        }

        regs.rxdctl.write(regs.rxdctl.read() | regs::QUEUE_ENABLE);
        while regs.rxdctl.read() & regs::QUEUE_ENABLE == 0 {
            std::hint::spin_loop();
        }
        regs.set_rdt(capacity as u32 - 1);

        debug!("rx queue {index} initialized with {capacity} descriptors");

        Ok(RxQueue {
            index,
            regs,
            ring,
            descriptors,
            capacity,
            cursor: 0,
            last_consumed: capacity - 1,
            buffers,
            pool,
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Receives up to `length` packets into `out_buffers[offset..]`.
    ///
    /// Never blocks: returns 0 once the ring has no more completed
    /// descriptors. Refilling a drained slot that finds its pool empty
    /// fails the whole batch with [`Error::ResourceExhausted`], after
    /// already-claimed packets have been written into `out_buffers`.
    pub fn rx_batch(
        &mut self,
        out_buffers: &mut [PacketBuffer],
        offset: usize,
        length: usize,
    ) -> Result<usize, Error> {
        let mask = self.capacity - 1;
        let mut received = 0usize;

        let result = loop {
            if received >= length {
                break Ok(received);
            }

            let idx = self.cursor as usize;
            let desc = unsafe { &mut *self.descriptors.as_ptr().add(idx) };
            if !desc.descriptor_done() {
                break Ok(received);
            }
            if !desc.end_of_packet() {
                break Err(Error::UnsupportedMultiSegment);
            }

            let mut handed_back = self.buffers[idx];
            handed_back.set_size(desc.length() as u32);

            let fresh = match self.pool.lock().unwrap().pop() {
                Some(buf) => buf,
                None => break Err(Error::ResourceExhausted),
            };
            desc.set_packet_address(fresh.physical_address());
            desc.reset_status();
            self.buffers[idx] = fresh;

            out_buffers[offset + received] = handed_back;
            self.last_consumed = idx as u16;
            self.cursor = (self.cursor + 1) & mask;
            received += 1;
        };

        if received > 0 {
            self.regs.set_rdt(self.last_consumed as u32);
        }
        result
    }

    /// Releases the ring's DMA memory. Buffers still checked out to callers
    /// are not affected; their owning pool accounts for them separately.
    pub fn close(self) {
        HugepageAllocator::free(self.ring);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixgbe_buffers::DEFAULT_STRIDE;

    fn bar0() -> *mut u8 {
        // A plain heap buffer stands in for BAR0 in tests: large enough to
        // cover one queue's register block with headroom, and never touched
        // by real hardware.
        let layout = std::alloc::Layout::from_size_align(0x2000, 4096).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) }
    }

    #[test]
    fn init_fills_every_slot_and_sets_rdt() {
        let pool = BufferPool::new(64, DEFAULT_STRIDE).expect("pool");
        let bar0 = bar0();
        let queue = unsafe { RxQueue::init(0, bar0, 16, pool).expect("init") };
        assert_eq!(queue.capacity, 16);
        assert_eq!(queue.regs.rdt.read(), 15);
        queue.close();
    }

    #[test]
    fn empty_rx_returns_zero_without_touching_rdt() {
        let pool = BufferPool::new(64, DEFAULT_STRIDE).expect("pool");
        let bar0 = bar0();
        let mut queue = unsafe { RxQueue::init(0, bar0, 16, pool).expect("init") };
        let rdt_before = queue.regs.rdt.read();

        let mut out = vec![queue.buffers[0]; 8];
        let n = queue.rx_batch(&mut out, 0, 8).expect("rx_batch");
        assert_eq!(n, 0);
        assert_eq!(queue.regs.rdt.read(), rdt_before);
        queue.close();
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let result = std::panic::catch_unwind(|| {
            let pool = BufferPool::new(8, DEFAULT_STRIDE).expect("pool");
            let bar0 = bar0();
            unsafe { RxQueue::init(0, bar0, 3, pool) }
        });
        assert!(result.is_err());
    }
}
