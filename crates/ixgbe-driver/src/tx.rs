//! The transmit descriptor ring: deferred, batched cleanup plus enqueue.

use std::ptr::NonNull;

use log::debug;

use ixgbe_buffers::{pool_by_id, PacketBuffer};
use ixgbe_dma::{DmaRegion, HugepageAllocator};
use ixgbe_intel_ethernet::descriptors::{AdvancedTxDescriptor, TxDescriptor};

use crate::error::Error;
use crate::queue_registers::IxgbeTxQueueRegisters;
use crate::regs;

/// Number of completed descriptors reclaimed together, per spec §4.7.
const TX_CLEAN_BATCH: u16 = 32;

/// A single transmit descriptor ring and the in-flight buffers it owns.
pub struct TxQueue {
    index: u8,
    regs: IxgbeTxQueueRegisters,
    ring: DmaRegion,
    descriptors: NonNull<AdvancedTxDescriptor>,
    capacity: u16,
    cursor: u16,
    clean_index: u16,
    in_flight: Vec<Option<PacketBuffer>>,
}

// SAFETY: a `TxQueue` is only ever driven by the one thread that owns it.
unsafe impl Send for TxQueue {}

impl TxQueue {
    /// # Safety
    /// `bar0` must point at a live BAR0 mapping covering this queue's
    /// register block for as long as the returned `TxQueue` is used.
    pub unsafe fn init(index: u8, bar0: *mut u8, capacity: u16) -> Result<Self, Error> {
        assert!(capacity.is_power_of_two() && capacity <= 4096);

        let ring = HugepageAllocator::allocate(capacity as usize * 16, true, true)?;
        std::ptr::write_bytes(ring.virt(), 0xFF, ring.size());

        let mut regs = IxgbeTxQueueRegisters::new(bar0, index);
        regs.set_tdbal(ring.phys().value() as u32);
        regs.set_tdbah((ring.phys().value() >> 32) as u32);
        regs.set_tdlen(ring.size() as u32);
        regs.set_tdh(0);
        regs.set_tdt(0);
        regs.txdctl.write(regs::txdctl_thresholds());
        regs.txdctl.write(regs.txdctl.read() | regs::QUEUE_ENABLE);
        while regs.txdctl.read() & regs::QUEUE_ENABLE == 0 {
            std::hint::spin_loop();
        }

        let descriptors = NonNull::new(ring.virt() as *mut AdvancedTxDescriptor)
            .expect("ring base is never null");

        debug!("tx queue {index} initialized with {capacity} descriptors");

        Ok(TxQueue {
            index,
            regs,
            ring,
            descriptors,
            capacity,
            cursor: 0,
            clean_index: 0,
            in_flight: vec![None; capacity as usize],
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    fn reclaim(&mut self) {
        let mask = self.capacity - 1;
        loop {
            let outstanding = self.cursor.wrapping_sub(self.clean_index) & mask;
            if outstanding < TX_CLEAN_BATCH {
                break;
            }

            let upto = (self.clean_index + TX_CLEAN_BATCH - 1) & mask;
            let desc = unsafe { &*self.descriptors.as_ptr().add(upto as usize) };
            if !desc.descriptor_done() {
                break;
            }

            let mut j = self.clean_index;
            loop {
                if let Some(buf) = self.in_flight[j as usize].take() {
                    if let Some(pool) = pool_by_id(buf.pool_id()) {
                        let _ = pool.lock().unwrap().push(buf);
                    }
                }
                if j == upto {
                    break;
                }
                j = (j + 1) & mask;
            }
            self.clean_index = (upto + 1) & mask;
        }
    }

    /// Transmits up to `length` buffers from `buffers[offset..]`.
    ///
    /// Reclaims completed descriptors first, then enqueues as many new
    /// buffers as the ring has room for; never blocks. Writes TDT exactly
    /// once, even when nothing was enqueued.
    pub fn tx_batch(&mut self, buffers: &[PacketBuffer], offset: usize, length: usize) -> usize {
        self.reclaim();

        let mask = self.capacity - 1;
        let mut sent = 0usize;

        while sent < length {
            let next = (self.cursor + 1) & mask;
            if next == self.clean_index {
                break;
            }

            let buffer = buffers[offset + sent];
            let desc = unsafe { &mut *self.descriptors.as_ptr().add(self.cursor as usize) };
            desc.send(buffer.physical_address(), buffer.size() as u16);
            self.in_flight[self.cursor as usize] = Some(buffer);

            self.cursor = next;
            sent += 1;
        }

        self.regs.set_tdt(self.cursor as u32);
        sent
    }

    /// Releases the ring's DMA memory. In-flight buffers are returned to
    /// their pools first so their owning pool's accounting stays correct.
    pub fn close(mut self) {
        for slot in self.in_flight.drain(..) {
            if let Some(buf) = slot {
                if let Some(pool) = pool_by_id(buf.pool_id()) {
                    let _ = pool.lock().unwrap().push(buf);
                }
            }
        }
        HugepageAllocator::free(self.ring);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixgbe_buffers::{BufferPool, DEFAULT_STRIDE};

    fn bar0() -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(0x8000, 4096).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) }
    }

    #[test]
    fn full_ring_rejects_the_last_buffer() {
        let pool = BufferPool::new(16, DEFAULT_STRIDE).expect("pool");
        let mut guard = pool.lock().unwrap();
        let buffers: Vec<PacketBuffer> = (0..16).map(|_| guard.pop().unwrap()).collect();
        drop(guard);

        let bar0 = bar0();
        let mut queue = unsafe { TxQueue::init(0, bar0, 16).expect("init") };

        let sent = queue.tx_batch(&buffers, 0, buffers.len());
        assert_eq!(sent, 15, "one slot must stay empty to distinguish full from empty");

        queue.close();
    }

    #[test]
    fn tdt_is_written_even_when_nothing_is_sent() {
        let bar0 = bar0();
        let mut queue = unsafe { TxQueue::init(0, bar0, 16).expect("init") };
        let tdt_before = queue.regs.tdt.read();
        let sent = queue.tx_batch(&[], 0, 0);
        assert_eq!(sent, 0);
        assert_eq!(queue.regs.tdt.read(), tdt_before);
        queue.close();
    }

    #[test]
    fn clean_index_trails_cursor_within_capacity() {
        let pool = BufferPool::new(4, DEFAULT_STRIDE).expect("pool");
        let mut guard = pool.lock().unwrap();
        let buffers: Vec<PacketBuffer> = (0..4).map(|_| guard.pop().unwrap()).collect();
        drop(guard);

        let bar0 = bar0();
        let mut queue = unsafe { TxQueue::init(0, bar0, 8).expect("init") };
        queue.tx_batch(&buffers, 0, buffers.len());

        let mask = queue.capacity - 1;
        let outstanding = queue.cursor.wrapping_sub(queue.clean_index) & mask;
        assert!(outstanding <= queue.capacity - 1);
        queue.close();
    }
}
