//! Per-queue register windows, overlaid directly on the BAR0 mapping.
//!
//! Each queue's 64-byte register block lives at a fixed offset from BAR0;
//! these wrappers just turn that offset into a typed pointer so the queue
//! engines can read/write named fields instead of raw `u32` offsets.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::regs::{
    RegistersRx, RegistersTx, QUEUE_REGISTERS_STRIDE, RX_QUEUE_REGISTERS_BASE,
    TX_QUEUE_REGISTERS_BASE,
};

/// Registers for one receive queue, borrowed from the device's BAR0 mapping.
pub struct IxgbeRxQueueRegisters {
    regs: NonNull<RegistersRx>,
}

// SAFETY: each queue's register block is only ever accessed by the one
// thread that owns the corresponding `RxQueue`.
unsafe impl Send for IxgbeRxQueueRegisters {}

impl IxgbeRxQueueRegisters {
    /// # Safety
    /// `bar0` must be a valid pointer into a BAR0 mapping at least
    /// `RX_QUEUE_REGISTERS_BASE + (queue_index + 1) * QUEUE_REGISTERS_STRIDE`
    /// bytes long, and must stay mapped for the lifetime of the returned value.
    pub unsafe fn new(bar0: *mut u8, queue_index: u8) -> Self {
        let offset = RX_QUEUE_REGISTERS_BASE + queue_index as usize * QUEUE_REGISTERS_STRIDE;
        let ptr = bar0.add(offset) as *mut RegistersRx;
        IxgbeRxQueueRegisters {
            regs: NonNull::new(ptr).expect("BAR0 pointer is never null"),
        }
    }

    pub fn set_rdbal(&mut self, value: u32) {
        self.rdbal.write(value);
    }
    pub fn set_rdbah(&mut self, value: u32) {
        self.rdbah.write(value);
    }
    pub fn set_rdlen(&mut self, value: u32) {
        self.rdlen.write(value);
    }
    pub fn set_rdh(&mut self, value: u32) {
        self.rdh.write(value);
    }
    pub fn set_rdt(&mut self, value: u32) {
        self.rdt.write(value);
    }
}

impl Deref for IxgbeRxQueueRegisters {
    type Target = RegistersRx;
    fn deref(&self) -> &RegistersRx {
        unsafe { self.regs.as_ref() }
    }
}

impl DerefMut for IxgbeRxQueueRegisters {
    fn deref_mut(&mut self) -> &mut RegistersRx {
        unsafe { self.regs.as_mut() }
    }
}

/// Registers for one transmit queue, borrowed from the device's BAR0 mapping.
pub struct IxgbeTxQueueRegisters {
    regs: NonNull<RegistersTx>,
}

unsafe impl Send for IxgbeTxQueueRegisters {}

impl IxgbeTxQueueRegisters {
    /// # Safety
    /// Same obligations as [`IxgbeRxQueueRegisters::new`], against the
    /// transmit queue register region instead.
    pub unsafe fn new(bar0: *mut u8, queue_index: u8) -> Self {
        let offset = TX_QUEUE_REGISTERS_BASE + queue_index as usize * QUEUE_REGISTERS_STRIDE;
        let ptr = bar0.add(offset) as *mut RegistersTx;
        IxgbeTxQueueRegisters {
            regs: NonNull::new(ptr).expect("BAR0 pointer is never null"),
        }
    }

    pub fn set_tdbal(&mut self, value: u32) {
        self.tdbal.write(value);
    }
    pub fn set_tdbah(&mut self, value: u32) {
        self.tdbah.write(value);
    }
    pub fn set_tdlen(&mut self, value: u32) {
        self.tdlen.write(value);
    }
    pub fn set_tdh(&mut self, value: u32) {
        self.tdh.write(value);
    }
    pub fn set_tdt(&mut self, value: u32) {
        self.tdt.write(value);
    }
}

impl Deref for IxgbeTxQueueRegisters {
    type Target = RegistersTx;
    fn deref(&self) -> &RegistersTx {
        unsafe { self.regs.as_ref() }
    }
}

impl DerefMut for IxgbeTxQueueRegisters {
    fn deref_mut(&mut self) -> &mut RegistersTx {
        unsafe { self.regs.as_mut() }
    }
}
