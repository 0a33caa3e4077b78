//! Descriptor types and traits shared by the Intel 10GbE ("ixgbe") driver.
//!
//! Receive and transmit descriptors are the 16-byte records a NIC's DMA
//! engine reads and writes directly; the fields here mirror the device's
//! memory layout exactly, so every field access goes through
//! [`volatile::Volatile`] to stop the compiler from reordering or eliding
//! accesses the hardware depends on.

pub mod descriptors;

/// A physical (bus) address, as seen by a device doing DMA.
///
/// Kept distinct from a virtual address so the two are never mixed up at a
/// call site; `ixgbe-dma` is the only crate that knows how to produce one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        PhysicalAddress(addr)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl core::fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}
