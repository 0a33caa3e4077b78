//! Userspace, polling-mode driver for the Intel 82599/X540/X550 ("ixgbe")
//! family of 10 GbE NICs.
//!
//! The device's kernel driver is unbound, its PCI BAR0 is mapped directly
//! into this process, and every receive/transmit descriptor ring lives in
//! huge-page-backed DMA memory this process owns outright. There are no
//! interrupts: callers drive the device by calling [`device::Device::rx_queue`]
//! and [`device::Device::tx_queue`] and polling their batch methods.

pub mod device;
pub mod error;
pub mod queue_registers;
pub mod regs;
pub mod rx;
pub mod tx;

pub use device::{Device, DeviceConfig, DeviceStats};
pub use error::Error;
pub use rx::RxQueue;
pub use tx::TxQueue;

pub use ixgbe_buffers::{BufferPool, PacketBuffer};
pub use ixgbe_pci::PciAddress;
