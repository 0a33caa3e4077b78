//! The error taxonomy surfaced by this crate's public API.

use ixgbe_pci::PciAddress;

/// Every way a device open, queue operation, or buffer access can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{addr:?} is not a supported ixgbe device (vendor 0x{vendor_id:04x} device 0x{device_id:04x})")]
    UnsupportedDevice {
        addr: PciAddress,
        vendor_id: u16,
        device_id: u16,
    },

    #[error("permission denied (huge-page mount, pagemap, or sysfs write)")]
    PermissionDenied,

    #[error("resource exhausted: no free buffer available")]
    ResourceExhausted,

    #[error("RX descriptor arrived with DD set but EOP clear; multi-segment packets are unsupported")]
    UnsupportedMultiSegment,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out waiting for link (10s)")]
    LinkTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ixgbe_pci::Error> for Error {
    fn from(e: ixgbe_pci::Error) -> Self {
        match e {
            ixgbe_pci::Error::UnsupportedDevice(addr, vendor_id, device_id, _class) => {
                Error::UnsupportedDevice {
                    addr,
                    vendor_id,
                    device_id,
                }
            }
            ixgbe_pci::Error::PermissionDenied(_) => Error::PermissionDenied,
            ixgbe_pci::Error::InvalidArgument(s) => Error::InvalidArgument(s),
            ixgbe_pci::Error::Io(io) => Error::Io(io),
        }
    }
}

impl From<ixgbe_dma::Error> for Error {
    fn from(e: ixgbe_dma::Error) -> Self {
        match e {
            ixgbe_dma::Error::PermissionDenied => Error::PermissionDenied,
            ixgbe_dma::Error::InvalidArgument { size } => {
                Error::InvalidArgument(format!("invalid DMA allocation size {size}"))
            }
            ixgbe_dma::Error::ResourceExhausted { .. } => Error::ResourceExhausted,
            ixgbe_dma::Error::Io(io) => Error::Io(io),
        }
    }
}

impl From<ixgbe_buffers::Error> for Error {
    fn from(e: ixgbe_buffers::Error) -> Self {
        match e {
            ixgbe_buffers::Error::InvalidArgument { capacity, stride } => Error::InvalidArgument(
                format!("pool capacity {capacity} * stride {stride} is invalid"),
            ),
            ixgbe_buffers::Error::OutOfBounds { offset, len, stride } => Error::InvalidArgument(
                format!("access at offset {offset} len {len} overruns {stride}-byte buffer"),
            ),
            ixgbe_buffers::Error::Dma(dma) => dma.into(),
        }
    }
}
