//! Register layout and configuration constants for the 82599/X540/X550 BAR0
//! memory-mapped region.
//!
//! Only the registers this driver actually programs are modeled; the 82599
//! exposes a much larger register file (RSS, DCB, flow-control filters,
//! MSI-X tables, ...) that a polling, single-queue-per-thread driver with no
//! offloads never touches.

use volatile::Volatile;
use zerocopy::FromBytes;

/// Set of registers associated with one receive descriptor queue (64 bytes).
#[derive(FromBytes)]
#[repr(C)]
pub struct RegistersRx {
    /// Receive Descriptor Base Address Low
    pub rdbal: Volatile<u32>, // +0x00
    /// Receive Descriptor Base Address High
    pub rdbah: Volatile<u32>, // +0x04
    /// Receive Descriptor Length
    pub rdlen: Volatile<u32>, // +0x08
    /// Rx DCA Control Register
    pub dca_rxctrl: Volatile<u32>, // +0x0C
    /// Receive Descriptor Head
    pub rdh: Volatile<u32>, // +0x10
    /// Split Receive Control Register (descriptor type, drop-on-no-buffer)
    pub srrctl: Volatile<u32>, // +0x14
    /// Receive Descriptor Tail
    pub rdt: Volatile<u32>, // +0x18
    _padding1: [u8; 12], // +0x1C - 0x27
    /// Receive Descriptor Control
    pub rxdctl: Volatile<u32>, // +0x28
    _padding2: [u8; 20], // +0x2C - 0x3F
}

const _: () = assert!(core::mem::size_of::<RegistersRx>() == 64);

/// Set of registers associated with one transmit descriptor queue (64 bytes).
#[derive(FromBytes)]
#[repr(C)]
pub struct RegistersTx {
    /// Transmit Descriptor Base Address Low
    pub tdbal: Volatile<u32>, // +0x00
    /// Transmit Descriptor Base Address High
    pub tdbah: Volatile<u32>, // +0x04
    /// Transmit Descriptor Length
    pub tdlen: Volatile<u32>, // +0x08
    /// Tx DCA Control Register
    pub dca_txctrl: Volatile<u32>, // +0x0C
    /// Transmit Descriptor Head
    pub tdh: Volatile<u32>, // +0x10
    _padding0: [u8; 4], // +0x14 - 0x17
    /// Transmit Descriptor Tail
    pub tdt: Volatile<u32>, // +0x18
    _padding1: [u8; 12], // +0x1C - 0x27
    /// Transmit Descriptor Control
    pub txdctl: Volatile<u32>, // +0x28
    _padding2: [u8; 12], // +0x2C - 0x37
    /// Transmit Descriptor Completion Write Back Address Low
    pub tdwbal: Volatile<u32>, // +0x38
    /// Transmit Descriptor Completion Write Back Address High
    pub tdwbah: Volatile<u32>, // +0x3C
}

const _: () = assert!(core::mem::size_of::<RegistersTx>() == 64);

/// Base offset, in the BAR0 mapping, of receive queue 0's register block.
pub const RX_QUEUE_REGISTERS_BASE: usize = 0x1000;
/// Base offset, in the BAR0 mapping, of transmit queue 0's register block.
pub const TX_QUEUE_REGISTERS_BASE: usize = 0x6000;
/// Byte distance between consecutive per-queue register blocks.
pub const QUEUE_REGISTERS_STRIDE: usize = 0x40;
/// Maximum number of queues this driver configures per direction.
pub const MAX_QUEUES_PER_DIRECTION: u8 = 64;

// Global registers, all offsets absolute within the BAR0 mapping.
/// Device Control Register.
pub const CTRL: usize = 0x0000;
/// Extended Device Control Register.
pub const CTRL_EXT: usize = 0x0018;
/// Extended Interrupt Mask Clear Register.
pub const EIMC: usize = 0x0888;
/// EEPROM/Flash Control Register.
pub const EEC: usize = 0x10010;
/// Receive DMA Control Register.
pub const RDRXCTL: usize = 0x2F00;
/// Receive Control Register.
pub const RXCTRL: usize = 0x3000;
/// Receive Packet Buffer Size, indexed 0-7.
pub const RXPBSIZE: [usize; 8] = [
    0x3C00, 0x3C04, 0x3C08, 0x3C0C, 0x3C10, 0x3C14, 0x3C18, 0x3C1C,
];
/// Good Packets Received Count (clear on read).
pub const GPRC: usize = 0x4074;
/// Good Packets Transmitted Count (clear on read).
pub const GPTC: usize = 0x4080;
/// Good Octets Received Count, low half (clear on read).
pub const GORCL: usize = 0x4088;
/// Good Octets Received Count, high half (clear on read).
pub const GORCH: usize = 0x408C;
/// Good Octets Transmitted Count, low half (clear on read).
pub const GOTCL: usize = 0x4090;
/// Good Octets Transmitted Count, high half (clear on read).
pub const GOTCH: usize = 0x4094;
/// MAC Core Control 0 Register.
pub const HLREG0: usize = 0x4240;
/// Auto-Negotiation Control Register.
pub const AUTOC: usize = 0x42A0;
/// Link Status Register.
pub const LINKS: usize = 0x42A4;
/// DCB Transmit Descriptor Plane Control and Status.
pub const RTTDCS: usize = 0x4900;
/// DMA Tx Control.
pub const DMATXCTL: usize = 0x4A80;
/// Filter Control Register.
pub const FCTRL: usize = 0x5080;
/// DMA Tx TCP Max Allow Size Requests.
pub const DTXMXSZRQ: usize = 0x8100;
/// Transmit Packet Buffer Size, indexed 0-7.
pub const TXPBSIZE: [usize; 8] = [
    0xCC00, 0xCC04, 0xCC08, 0xCC0C, 0xCC10, 0xCC14, 0xCC18, 0xCC1C,
];

/// CTRL: issue a global device reset.
pub const CTRL_RST_MASK: u32 = 1 << 26;

/// EIMC: disable every interrupt cause.
pub const DISABLE_INTERRUPTS: u32 = 0x7FFF_FFFF;

/// EEC: set once hardware has finished auto-reading the EEPROM.
pub const EEC_AUTO_RD: u32 = 1 << 9;

/// RDRXCTL: set once the DMA engine has finished initializing.
pub const RDRXCTL_DMAIDONE: u32 = 1 << 3;

/// AUTOC: link mode = 10G serial (bits 13-15 = 0b011).
pub const AUTOC_LMS_10G_SERIAL: u32 = 0x3 << 13;
/// AUTOC: clear the link-mode-select field before setting it.
pub const AUTOC_LMS_MASK: u32 = 0x7 << 13;
/// AUTOC: PMA/PMD = XAUI (bits 7-8 cleared).
pub const AUTOC_10G_PMA_PMD_XAUI: u32 = 0;
pub const AUTOC_10G_PMA_PMD_MASK: u32 = 0x3 << 7;
/// AUTOC: restart auto-negotiation.
pub const AUTOC_AN_RESTART: u32 = 1 << 12;

/// LINKS: link up.
pub const LINKS_UP: u32 = 1 << 30;
/// LINKS: speed field.
pub const LINKS_SPEED_MASK: u32 = 0x3 << 28;
pub const LINKS_SPEED_SHIFT: u32 = 28;

/// HLREG0: strip the Ethernet CRC on receive.
pub const HLREG0_RXCRCSTRP: u32 = 1 << 1;
/// HLREG0: insert the CRC on transmit.
pub const HLREG0_TXCRCEN: u32 = 1 << 0;
/// HLREG0: pad short transmitted frames.
pub const HLREG0_TXPADEN: u32 = 1 << 10;

/// RDRXCTL: strip the Ethernet CRC on receive (device-wide switch).
pub const RDRXCTL_CRCSTRIP: u32 = 1 << 0;

/// FCTRL: accept broadcast frames.
pub const FCTRL_BAM: u32 = 1 << 10;
/// FCTRL: multicast promiscuous mode.
pub const FCTRL_MPE: u32 = 1 << 8;
/// FCTRL: unicast promiscuous mode.
pub const FCTRL_UPE: u32 = 1 << 9;

/// RXCTRL: receive enable.
pub const RXCTRL_RXEN: u32 = 1 << 0;

/// RTTDCS: DCB arbitration disable (set for non-DCB/non-VT mode).
pub const RTTDCS_ARBDIS: u32 = 1 << 6;
/// DMATXCTL: transmit enable.
pub const DMATXCTL_TE: u32 = 1 << 0;
/// DTXMXSZRQ: effectively unbounded max size request for non-DCB/non-VT mode.
pub const DTXMXSZRQ_UNBOUNDED: u32 = 0xFFFF;

/// RXPBSIZE: 128 KB packet buffer, pool 0.
pub const RXPBSIZE_128KB: u32 = 0x80 << 10;
/// TXPBSIZE: 40 KB packet buffer, pool 0.
pub const TXPBSIZE_40KB: u32 = 0x28 << 10;

/// SRRCTL: advanced, one-buffer descriptor format.
pub const SRRCTL_DESCTYPE_ADV_1BUFFER: u32 = 1 << 25;
/// SRRCTL: drop packets when no descriptor/buffer is available.
pub const SRRCTL_DROP_EN: u32 = 1 << 28;

/// RXDCTL / TXDCTL: queue enable.
pub const QUEUE_ENABLE: u32 = 1 << 25;

/// TXDCTL prefetch threshold, per the component design's fixed thresholds.
pub const TXDCTL_PTHRESH: u32 = 36;
/// TXDCTL host threshold.
pub const TXDCTL_HTHRESH: u32 = 4;
/// TXDCTL write-back threshold.
pub const TXDCTL_WTHRESH: u32 = 8;

/// Combines the three TXDCTL thresholds into the register's bitfield layout:
/// PTHRESH at bits 0-6, HTHRESH at bits 8-14, WTHRESH at bits 16-22.
pub fn txdctl_thresholds() -> u32 {
    TXDCTL_PTHRESH | (TXDCTL_HTHRESH << 8) | (TXDCTL_WTHRESH << 16)
}
