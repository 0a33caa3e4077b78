//! Advanced one-buffer receive and transmit descriptors.
//!
//! Both descriptor types are 16 bytes and reuse the same two 64-bit slots
//! for the driver-to-NIC ("read") and NIC-to-driver ("write-back") views;
//! which interpretation applies depends only on whether the NIC has
//! processed the slot yet (signalled by the Descriptor Done bit), never on
//! a separate discriminant. There is one receive descriptor per receive
//! buffer and one transmit descriptor per transmit buffer; multi-segment
//! (non-EOP) packets are not supported.

use bit_field::BitField;
use volatile::Volatile;

use crate::PhysicalAddress;

/// Rx Status: Descriptor Done.
pub const RX_STATUS_DD: u64 = 1 << 0;
/// Rx Status: End of Packet.
pub const RX_STATUS_EOP: u64 = 1 << 1;

/// Tx Command: End of Packet. `cmd_type_length` bits 0-15 also carry the
/// descriptor's data length, so every command bit lives at bit 24 or above.
pub const TX_CMD_EOP: u32 = 1 << 24;
/// Tx Command: Insert FCS.
pub const TX_CMD_IFCS: u32 = 1 << 25;
/// Tx Command: Report Status.
pub const TX_CMD_RS: u32 = 1 << 27;
/// Tx Command: Descriptor Extension (advanced format).
pub const TX_CMD_DEXT: u32 = 1 << 29;
/// Tx Descriptor Type: Advanced, data descriptor.
pub const TX_DTYP_ADV_DATA: u32 = 0x3 << 20;
/// Tx Status: Descriptor Done.
pub const TX_STATUS_DD: u32 = 1 << 0;
/// Bit position of the payload length field in `olinfo_status`.
pub const TX_PAYLEN_SHIFT: u32 = 14;

/// A receive descriptor, shared by every Intel NIC driver in this codebase.
///
/// Implementors clear status on `init`, hand out the physical address the
/// NIC should write incoming data to, and report back the write-back fields
/// once the NIC sets the Descriptor Done bit.
pub trait RxDescriptor {
    /// Initializes a fresh descriptor: clears status and sets the buffer address.
    fn init(&mut self, packet_buffer_address: PhysicalAddress);

    /// Rewrites the buffer address a descriptor will place a future packet into.
    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress);

    /// Clears the write-back status fields so the descriptor can be reused.
    fn reset_status(&mut self);

    /// True once the NIC has written a packet into this descriptor's buffer.
    fn descriptor_done(&self) -> bool;

    /// True if this descriptor's buffer is the last (and only) segment of its packet.
    fn end_of_packet(&self) -> bool;

    /// Length, in bytes, of the packet data the NIC wrote into the buffer.
    fn length(&self) -> u16;
}

/// A transmit descriptor, shared by every Intel NIC driver in this codebase.
pub trait TxDescriptor {
    /// Clears a descriptor back to its pre-use state.
    fn init(&mut self);

    /// Programs the descriptor to transmit `length` bytes starting at `buffer_address`.
    fn send(&mut self, buffer_address: PhysicalAddress, length: u16);

    /// True once the NIC has transmitted the buffer and written the completion back.
    fn descriptor_done(&self) -> bool;
}

/// Advanced one-buffer receive descriptor (section 7.1.6 of the 82599 datasheet).
///
/// Before the NIC touches it, `packet_buffer_address` holds the physical
/// address of the receive buffer and `header_buffer_address` is zero
/// (header splitting is never enabled by this driver). After the NIC writes
/// it back, the same 16 bytes are reinterpreted as status/length fields.
#[derive(Debug)]
#[repr(C)]
pub struct AdvancedRxDescriptor {
    packet_buffer_address: Volatile<u64>,
    header_buffer_address: Volatile<u64>,
}

impl AdvancedRxDescriptor {
    fn ext_status(&self) -> u64 {
        self.header_buffer_address.read().get_bits(0..19)
    }

    fn pkt_len(&self) -> u64 {
        self.header_buffer_address.read().get_bits(32..47)
    }
}

impl RxDescriptor for AdvancedRxDescriptor {
    fn init(&mut self, packet_buffer_address: PhysicalAddress) {
        self.packet_buffer_address.write(packet_buffer_address.value());
        self.header_buffer_address.write(0);
    }

    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress) {
        self.packet_buffer_address.write(packet_buffer_address.value());
    }

    fn reset_status(&mut self) {
        self.header_buffer_address.write(0);
    }

    fn descriptor_done(&self) -> bool {
        (self.ext_status() & RX_STATUS_DD) != 0
    }

    fn end_of_packet(&self) -> bool {
        (self.ext_status() & RX_STATUS_EOP) != 0
    }

    fn length(&self) -> u16 {
        self.pkt_len() as u16
    }
}

/// Advanced transmit data descriptor (section 7.2.3 of the 82599 datasheet).
///
/// The driver writes `buffer_address`, `cmd_type_length` (flags OR'd with
/// the payload length) and `olinfo_status` (payload length shifted into
/// place); the NIC writes the Descriptor Done bit back into the low bits of
/// `olinfo_status` once the buffer has been transmitted.
#[derive(Debug)]
#[repr(C)]
pub struct AdvancedTxDescriptor {
    buffer_address: Volatile<u64>,
    cmd_type_length: Volatile<u32>,
    olinfo_status: Volatile<u32>,
}

impl TxDescriptor for AdvancedTxDescriptor {
    fn init(&mut self) {
        self.buffer_address.write(0);
        self.cmd_type_length.write(0);
        self.olinfo_status.write(0);
    }

    fn send(&mut self, buffer_address: PhysicalAddress, length: u16) {
        self.buffer_address.write(buffer_address.value());
        self.cmd_type_length.write(
            TX_CMD_EOP | TX_CMD_RS | TX_CMD_IFCS | TX_CMD_DEXT | TX_DTYP_ADV_DATA | length as u32,
        );
        self.olinfo_status.write((length as u32) << TX_PAYLEN_SHIFT);
    }

    fn descriptor_done(&self) -> bool {
        (self.olinfo_status.read() & TX_STATUS_DD) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_rx() -> AdvancedRxDescriptor {
        AdvancedRxDescriptor {
            packet_buffer_address: Volatile::new(0),
            header_buffer_address: Volatile::new(0),
        }
    }

    fn zeroed_tx() -> AdvancedTxDescriptor {
        AdvancedTxDescriptor {
            buffer_address: Volatile::new(0),
            cmd_type_length: Volatile::new(0),
            olinfo_status: Volatile::new(0),
        }
    }

    #[test]
    fn rx_init_sets_address_and_clears_header() {
        let mut desc = zeroed_rx();
        desc.init(PhysicalAddress::new(0x1000));
        assert_eq!(desc.packet_buffer_address.read(), 0x1000);
        assert_eq!(desc.header_buffer_address.read(), 0);
        assert!(!desc.descriptor_done());
    }

    #[test]
    fn rx_writeback_reports_done_eop_and_length() {
        let mut desc = zeroed_rx();
        let mut header: u64 = 0;
        header.set_bits(0..19, RX_STATUS_DD | RX_STATUS_EOP);
        header.set_bits(32..47, 128);
        desc.header_buffer_address.write(header);

        assert!(desc.descriptor_done());
        assert!(desc.end_of_packet());
        assert_eq!(desc.length(), 128);
    }

    #[test]
    fn rx_without_eop_is_not_end_of_packet() {
        let mut desc = zeroed_rx();
        let mut header: u64 = 0;
        header.set_bits(0..19, RX_STATUS_DD);
        desc.header_buffer_address.write(header);

        assert!(desc.descriptor_done());
        assert!(!desc.end_of_packet());
    }

    #[test]
    fn rx_reset_status_clears_done() {
        let mut desc = zeroed_rx();
        let mut header: u64 = 0;
        header.set_bits(0..19, RX_STATUS_DD);
        desc.header_buffer_address.write(header);
        assert!(desc.descriptor_done());

        desc.reset_status();
        assert!(!desc.descriptor_done());
    }

    #[test]
    fn tx_send_encodes_length_and_flags() {
        let mut desc = zeroed_tx();
        desc.send(PhysicalAddress::new(0x2000), 60);
        assert_eq!(desc.buffer_address.read(), 0x2000);
        assert_eq!(desc.cmd_type_length.read() & 0xFFFF, 60);
        assert_eq!(desc.olinfo_status.read() >> TX_PAYLEN_SHIFT, 60);
        assert!(!desc.descriptor_done());
    }

    #[test]
    fn tx_writeback_sets_dd() {
        let mut desc = zeroed_tx();
        desc.send(PhysicalAddress::new(0x2000), 60);
        let len_bits = desc.olinfo_status.read();
        desc.olinfo_status.write(len_bits | TX_STATUS_DD);
        assert!(desc.descriptor_done());
    }
}
