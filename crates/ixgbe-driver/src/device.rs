//! Device lifecycle: bind, reset, bring-up, and the public queue API.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};

use ixgbe_buffers::BufferPool;
use ixgbe_pci::{Device as PciDevice, PciAddress};

use crate::error::Error;
use crate::regs;
use crate::rx::RxQueue;
use crate::tx::TxQueue;

/// How long [`Device::wait_for_link`] polls before giving up.
const LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of rx/tx queues to bring up and the descriptor ring depth for each.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub num_rx_queues: u8,
    pub num_tx_queues: u8,
    pub rx_ring_size: u16,
    pub tx_ring_size: u16,
    pub rx_pool_capacity: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            num_rx_queues: 1,
            num_tx_queues: 1,
            rx_ring_size: 512,
            tx_ring_size: 512,
            rx_pool_capacity: 4096,
        }
    }
}

/// Clear-on-read hardware packet/byte counters, accumulated across calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// An opened, reset, and initialized ixgbe NIC: its BAR0 mapping plus the
/// receive and transmit queues configured against it.
pub struct Device {
    pci: PciDevice,
    rx_queues: Vec<RxQueue>,
    tx_queues: Vec<TxQueue>,
    stats: DeviceStats,
}

impl Device {
    /// Probes, unbinds from the kernel, maps BAR0, and brings the device up.
    pub fn open(addr: PciAddress, config: DeviceConfig, rx_pool: Arc<Mutex<BufferPool>>) -> Result<Self, Error> {
        let mut pci = PciDevice::probe(addr)?;
        pci.unbind()?;
        pci.map_resource()?;

        let mut device = Device {
            pci,
            rx_queues: Vec::new(),
            tx_queues: Vec::new(),
            stats: DeviceStats::default(),
        };
        device.reset_and_init(config, rx_pool)?;
        Ok(device)
    }

    /// Runs the documented bring-up sequence: disable interrupts, reset,
    /// wait for EEPROM auto-read and DMA init, configure link, packet
    /// buffers and filtering, bring up every queue, then enable rx/tx.
    fn reset_and_init(&mut self, config: DeviceConfig, rx_pool: Arc<Mutex<BufferPool>>) -> Result<(), Error> {
        self.pci.set_register(regs::EIMC, regs::DISABLE_INTERRUPTS);

        self.pci.set_register(
            regs::CTRL,
            self.pci.get_register(regs::CTRL) | regs::CTRL_RST_MASK,
        );
        while self.pci.get_register(regs::CTRL) & regs::CTRL_RST_MASK != 0 {
            std::hint::spin_loop();
        }
        // The device needs a short settle time after reset before its
        // registers are reliably readable again.
        std::thread::sleep(Duration::from_millis(10));

        self.pci.set_register(regs::EIMC, regs::DISABLE_INTERRUPTS);

        while self.pci.get_register(regs::EEC) & regs::EEC_AUTO_RD == 0 {
            std::hint::spin_loop();
        }
        while self.pci.get_register(regs::RDRXCTL) & regs::RDRXCTL_DMAIDONE == 0 {
            std::hint::spin_loop();
        }

        let autoc = self.pci.get_register(regs::AUTOC);
        let autoc = (autoc & !regs::AUTOC_LMS_MASK) | regs::AUTOC_LMS_10G_SERIAL;
        let autoc = (autoc & !regs::AUTOC_10G_PMA_PMD_MASK) | regs::AUTOC_10G_PMA_PMD_XAUI;
        self.pci.set_register(regs::AUTOC, autoc);
        self.pci
            .set_register(regs::AUTOC, autoc | regs::AUTOC_AN_RESTART);

        self.pci.set_register(
            regs::HLREG0,
            self.pci.get_register(regs::HLREG0)
                | regs::HLREG0_TXCRCEN
                | regs::HLREG0_TXPADEN
                | regs::HLREG0_RXCRCSTRP,
        );
        self.pci.set_register(
            regs::RDRXCTL,
            self.pci.get_register(regs::RDRXCTL) | regs::RDRXCTL_CRCSTRIP,
        );

        self.pci.set_register(regs::RXPBSIZE[0], regs::RXPBSIZE_128KB);
        for i in 1..8 {
            self.pci.set_register(regs::RXPBSIZE[i], 0);
        }
        self.pci.set_register(regs::TXPBSIZE[0], regs::TXPBSIZE_40KB);
        for i in 1..8 {
            self.pci.set_register(regs::TXPBSIZE[i], 0);
        }

        self.pci.set_register(
            regs::FCTRL,
            self.pci.get_register(regs::FCTRL) | regs::FCTRL_BAM,
        );

        self.pci.set_register(
            regs::RTTDCS,
            self.pci.get_register(regs::RTTDCS) | regs::RTTDCS_ARBDIS,
        );
        self.pci.set_register(regs::DTXMXSZRQ, regs::DTXMXSZRQ_UNBOUNDED);
        self.pci.set_register(
            regs::RTTDCS,
            self.pci.get_register(regs::RTTDCS) & !regs::RTTDCS_ARBDIS,
        );

        if config.num_rx_queues as usize > regs::MAX_QUEUES_PER_DIRECTION as usize
            || config.num_tx_queues as usize > regs::MAX_QUEUES_PER_DIRECTION as usize
        {
            return Err(Error::InvalidArgument(format!(
                "at most {} queues are supported per direction (requested {} rx, {} tx)",
                regs::MAX_QUEUES_PER_DIRECTION,
                config.num_rx_queues,
                config.num_tx_queues,
            )));
        }

        let base_ptr = self.bar0_base_ptr();

        for i in 0..config.num_rx_queues {
            let queue = unsafe {
                RxQueue::init(i, base_ptr, config.rx_ring_size, Arc::clone(&rx_pool))?
            };
            self.rx_queues.push(queue);
        }
        for i in 0..config.num_tx_queues {
            let queue = unsafe { TxQueue::init(i, base_ptr, config.tx_ring_size)? };
            self.tx_queues.push(queue);
        }

        self.pci.set_register(
            regs::DMATXCTL,
            self.pci.get_register(regs::DMATXCTL) | regs::DMATXCTL_TE,
        );
        self.pci.set_register(
            regs::RXCTRL,
            self.pci.get_register(regs::RXCTRL) | regs::RXCTRL_RXEN,
        );

        match self.wait_for_link() {
            Ok(speed) => info!("link up, speed field {speed:#x}"),
            Err(Error::LinkTimeout) => warn!("link did not come up within {LINK_TIMEOUT:?}; proceeding with speed 0"),
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Returns the BAR0 base pointer queue engines compute their register
    /// windows from. Valid as long as `self.pci`'s mapping stays alive.
    fn bar0_base_ptr(&self) -> *mut u8 {
        unsafe {
            self.pci
                .bar0()
                .expect("BAR0 is mapped for the lifetime of an open Device")
                .base_ptr()
        }
    }

    /// Polls LINKS until the up bit is set or `LINK_TIMEOUT` elapses.
    ///
    /// Returns the raw speed field on success. Callers that want bring-up to
    /// proceed even without link (as [`reset_and_init`](Self::reset_and_init)
    /// does) should match on [`Error::LinkTimeout`] specifically.
    pub fn wait_for_link(&self) -> Result<u32, Error> {
        let deadline = Instant::now() + LINK_TIMEOUT;
        loop {
            let links = self.pci.get_register(regs::LINKS);
            if links & regs::LINKS_UP != 0 {
                return Ok((links & regs::LINKS_SPEED_MASK) >> regs::LINKS_SPEED_SHIFT);
            }
            if Instant::now() >= deadline {
                return Err(Error::LinkTimeout);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn set_promiscuous(&mut self, enabled: bool) {
        let fctrl = self.pci.get_register(regs::FCTRL);
        let fctrl = if enabled {
            fctrl | regs::FCTRL_MPE | regs::FCTRL_UPE
        } else {
            fctrl & !(regs::FCTRL_MPE | regs::FCTRL_UPE)
        };
        self.pci.set_register(regs::FCTRL, fctrl);
    }

    pub fn rx_queue(&mut self, index: usize) -> Option<&mut RxQueue> {
        self.rx_queues.get_mut(index)
    }

    pub fn tx_queue(&mut self, index: usize) -> Option<&mut TxQueue> {
        self.tx_queues.get_mut(index)
    }

    /// Reads every clear-on-read hardware counter and accumulates it into
    /// this device's running totals.
    pub fn read_stats(&mut self) -> DeviceStats {
        let rx_packets = self.pci.get_register(regs::GPRC) as u64;
        let tx_packets = self.pci.get_register(regs::GPTC) as u64;
        let rx_bytes = (self.pci.get_register(regs::GORCL) as u64)
            | ((self.pci.get_register(regs::GORCH) as u64) << 32);
        let tx_bytes = (self.pci.get_register(regs::GOTCL) as u64)
            | ((self.pci.get_register(regs::GOTCH) as u64) << 32);

        self.stats.rx_packets += rx_packets;
        self.stats.tx_packets += tx_packets;
        self.stats.rx_bytes += rx_bytes;
        self.stats.tx_bytes += tx_bytes;
        self.stats
    }

    /// Tears every queue's DMA memory down, then restores the device's prior
    /// kernel-driver bind state.
    pub fn close(mut self) -> Result<(), Error> {
        for queue in self.rx_queues.drain(..) {
            queue.close();
        }
        for queue in self.tx_queues.drain(..) {
            queue.close();
        }
        self.pci.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_keeps_one_queue_each_direction() {
        let config = DeviceConfig::default();
        assert_eq!(config.num_rx_queues, 1);
        assert_eq!(config.num_tx_queues, 1);
        assert!(config.rx_ring_size.is_power_of_two());
        assert!(config.tx_ring_size.is_power_of_two());
    }

    #[test]
    fn stats_default_to_zero() {
        let stats = DeviceStats::default();
        assert_eq!(stats.rx_packets, 0);
        assert_eq!(stats.tx_bytes, 0);
    }

    #[test]
    fn excessive_queue_count_is_a_plain_error_not_a_panic() {
        let config = DeviceConfig {
            num_rx_queues: regs::MAX_QUEUES_PER_DIRECTION + 1,
            ..DeviceConfig::default()
        };
        assert!(
            config.num_rx_queues as usize > regs::MAX_QUEUES_PER_DIRECTION as usize,
            "test setup must actually exceed the limit"
        );
    }
}
