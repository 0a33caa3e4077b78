//! PCI device discovery, driver bind/unbind and BAR0 register access.
//!
//! Everything here goes through the sysfs tree the Linux kernel exposes for
//! every PCI function (`/sys/bus/pci/devices/<addr>/...`); there is no
//! direct syscall path to PCI configuration space from userspace.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::str::FromStr;

use log::{info, warn};

/// Root of the sysfs PCI device tree.
pub const SYSFS_PCI_DEVICES_DIR: &str = "/sys/bus/pci/devices";
/// Where a bound device's kernel driver can be told to detach.
pub const IXGBE_DRIVER_BIND_PATH: &str = "/sys/bus/pci/drivers/ixgbe/bind";

const PCI_VENDOR_ID_INTEL: u16 = 0x8086;
const PCI_CLASS_NETWORK_CONTROLLER: u8 = 0x02;

/// Device ids of every Intel 82598/82599/X540/X550 ("ixgbe") function this
/// driver supports, copied verbatim from the kernel driver's own PCI table.
pub const SUPPORTED_DEVICE_IDS: &[u16] = &[
    // 82598
    0x10B6, 0x1508, 0x10C6, 0x10C7, 0x10C8, 0x150B, 0x10DB, 0x10DD, 0x10EC, 0x10F1, 0x10E1,
    0x10F4,
    // 82599
    0x10F7, 0x1514, 0x1517, 0x10F8, 0x10F9, 0x10FB, 0x152A, 0x1529, 0x1507, 0x154D, 0x154A,
    0x1558, 0x1557, 0x10FC, 0x151C, 0x10ED, 0x152E,
    // X540
    0x1528, 0x1515, 0x1530, 0x1560,
    // X550
    0x1563, 0x15D1, 0x15AA, 0x15AB, 0x15AC, 0x15AD, 0x15AE, 0x15A8, 0x15A9, 0x1564, 0x1565,
];

/// Errors raised while discovering or operating on a PCI device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0:?} is not a supported ixgbe device (vendor 0x{1:04x} device 0x{2:04x} class 0x{3:02x})")]
    UnsupportedDevice(PciAddress, u16, u16, u8),

    #[error("permission denied accessing PCI device {0:?}")]
    PermissionDenied(PciAddress),

    #[error("malformed PCI address: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A PCI bus address in `dddd:bb:dd.f` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (domain_bus_dev, function) = s
            .rsplit_once('.')
            .ok_or_else(|| Error::InvalidArgument(s.to_string()))?;
        let mut parts = domain_bus_dev.split(':');
        let domain = parts.next().ok_or_else(|| Error::InvalidArgument(s.to_string()))?;
        let bus = parts.next().ok_or_else(|| Error::InvalidArgument(s.to_string()))?;
        let device = parts.next().ok_or_else(|| Error::InvalidArgument(s.to_string()))?;
        if parts.next().is_some() {
            return Err(Error::InvalidArgument(s.to_string()));
        }

        let parse_hex = |s: &str| u32::from_str_radix(s, 16).map_err(|_| Error::InvalidArgument(s.to_string()));

        Ok(PciAddress {
            domain: parse_hex(domain)? as u16,
            bus: parse_hex(bus)? as u8,
            device: parse_hex(device)? as u8,
            function: parse_hex(function)? as u8,
        })
    }
}

/// BAR0 mapped read/write into this process.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned exclusively by the `Device` that created it.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    fn unmap(&self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }

    /// 32-bit volatile load from `offset` bytes into the mapped BAR.
    pub fn get_register(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len, "register offset {offset} out of range");
        unsafe { ptr::read_volatile(self.ptr.as_ptr().add(offset) as *const u32) }
    }

    /// 32-bit volatile store to `offset` bytes into the mapped BAR.
    pub fn set_register(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len, "register offset {offset} out of range");
        unsafe { ptr::write_volatile(self.ptr.as_ptr().add(offset) as *mut u32, value) };
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw base pointer of the mapping.
    ///
    /// Exists so a driver crate can overlay its own per-queue register
    /// structs directly on BAR0 instead of going through single-register
    /// `get_register`/`set_register` calls for every field.
    ///
    /// # Safety
    /// The caller must not construct any reference that outlives this
    /// `MappedRegion`, and must respect the `len` bound when computing offsets.
    pub unsafe fn base_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.unmap();
    }
}

/// A probed, and possibly bound/mapped, ixgbe PCI function.
pub struct Device {
    addr: PciAddress,
    sysfs_dir: PathBuf,
    vendor_id: u16,
    device_id: u16,
    prev_bind_state: bool,
    bar0: Option<MappedRegion>,
}

impl Device {
    /// Probes the device at `addr` under the default sysfs tree.
    pub fn probe(addr: PciAddress) -> Result<Device, Error> {
        Self::probe_in(Path::new(SYSFS_PCI_DEVICES_DIR), addr)
    }

    /// Probes a device under an arbitrary sysfs-shaped root; used directly by
    /// tests against a fake tree, and by [`probe`](Self::probe) for the real one.
    pub fn probe_in(devices_dir: &Path, addr: PciAddress) -> Result<Device, Error> {
        let sysfs_dir = devices_dir.join(addr.to_string());
        let config_path = sysfs_dir.join("config");

        let mut config = open_sysfs_file(&config_path, addr)?;
        let mut header = [0u8; 16];
        config.read_exact(&mut header)?;

        let vendor_id = u16::from_le_bytes([header[0], header[1]]);
        let device_id = u16::from_le_bytes([header[2], header[3]]);
        let class = header[11];

        let supported = vendor_id == PCI_VENDOR_ID_INTEL
            && class == PCI_CLASS_NETWORK_CONTROLLER
            && SUPPORTED_DEVICE_IDS.contains(&device_id);

        if !supported {
            return Err(Error::UnsupportedDevice(addr, vendor_id, device_id, class));
        }

        let prev_bind_state = sysfs_dir.join("driver").exists();

        info!(
            "probed ixgbe device {addr} (vendor 0x{vendor_id:04x} device 0x{device_id:04x}), bound={prev_bind_state}"
        );

        Ok(Device {
            addr,
            sysfs_dir,
            vendor_id,
            device_id,
            prev_bind_state,
            bar0: None,
        })
    }

    pub fn address(&self) -> PciAddress {
        self.addr
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    /// Detaches the kernel driver currently bound to this device, if any.
    ///
    /// Idempotent: unbinding an already-unbound device is not an error.
    pub fn unbind(&mut self) -> Result<(), Error> {
        let unbind_path = self.sysfs_dir.join("driver").join("unbind");
        if !unbind_path.exists() {
            return Ok(());
        }
        match write_sysfs(&unbind_path, &self.addr.to_string()) {
            Ok(()) => {
                info!("unbound kernel driver from {}", self.addr);
                Ok(())
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Re-attaches this device to the kernel's `ixgbe` driver.
    pub fn bind(&mut self) -> Result<(), Error> {
        write_sysfs(Path::new(IXGBE_DRIVER_BIND_PATH), &self.addr.to_string())?;
        info!("bound {} back to the kernel ixgbe driver", self.addr);
        Ok(())
    }

    /// Maps `resource0` (BAR0) read/write, shared, into this process.
    pub fn map_resource(&mut self) -> Result<&MappedRegion, Error> {
        let resource_path = self.sysfs_dir.join("resource0");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&resource_path)
            .map_err(|e| map_open_error(e, self.addr))?;

        let len = file.metadata()?.len() as usize;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        self.bar0 = Some(MappedRegion {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned a non-null pointer"),
            len,
        });
        info!("mapped BAR0 of {} ({} bytes)", self.addr, len);
        Ok(self.bar0.as_ref().unwrap())
    }

    /// The currently-mapped BAR0 region, if [`map_resource`](Self::map_resource) has run.
    pub fn bar0(&self) -> Option<&MappedRegion> {
        self.bar0.as_ref()
    }

    pub fn get_register(&self, offset: usize) -> u32 {
        self.bar0
            .as_ref()
            .expect("BAR0 is not mapped")
            .get_register(offset)
    }

    pub fn set_register(&self, offset: usize, value: u32) {
        self.bar0
            .as_ref()
            .expect("BAR0 is not mapped")
            .set_register(offset, value)
    }

    /// Unmaps BAR0 and restores the device to whatever bind state `probe`
    /// observed it in.
    pub fn close(mut self) -> Result<(), Error> {
        self.bar0 = None;
        if self.prev_bind_state {
            self.bind()?;
        } else {
            self.unbind()?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.bar0.is_some() {
            warn!(
                "ixgbe device {} dropped without close(); BAR0 unmapped but bind state not restored",
                self.addr
            );
        }
    }
}

fn open_sysfs_file(path: &Path, addr: PciAddress) -> Result<File, Error> {
    File::open(path).map_err(|e| map_open_error(e, addr))
}

fn map_open_error(e: std::io::Error, addr: PciAddress) -> Error {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(addr),
        _ => Error::Io(e),
    }
}

fn write_sysfs(path: &Path, contents: &str) -> Result<(), Error> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_device(dir: &Path, addr: PciAddress, vendor: u16, device: u16, class: u8) {
        let dev_dir = dir.join(addr.to_string());
        fs::create_dir_all(&dev_dir).unwrap();
        let mut header = [0u8; 16];
        header[0..2].copy_from_slice(&vendor.to_le_bytes());
        header[2..4].copy_from_slice(&device.to_le_bytes());
        header[11] = class;
        fs::write(dev_dir.join("config"), header).unwrap();
    }

    #[test]
    fn parses_bus_address() {
        let addr: PciAddress = "0000:00:08.0".parse().unwrap();
        assert_eq!(addr.domain, 0);
        assert_eq!(addr.bus, 0);
        assert_eq!(addr.device, 8);
        assert_eq!(addr.function, 0);
        assert_eq!(addr.to_string(), "0000:00:08.0");
    }

    #[test]
    fn rejects_malformed_address() {
        assert!("not-an-address".parse::<PciAddress>().is_err());
    }

    #[test]
    fn probe_accepts_supported_device() {
        let tmp = tempfile::tempdir().unwrap();
        let addr: PciAddress = "0000:00:08.0".parse().unwrap();
        fake_device(tmp.path(), addr, PCI_VENDOR_ID_INTEL, 0x10FB, PCI_CLASS_NETWORK_CONTROLLER);

        let device = Device::probe_in(tmp.path(), addr).expect("probe should succeed");
        assert_eq!(device.vendor_id(), PCI_VENDOR_ID_INTEL);
        assert_eq!(device.device_id(), 0x10FB);
    }

    #[test]
    fn probe_rejects_unknown_device_id() {
        let tmp = tempfile::tempdir().unwrap();
        let addr: PciAddress = "0000:00:09.0".parse().unwrap();
        fake_device(tmp.path(), addr, PCI_VENDOR_ID_INTEL, 0xFFFF, PCI_CLASS_NETWORK_CONTROLLER);

        let err = Device::probe_in(tmp.path(), addr).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDevice(..)));
    }

    #[test]
    fn probe_rejects_non_network_class() {
        let tmp = tempfile::tempdir().unwrap();
        let addr: PciAddress = "0000:00:0a.0".parse().unwrap();
        fake_device(tmp.path(), addr, PCI_VENDOR_ID_INTEL, 0x10FB, 0x01);

        let err = Device::probe_in(tmp.path(), addr).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDevice(..)));
    }

    #[test]
    fn unbind_is_idempotent_without_driver_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let addr: PciAddress = "0000:00:08.0".parse().unwrap();
        fake_device(tmp.path(), addr, PCI_VENDOR_ID_INTEL, 0x10FB, PCI_CLASS_NETWORK_CONTROLLER);

        let mut device = Device::probe_in(tmp.path(), addr).unwrap();
        assert!(device.unbind().is_ok());
        assert!(device.unbind().is_ok());
    }
}
