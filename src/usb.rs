//! USB device discovery for the ADB interface (spec.md §4.6).
//!
//! Finding and claiming the right interface is orthogonal to the protocol
//! itself, so this stays a thin wrapper around `rusb`: find the interface
//! advertising adbd's class/subclass/protocol triple, claim it, and hand
//! back bulk read/write primitives for `UsbTransport` to frame packets over.

use crate::error::{AdbError, Result};
use rusb::{
    Device, DeviceHandle, DeviceList, Devices, Direction, GlobalContext, InterfaceDescriptor,
    TransferType, UsbContext,
};
use std::time::Duration;

const ADB_CLASS: u8 = 0xff;
const ADB_SUBCLASS: u8 = 0x42;
const ADB_PROTOCOL: u8 = 0x1;

fn map_err(err: rusb::Error) -> AdbError {
    if err == rusb::Error::Timeout {
        // Distinct from TransportFailed: a timed-out bulk transfer means
        // nothing arrived in time, not that the connection broke. Callers
        // that run a persistent read loop (the dispatcher's reader thread)
        // treat this as "keep waiting" rather than fatal.
        AdbError::Timeout
    } else if err == rusb::Error::Busy {
        AdbError::TransportFailed(
            "device busy, is another adb server already running?".into(),
        )
    } else {
        AdbError::TransportFailed(err.to_string())
    }
}

fn is_adb_interface(desc: &InterfaceDescriptor) -> bool {
    desc.class_code() == ADB_CLASS
        && desc.sub_class_code() == ADB_SUBCLASS
        && desc.protocol_code() == ADB_PROTOCOL
}

/// Enumerate USB devices and return those exposing an ADB interface.
pub fn usb_devices() -> Result<UsbDeviceList> {
    let context = GlobalContext::default();
    Ok(UsbDeviceList(context.devices().map_err(map_err)?))
}

pub struct UsbDeviceList(DeviceList<GlobalContext>);

impl UsbDeviceList {
    pub fn iter(&self) -> UsbDevices {
        UsbDevices(self.0.iter())
    }
}

pub struct UsbDevices<'a>(Devices<'a, GlobalContext>);

impl<'a> Iterator for UsbDevices<'a> {
    type Item = Result<UsbDevice>;

    fn next(&mut self) -> Option<Self::Item> {
        for device in self.0.by_ref() {
            if let Some(res) = UsbDevice::new(device).transpose() {
                return Some(res);
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct UsbDevice {
    handle: DeviceHandle<GlobalContext>,
    serial: String,
    iface: u8,
    setting: u8,
    ep_read: u8,
    ep_write: u8,
}

impl UsbDevice {
    fn new(device: Device<GlobalContext>) -> Result<Option<Self>> {
        let device_desc = device.device_descriptor().map_err(map_err)?;
        let config_desc = match device.active_config_descriptor() {
            Ok(d) => d,
            Err(_) => return Ok(None),
        };
        for iface in config_desc.interfaces() {
            for iface_desc in iface.descriptors() {
                if !is_adb_interface(&iface_desc) {
                    continue;
                }
                let ep_read = iface_desc
                    .endpoint_descriptors()
                    .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.direction() == Direction::In)
                    .map(|ep| ep.address())
                    .ok_or_else(|| AdbError::TransportFailed("no bulk-in endpoint".into()))?;
                let ep_write = iface_desc
                    .endpoint_descriptors()
                    .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.direction() == Direction::Out)
                    .map(|ep| ep.address())
                    .ok_or_else(|| AdbError::TransportFailed("no bulk-out endpoint".into()))?;
                let handle = device.open().map_err(map_err)?;
                let serial = handle
                    .read_serial_number_string_ascii(&device_desc)
                    .map_err(map_err)?;
                return Ok(Some(Self {
                    handle,
                    serial,
                    iface: iface_desc.interface_number(),
                    setting: iface_desc.setting_number(),
                    ep_read,
                    ep_write,
                }));
            }
        }
        Ok(None)
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Open and claim the ADB interface on the device with the given serial.
    pub fn open(serial: &str) -> Result<Self> {
        let mut device = usb_devices()?
            .iter()
            .filter_map(|res| res.ok())
            .find(|dev| dev.serial == serial)
            .ok_or_else(|| AdbError::TransportFailed(format!("device with serial {serial} not found")))?;
        device.handle.reset().map_err(map_err)?;
        device.handle.detach_kernel_driver(device.iface).ok();
        device.handle.claim_interface(device.iface).map_err(map_err)?;
        device
            .handle
            .set_alternate_setting(device.iface, device.setting)
            .map_err(map_err)?;
        Ok(device)
    }

    pub(crate) fn write_bulk(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.handle
            .write_bulk(self.ep_write, buf, timeout)
            .map_err(map_err)
    }

    pub(crate) fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle
            .read_bulk(self.ep_read, buf, timeout)
            .map_err(map_err)
    }
}
