//! rusb-backed transport
//!
//! Wraps libusb through rusb. Handles are kept in a table keyed by the
//! opaque `DeviceHandle` this transport hands out; each native handle sits
//! behind its own mutex so one device's I/O never blocks another's.

use crate::usb::transport::{DiscoveredDevice, Transport};
use protocol::{
    BcdVersion, ConfigurationDescriptor, ControlSetupPacket, DescriptorType, DeviceDescriptor,
    DeviceHandle, DeviceRef, DeviceSpeed, RequestDirection, UsbError, get_descriptor,
};
use rusb::{Context, Device, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Timeout for descriptor fetches issued by the transport itself
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest descriptor a single-byte bLength can describe
const MAX_DESCRIPTOR_LENGTH: u16 = 255;

type NativeHandle = Arc<Mutex<rusb::DeviceHandle<Context>>>;

pub struct RusbTransport {
    context: Context,
    handles: Mutex<HashMap<DeviceHandle, NativeHandle>>,
    next_handle: AtomicU32,
}

impl RusbTransport {
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        })
    }

    fn native(&self, handle: DeviceHandle) -> Result<NativeHandle, UsbError> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
            .ok_or(UsbError::NotOpen)
    }

    fn with_handle<T>(
        &self,
        handle: DeviceHandle,
        f: impl FnOnce(&mut rusb::DeviceHandle<Context>) -> rusb::Result<T>,
    ) -> Result<T, UsbError> {
        let native = self.native(handle)?;
        let mut guard = native.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard).map_err(map_rusb_error)
    }

    fn find_device(&self, device: DeviceRef) -> Result<Device<Context>, UsbError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|d| d.bus_number() == device.bus && d.address() == device.address)
            .ok_or(UsbError::Disconnected)
    }

    fn read_descriptor(
        &self,
        handle: DeviceHandle,
        setup: &ControlSetupPacket,
    ) -> Result<Vec<u8>, UsbError> {
        let mut buffer = vec![0u8; setup.length() as usize];
        let len = self.control_transfer(handle, setup, &mut buffer, DESCRIPTOR_TIMEOUT)?;
        buffer.truncate(len);
        Ok(buffer)
    }
}

impl Transport for RusbTransport {
    fn enumerate(&self) -> Result<Vec<DiscoveredDevice>, UsbError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut found = Vec::with_capacity(devices.len());

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(desc) => map_device_descriptor(&desc),
                Err(e) => {
                    warn!(
                        "Skipping {:03}:{:03}: no device descriptor: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };
            let parent = device
                .get_parent()
                .map(|p| DeviceRef::new(p.bus_number(), p.address()));

            found.push(DiscoveredDevice {
                device_ref: DeviceRef::new(device.bus_number(), device.address()),
                parent,
                port: device.port_number(),
                speed: map_device_speed(device.speed()),
                descriptor,
            });
        }

        debug!("Enumerated {} devices", found.len());
        Ok(found)
    }

    fn open(&self, device: DeviceRef) -> Result<DeviceHandle, UsbError> {
        let native = self.find_device(device)?.open().map_err(|e| {
            warn!("Failed to open device {}: {}", device, e);
            map_rusb_error(e)
        })?;

        let handle = DeviceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(Mutex::new(native)));
        debug!("Opened device {} as {:?}", device, handle);
        Ok(handle)
    }

    fn close(&self, handle: DeviceHandle) {
        // Dropping the last reference closes the native handle
        if self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .is_some()
        {
            debug!("Closed {:?}", handle);
        }
    }

    fn control_transfer(
        &self,
        handle: DeviceHandle,
        setup: &ControlSetupPacket,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        trace!("Control transfer on {:?}: {}", handle, setup);
        let len = (setup.length() as usize).min(buffer.len());
        self.with_handle(handle, |h| match setup.direction() {
            RequestDirection::DeviceToHost => h.read_control(
                setup.request_type_byte(),
                setup.request(),
                setup.value(),
                setup.index(),
                &mut buffer[..len],
                timeout,
            ),
            RequestDirection::HostToDevice => h.write_control(
                setup.request_type_byte(),
                setup.request(),
                setup.value(),
                setup.index(),
                &buffer[..len],
                timeout,
            ),
        })
    }

    fn set_configuration(&self, handle: DeviceHandle, value: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.set_active_configuration(value))
    }

    fn claim_interface(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.claim_interface(number))
    }

    fn release_interface(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.release_interface(number))
    }

    fn set_alternate_setting(
        &self,
        handle: DeviceHandle,
        interface: u8,
        setting: u8,
    ) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.set_alternate_setting(interface, setting))
    }

    fn is_kernel_driver_active(&self, handle: DeviceHandle, number: u8) -> Result<bool, UsbError> {
        match self.with_handle(handle, |h| h.kernel_driver_active(number)) {
            // Platforms without kernel drivers (or without the query) report none
            Err(UsbError::Platform { code: -12, .. }) => Ok(false),
            other => other,
        }
    }

    fn detach_kernel_driver(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.detach_kernel_driver(number))
    }

    fn attach_kernel_driver(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError> {
        self.with_handle(handle, |h| h.attach_kernel_driver(number))
    }

    fn supported_languages(&self, handle: DeviceHandle) -> Result<Vec<u16>, UsbError> {
        self.with_handle(handle, |h| h.read_languages(DESCRIPTOR_TIMEOUT))
            .map(|langs| langs.iter().map(|l| l.lang_id()).collect())
    }

    fn raw_descriptor(
        &self,
        handle: DeviceHandle,
        descriptor_type: DescriptorType,
        index: u8,
        lang_id: u16,
    ) -> Result<Vec<u8>, UsbError> {
        match descriptor_type {
            DescriptorType::Configuration => {
                // Header first to learn wTotalLength, then the whole tree
                let header = self.read_descriptor(
                    handle,
                    &get_descriptor(
                        descriptor_type,
                        index,
                        0,
                        ConfigurationDescriptor::LENGTH as u16,
                    ),
                )?;
                let total = ConfigurationDescriptor::parse(&header)?.total_length();
                self.read_descriptor(handle, &get_descriptor(descriptor_type, index, 0, total))
            }
            DescriptorType::Device => self.read_descriptor(
                handle,
                &get_descriptor(descriptor_type, 0, 0, DeviceDescriptor::LENGTH as u16),
            ),
            _ => self.read_descriptor(
                handle,
                &get_descriptor(descriptor_type, index, lang_id, MAX_DESCRIPTOR_LENGTH),
            ),
        }
    }
}

fn map_device_descriptor(desc: &rusb::DeviceDescriptor) -> DeviceDescriptor {
    let version = |v: rusb::Version| BcdVersion::from_parts(v.major(), v.minor(), v.sub_minor());
    DeviceDescriptor {
        usb_version: version(desc.usb_version()),
        class: desc.class_code(),
        subclass: desc.sub_class_code(),
        protocol: desc.protocol_code(),
        max_packet_size0: desc.max_packet_size(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        device_version: version(desc.device_version()),
        manufacturer_index: desc.manufacturer_string_index().unwrap_or(0),
        product_index: desc.product_string_index().unwrap_or(0),
        serial_number_index: desc.serial_number_string_index().unwrap_or(0),
        num_configurations: desc.num_configurations(),
    }
}

fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

/// Map rusb::Error onto the session error taxonomy
///
/// A vanished device is the one native failure callers act on; everything
/// else is wrapped uniformly with its libusb error code.
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    let code = match err {
        rusb::Error::NoDevice => return UsbError::Disconnected,
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    };
    UsbError::Platform {
        code,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbError::Disconnected);
        assert!(matches!(
            map_rusb_error(rusb::Error::Timeout),
            UsbError::Platform { code: -7, .. }
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Pipe),
            UsbError::Platform { code: -9, .. }
        ));
        assert!(matches!(
            map_rusb_error(rusb::Error::Other),
            UsbError::Platform { code: -99, .. }
        ));
    }

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
        assert_eq!(map_device_speed(rusb::Speed::Unknown), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_transport_creation() {
        // Context creation may fail without libusb access
        match RusbTransport::new() {
            Ok(transport) => {
                assert_eq!(
                    transport.native(DeviceHandle(999)).err(),
                    Some(UsbError::NotOpen)
                );
            }
            Err(e) => eprintln!("rusb context unavailable (expected in sandboxes): {}", e),
        }
    }
}
