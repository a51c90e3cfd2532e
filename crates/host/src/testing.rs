//! Scriptable in-memory transport
//!
//! `MockTransport` stands in for libusb in tests and in `usbctl --mock`. It
//! serves descriptors from an in-memory device table, tracks kernel driver
//! ownership per interface, and records every call in order so tests can
//! assert on sequencing (detach before claim, release before reattach, no
//! overlapping control transfers).

use crate::usb::transport::{DiscoveredDevice, Transport};
use protocol::{
    BcdVersion, ControlSetupPacket, DescriptorType, DeviceDescriptor, DeviceHandle, DeviceRef,
    DeviceSpeed, RequestDirection, StandardRequest, UsbError, encode_string_descriptor,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Enumerate,
    Open(DeviceRef),
    Close(DeviceHandle),
    TransferStart { request: u8, value: u16 },
    TransferEnd { request: u8, value: u16 },
    SetConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SetAlternateSetting { interface: u8, setting: u8 },
    IsKernelDriverActive(u8),
    DetachKernelDriver(u8),
    AttachKernelDriver(u8),
    SupportedLanguages,
    RawDescriptor { kind: DescriptorType, index: u8 },
}

/// An emulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub device_ref: DeviceRef,
    pub parent: Option<DeviceRef>,
    pub port: u8,
    pub speed: DeviceSpeed,
    pub descriptor: DeviceDescriptor,
    /// Full configuration fetches, by descriptor index
    pub configurations: Vec<Vec<u8>>,
    pub languages: Vec<u16>,
    pub strings: HashMap<u8, String>,
    /// Interfaces bound to a kernel driver
    pub kernel_drivers: BTreeSet<u8>,
}

impl MockDevice {
    /// A full-speed vendor device with one configuration and no interfaces
    pub fn new(device_ref: DeviceRef) -> Self {
        Self {
            device_ref,
            parent: None,
            port: 0,
            speed: DeviceSpeed::Full,
            descriptor: DeviceDescriptor {
                usb_version: BcdVersion(0x0200),
                class: 0xFF,
                subclass: 0,
                protocol: 0,
                max_packet_size0: 64,
                vendor_id: 0x1209,
                product_id: 0x0001,
                device_version: BcdVersion(0x0100),
                manufacturer_index: 0,
                product_index: 0,
                serial_number_index: 0,
                num_configurations: 1,
            },
            configurations: vec![configuration_bytes(1, 0)],
            languages: vec![0x0409],
            strings: HashMap::new(),
            kernel_drivers: BTreeSet::new(),
        }
    }

    /// A hub; children point at it through `with_parent`
    pub fn hub(device_ref: DeviceRef) -> Self {
        let mut device = Self::new(device_ref).with_interfaces(1);
        device.descriptor.class = DeviceDescriptor::CLASS_HUB;
        device
    }

    pub fn with_parent(mut self, parent: DeviceRef, port: u8) -> Self {
        self.parent = Some(parent);
        self.port = port;
        self
    }

    pub fn with_speed(mut self, speed: DeviceSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Replace the configuration table with one configuration of `count` interfaces
    pub fn with_interfaces(mut self, count: u8) -> Self {
        self.configurations = vec![configuration_bytes(1, count)];
        self.descriptor.num_configurations = 1;
        self
    }

    pub fn with_configurations(mut self, configurations: Vec<Vec<u8>>) -> Self {
        self.descriptor.num_configurations = configurations.len() as u8;
        self.configurations = configurations;
        self
    }

    /// Add a string; indices 1..=3 also fill the device descriptor fields
    pub fn with_string(mut self, index: u8, value: &str) -> Self {
        match index {
            1 => self.descriptor.manufacturer_index = 1,
            2 => self.descriptor.product_index = 2,
            3 => self.descriptor.serial_number_index = 3,
            _ => {}
        }
        self.strings.insert(index, value.to_string());
        self
    }

    pub fn with_languages(mut self, languages: Vec<u16>) -> Self {
        self.languages = languages;
        self
    }

    pub fn with_kernel_driver(mut self, interface: u8) -> Self {
        self.kernel_drivers.insert(interface);
        self
    }
}

/// Build a configuration fetch with `interfaces` interfaces, each with one
/// alternate setting and a single interrupt IN endpoint
pub fn configuration_bytes(value: u8, interfaces: u8) -> Vec<u8> {
    let mut bytes = vec![0x09, 0x02, 0x00, 0x00, interfaces, value, 0x00, 0x80, 0x32];
    for number in 0..interfaces {
        bytes.extend_from_slice(&[0x09, 0x04, number, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&[0x07, 0x05, 0x80 | (number % 15 + 1), 0x03, 0x08, 0x00, 0x0A]);
    }
    let total = bytes.len() as u16;
    bytes[2..4].copy_from_slice(&total.to_le_bytes());
    bytes
}

#[derive(Default)]
struct State {
    devices: Vec<MockDevice>,
    handles: HashMap<DeviceHandle, DeviceRef>,
    next_handle: u32,
    calls: Vec<Call>,
    /// Artificial latency for control transfers, by wValue
    delays: HashMap<u16, Duration>,
    /// Canned IN data, by (bRequest, wValue)
    responses: HashMap<(u8, u16), Vec<u8>>,
    /// Cap on bytes returned by any IN transfer
    short_read: Option<usize>,
    vanished: BTreeSet<DeviceRef>,
    active_configuration: HashMap<DeviceRef, u8>,
    claimed: BTreeSet<(DeviceRef, u8)>,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<State>,
}

fn stall() -> UsbError {
    UsbError::Platform {
        code: -9,
        message: "Pipe error".to_string(),
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_device(&self, device: MockDevice) {
        self.lock().devices.push(device);
    }

    /// Delay every control transfer whose wValue is `value`
    pub fn set_delay(&self, value: u16, delay: Duration) {
        self.lock().delays.insert(value, delay);
    }

    /// Answer IN transfers for (bRequest, wValue) with `data`
    pub fn set_response(&self, request: u8, value: u16, data: Vec<u8>) {
        self.lock().responses.insert((request, value), data);
    }

    /// Return at most `limit` bytes from every IN transfer
    pub fn set_short_read(&self, limit: Option<usize>) {
        self.lock().short_read = limit;
    }

    /// Simulate an unplug: every later call on the device fails with Disconnected
    pub fn vanish(&self, device: DeviceRef) {
        self.lock().vanished.insert(device);
    }

    pub fn kernel_driver_bound(&self, device: DeviceRef, interface: u8) -> bool {
        self.lock()
            .devices
            .iter()
            .find(|d| d.device_ref == device)
            .is_some_and(|d| d.kernel_drivers.contains(&interface))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// Record a call and resolve the handle to its live device
    fn enter(&self, handle: DeviceHandle, call: Call) -> Result<MockDevice, UsbError> {
        let mut state = self.lock();
        state.calls.push(call);
        let device_ref = *state.handles.get(&handle).ok_or(UsbError::NotOpen)?;
        if state.vanished.contains(&device_ref) {
            return Err(UsbError::Disconnected);
        }
        state
            .devices
            .iter()
            .find(|d| d.device_ref == device_ref)
            .cloned()
            .ok_or(UsbError::Disconnected)
    }

    fn device_mut<'a>(state: &'a mut State, device: DeviceRef) -> Option<&'a mut MockDevice> {
        state.devices.iter_mut().find(|d| d.device_ref == device)
    }

    fn descriptor_bytes(
        device: &MockDevice,
        kind: DescriptorType,
        index: u8,
    ) -> Result<Vec<u8>, UsbError> {
        match kind {
            DescriptorType::Device => Ok(device.descriptor.to_bytes().to_vec()),
            DescriptorType::Configuration => device
                .configurations
                .get(index as usize)
                .cloned()
                .ok_or_else(stall),
            DescriptorType::String if index == 0 => {
                let mut bytes = vec![(2 + device.languages.len() * 2) as u8, 0x03];
                for lang in &device.languages {
                    bytes.extend_from_slice(&lang.to_le_bytes());
                }
                Ok(bytes)
            }
            DescriptorType::String => {
                let value = device.strings.get(&index).ok_or_else(stall)?;
                Ok(encode_string_descriptor(value)?)
            }
            _ => Err(stall()),
        }
    }

    fn answer_in(
        &self,
        device: &MockDevice,
        setup: &ControlSetupPacket,
        buffer: &mut [u8],
    ) -> Result<usize, UsbError> {
        let canned = self
            .lock()
            .responses
            .get(&(setup.request(), setup.value()))
            .cloned();

        let data = match canned {
            Some(data) => data,
            None if setup.request() == StandardRequest::GetDescriptor.code() => {
                let kind = DescriptorType::from_code((setup.value() >> 8) as u8);
                Self::descriptor_bytes(device, kind, setup.value() as u8)?
            }
            None if setup.request() == StandardRequest::GetConfiguration.code() => {
                let active = self
                    .lock()
                    .active_configuration
                    .get(&device.device_ref)
                    .copied()
                    .unwrap_or(0);
                vec![active]
            }
            None => vec![0u8; buffer.len()],
        };

        let mut len = data.len().min(buffer.len());
        if let Some(limit) = self.lock().short_read {
            len = len.min(limit);
        }
        buffer[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }
}

impl Transport for MockTransport {
    fn enumerate(&self) -> Result<Vec<DiscoveredDevice>, UsbError> {
        let mut state = self.lock();
        state.calls.push(Call::Enumerate);
        Ok(state
            .devices
            .iter()
            .filter(|d| !state.vanished.contains(&d.device_ref))
            .map(|d| DiscoveredDevice {
                device_ref: d.device_ref,
                parent: d.parent,
                port: d.port,
                speed: d.speed,
                descriptor: d.descriptor,
            })
            .collect())
    }

    fn open(&self, device: DeviceRef) -> Result<DeviceHandle, UsbError> {
        let mut state = self.lock();
        state.calls.push(Call::Open(device));
        if state.vanished.contains(&device) || !state.devices.iter().any(|d| d.device_ref == device)
        {
            return Err(UsbError::Disconnected);
        }
        state.next_handle += 1;
        let handle = DeviceHandle(state.next_handle);
        state.handles.insert(handle, device);
        Ok(handle)
    }

    fn close(&self, handle: DeviceHandle) {
        let mut state = self.lock();
        state.calls.push(Call::Close(handle));
        if let Some(device) = state.handles.remove(&handle) {
            state.claimed.retain(|(d, _)| *d != device);
        }
    }

    fn control_transfer(
        &self,
        handle: DeviceHandle,
        setup: &ControlSetupPacket,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        let (request, value) = (setup.request(), setup.value());
        let device = self.enter(handle, Call::TransferStart { request, value })?;

        let delay = self.lock().delays.get(&value).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let result = if self.lock().vanished.contains(&device.device_ref) {
            Err(UsbError::Disconnected)
        } else {
            match setup.direction() {
                RequestDirection::DeviceToHost => self.answer_in(&device, setup, buffer),
                RequestDirection::HostToDevice => Ok((setup.length() as usize).min(buffer.len())),
            }
        };

        self.lock().calls.push(Call::TransferEnd { request, value });
        result
    }

    fn set_configuration(&self, handle: DeviceHandle, value: u8) -> Result<(), UsbError> {
        let device = self.enter(handle, Call::SetConfiguration(value))?;
        let exists = value == 0
            || device.configurations.iter().any(|c| c.get(5) == Some(&value));
        if !exists {
            return Err(UsbError::Platform {
                code: -5,
                message: "Entity not found".to_string(),
            });
        }
        self.lock()
            .active_configuration
            .insert(device.device_ref, value);
        Ok(())
    }

    fn claim_interface(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError> {
        let device = self.enter(handle, Call::ClaimInterface(number))?;
        if device.kernel_drivers.contains(&number) {
            return Err(UsbError::Platform {
                code: -6,
                message: "Resource busy".to_string(),
            });
        }
        self.lock().claimed.insert((device.device_ref, number));
        Ok(())
    }

    fn release_interface(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError> {
        let device = self.enter(handle, Call::ReleaseInterface(number))?;
        if !self.lock().claimed.remove(&(device.device_ref, number)) {
            return Err(UsbError::Platform {
                code: -5,
                message: "Entity not found".to_string(),
            });
        }
        Ok(())
    }

    fn set_alternate_setting(
        &self,
        handle: DeviceHandle,
        interface: u8,
        setting: u8,
    ) -> Result<(), UsbError> {
        self.enter(handle, Call::SetAlternateSetting { interface, setting })?;
        Ok(())
    }

    fn is_kernel_driver_active(&self, handle: DeviceHandle, number: u8) -> Result<bool, UsbError> {
        let device = self.enter(handle, Call::IsKernelDriverActive(number))?;
        Ok(device.kernel_drivers.contains(&number))
    }

    fn detach_kernel_driver(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError> {
        let device = self.enter(handle, Call::DetachKernelDriver(number))?;
        let mut state = self.lock();
        let removed = Self::device_mut(&mut state, device.device_ref)
            .is_some_and(|d| d.kernel_drivers.remove(&number));
        if removed {
            Ok(())
        } else {
            Err(UsbError::Platform {
                code: -5,
                message: "Entity not found".to_string(),
            })
        }
    }

    fn attach_kernel_driver(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError> {
        let device = self.enter(handle, Call::AttachKernelDriver(number))?;
        let mut state = self.lock();
        if state.claimed.contains(&(device.device_ref, number)) {
            return Err(UsbError::Platform {
                code: -6,
                message: "Resource busy".to_string(),
            });
        }
        if let Some(d) = Self::device_mut(&mut state, device.device_ref) {
            d.kernel_drivers.insert(number);
        }
        Ok(())
    }

    fn supported_languages(&self, handle: DeviceHandle) -> Result<Vec<u16>, UsbError> {
        let device = self.enter(handle, Call::SupportedLanguages)?;
        Ok(device.languages)
    }

    fn raw_descriptor(
        &self,
        handle: DeviceHandle,
        descriptor_type: DescriptorType,
        index: u8,
        _lang_id: u16,
    ) -> Result<Vec<u8>, UsbError> {
        let device = self.enter(
            handle,
            Call::RawDescriptor {
                kind: descriptor_type,
                index,
            },
        )?;
        Self::descriptor_bytes(&device, descriptor_type, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Configuration, parse_string_descriptor};

    #[test]
    fn test_configuration_bytes_parse() {
        let config = Configuration::parse(&configuration_bytes(2, 3)).unwrap();
        assert_eq!(config.value(), 2);
        assert_eq!(config.interfaces().len(), 3);
    }

    #[test]
    fn test_vanished_device_reports_disconnect() {
        let transport = MockTransport::new();
        let device = DeviceRef::new(1, 4);
        transport.add_device(MockDevice::new(device));
        let handle = transport.open(device).unwrap();

        transport.vanish(device);
        assert_eq!(
            transport.claim_interface(handle, 0),
            Err(UsbError::Disconnected)
        );
        assert!(transport.enumerate().unwrap().is_empty());
        assert_eq!(transport.open(device), Err(UsbError::Disconnected));
    }

    #[test]
    fn test_kernel_driver_blocks_claim() {
        let transport = MockTransport::new();
        let device = DeviceRef::new(1, 4);
        transport.add_device(MockDevice::new(device).with_interfaces(1).with_kernel_driver(0));
        let handle = transport.open(device).unwrap();

        assert!(matches!(
            transport.claim_interface(handle, 0),
            Err(UsbError::Platform { code: -6, .. })
        ));
        transport.detach_kernel_driver(handle, 0).unwrap();
        transport.claim_interface(handle, 0).unwrap();
        assert!(!transport.kernel_driver_bound(device, 0));
    }

    #[test]
    fn test_string_descriptors() {
        let transport = MockTransport::new();
        let device = DeviceRef::new(1, 4);
        transport.add_device(MockDevice::new(device).with_string(2, "Widget"));
        let handle = transport.open(device).unwrap();

        let raw = transport
            .raw_descriptor(handle, DescriptorType::String, 2, 0x0409)
            .unwrap();
        assert_eq!(parse_string_descriptor(&raw).unwrap(), "Widget");
        assert!(
            transport
                .raw_descriptor(handle, DescriptorType::String, 9, 0x0409)
                .is_err()
        );
    }
}
