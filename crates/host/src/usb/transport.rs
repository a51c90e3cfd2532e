//! Transport collaborator
//!
//! The native engine that physically moves bytes across the bus. The control
//! plane never talks to libusb directly; everything goes through this trait
//! so the session logic can run against the rusb-backed implementation or
//! the in-memory mock.
//!
//! Every method may block on native I/O.

use protocol::{
    ControlSetupPacket, DescriptorType, DeviceDescriptor, DeviceHandle, DeviceRef, DeviceSpeed,
    UsbError,
};
use std::time::Duration;

/// A device found during a bus scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub device_ref: DeviceRef,
    /// The hub this device hangs off (None for root hubs)
    pub parent: Option<DeviceRef>,
    pub port: u8,
    pub speed: DeviceSpeed,
    pub descriptor: DeviceDescriptor,
}

pub trait Transport: Send + Sync {
    /// List devices currently on the bus
    fn enumerate(&self) -> Result<Vec<DiscoveredDevice>, UsbError>;

    fn open(&self, device: DeviceRef) -> Result<DeviceHandle, UsbError>;

    /// Release a handle; never fails, unknown handles are ignored
    fn close(&self, handle: DeviceHandle);

    /// Run a control transfer and return the number of bytes moved
    ///
    /// For IN transfers `buffer` receives the data stage; for OUT transfers
    /// it supplies it.
    fn control_transfer(
        &self,
        handle: DeviceHandle,
        setup: &ControlSetupPacket,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn set_configuration(&self, handle: DeviceHandle, value: u8) -> Result<(), UsbError>;

    fn claim_interface(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError>;

    fn release_interface(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError>;

    fn set_alternate_setting(
        &self,
        handle: DeviceHandle,
        interface: u8,
        setting: u8,
    ) -> Result<(), UsbError>;

    fn is_kernel_driver_active(&self, handle: DeviceHandle, number: u8) -> Result<bool, UsbError>;

    fn detach_kernel_driver(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError>;

    fn attach_kernel_driver(&self, handle: DeviceHandle, number: u8) -> Result<(), UsbError>;

    /// LANGIDs from string descriptor zero
    fn supported_languages(&self, handle: DeviceHandle) -> Result<Vec<u16>, UsbError>;

    /// Raw bytes of one descriptor fetch (a configuration includes its children)
    fn raw_descriptor(
        &self,
        handle: DeviceHandle,
        descriptor_type: DescriptorType,
        index: u8,
        lang_id: u16,
    ) -> Result<Vec<u8>, UsbError>;
}
