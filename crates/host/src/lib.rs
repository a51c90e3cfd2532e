//! Host-side USB control plane
//!
//! Opens device sessions, activates configurations, claims and releases
//! interfaces (detaching kernel drivers when asked), and runs control
//! transfers through a per-device submission queue. The wire encodings live
//! in the `protocol` crate; this crate adds the stateful parts and the
//! `Transport` seam that connects them to libusb.
//!
//! # Example
//!
//! ```
//! use common::create_event_bus;
//! use host::testing::{MockDevice, MockTransport};
//! use host::usb::{HostServices, Request, SessionSettings};
//! use protocol::{DescriptorType, DeviceRef, get_descriptor};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MockTransport::new());
//! transport.add_device(MockDevice::new(DeviceRef::new(1, 4)).with_string(2, "Widget"));
//!
//! let (bus, _events) = create_event_bus(64);
//! let services = HostServices::new(transport, bus, SessionSettings::default());
//! let ids = services.scan().unwrap();
//!
//! let device = services.device(ids[0]).unwrap();
//! device.open().unwrap();
//! assert_eq!(device.product().unwrap().as_deref(), Some("Widget"));
//!
//! let request = Request::from_setup(&get_descriptor(DescriptorType::Device, 0, 0, 18)).unwrap();
//! assert_eq!(device.submit(&request).unwrap(), 18);
//! services.shutdown();
//! ```

pub mod config;
pub mod testing;
pub mod usb;

pub use config::HostConfig;
pub use usb::{DeviceState, HostServices, Request, RequestState, Transport, UsbDevice};
