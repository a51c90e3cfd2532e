//! USB wire protocol library
//!
//! This crate defines the bit-exact encodings a host-side USB control plane
//! exchanges with a device: the bit-field codec for request types, endpoint
//! addresses and attributes, the 8-byte control setup packet, standard
//! request builders, and the descriptor value objects decoded from raw
//! descriptor bytes. Nothing here performs I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{DescriptorType, RequestKind, get_descriptor, validate_standard};
//!
//! // GET_DESCRIPTOR(Device), 18 bytes
//! let setup = get_descriptor(DescriptorType::Device, 0, 0, 18);
//! assert_eq!(setup.as_bytes(), &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
//! assert_eq!(setup.request_type().unwrap().kind, RequestKind::Standard);
//! validate_standard(&setup).unwrap();
//! ```
//!
//! # Descriptor Trees
//!
//! ```
//! use protocol::Configuration;
//!
//! let raw = [
//!     0x09, 0x02, 0x12, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
//!     0x09, 0x04, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00,
//! ];
//! let config = Configuration::parse(&raw).unwrap();
//! assert_eq!(config.interfaces().len(), 1);
//! ```

pub mod bits;
pub mod descriptor;
pub mod error;
pub mod request;
pub mod setup;
pub mod tree;
pub mod types;

pub use bits::{
    CLASS_IN_FROM_INTERFACE, CLASS_OUT_TO_INTERFACE, ConfigurationAttributes, EndpointAddress,
    EndpointAttributes, RequestDirection, RequestKind, RequestRecipient, RequestType,
    STANDARD_IN_FROM_DEVICE, STANDARD_OUT_TO_DEVICE, SyncType, TransferType, UsageType,
    VENDOR_IN_FROM_DEVICE, VENDOR_OUT_TO_DEVICE,
};
pub use descriptor::{
    BcdVersion, ConfigurationDescriptor, DescriptorType, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor, encode_string_descriptor, parse_language_ids, parse_string_descriptor,
};
pub use error::{ProtocolError, Result};
pub use request::{
    StandardRequest, get_configuration, get_descriptor, get_interface, get_status,
    set_configuration, set_interface, validate_standard,
};
pub use setup::ControlSetupPacket;
pub use tree::{AlternateSetting, Configuration, DescriptorTree, Interface};
pub use types::{DeviceHandle, DeviceId, DeviceRef, DeviceSpeed, RequestId, UsbError};
