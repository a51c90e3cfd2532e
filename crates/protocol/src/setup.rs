//! Control setup packet
//!
//! The fixed 8-byte header that begins every control transfer:
//!
//! ```text
//! [0] bmRequestType  [1] bRequest  [2..4) wValue  [4..6) wIndex  [6..8) wLength
//! ```
//!
//! Multi-byte fields are little-endian. Two packets are equal iff all eight
//! bytes match.

use crate::bits::{RequestDirection, RequestType};
use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Serialized setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlSetupPacket {
    bytes: [u8; ControlSetupPacket::SIZE],
}

impl ControlSetupPacket {
    pub const SIZE: usize = 8;

    /// Build a packet from already-validated fields
    ///
    /// # Example
    /// ```
    /// use protocol::{ControlSetupPacket, STANDARD_IN_FROM_DEVICE};
    ///
    /// let setup = ControlSetupPacket::new(STANDARD_IN_FROM_DEVICE, 0x06, 0x0100, 0, 18);
    /// assert_eq!(setup.as_bytes(), &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
    /// ```
    pub fn new(request_type: RequestType, request: u8, value: u16, index: u16, length: u16) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = request_type.to_byte();
        bytes[1] = request;
        LittleEndian::write_u16(&mut bytes[2..4], value);
        LittleEndian::write_u16(&mut bytes[4..6], index);
        LittleEndian::write_u16(&mut bytes[6..8], length);
        Self { bytes }
    }

    /// Build a packet whose wLength must agree with a data stage buffer
    ///
    /// IN requests must declare exactly the buffer capacity. OUT requests
    /// declare either the buffer capacity or zero (no data stage).
    pub fn for_buffer(
        request_type: RequestType,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        capacity: usize,
    ) -> Result<Self> {
        let setup = Self::new(request_type, request, value, index, length);
        setup.validate_data_stage(capacity)?;
        Ok(setup)
    }

    /// Wrap eight raw bytes without interpretation
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self { bytes }
    }

    /// Read a packet from the front of a byte slice
    pub fn parse(data: &[u8]) -> Result<Self> {
        let bytes: [u8; Self::SIZE] = data
            .get(..Self::SIZE)
            .and_then(|head| head.try_into().ok())
            .ok_or(ProtocolError::BufferTooSmall {
                needed: Self::SIZE,
                available: data.len(),
            })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.bytes
    }

    pub fn request_type_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// Decode bmRequestType; fails for undefined recipients
    pub fn request_type(&self) -> Result<RequestType> {
        RequestType::from_byte(self.bytes[0])
    }

    pub fn direction(&self) -> RequestDirection {
        RequestDirection::from_bits(self.bytes[0])
    }

    pub fn request(&self) -> u8 {
        self.bytes[1]
    }

    pub fn value(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[2..4])
    }

    pub fn index(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[4..6])
    }

    pub fn length(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[6..8])
    }

    /// Check wLength against the capacity of the data stage buffer
    pub fn validate_data_stage(&self, capacity: usize) -> Result<()> {
        if capacity > u16::MAX as usize {
            return Err(ProtocolError::DataStageTooLong(capacity));
        }
        let declared = self.length() as usize;
        let ok = match self.direction() {
            RequestDirection::DeviceToHost => declared == capacity,
            RequestDirection::HostToDevice => declared == capacity || declared == 0,
        };
        if ok {
            Ok(())
        } else {
            Err(ProtocolError::LengthMismatch { declared, capacity })
        }
    }
}

impl From<ControlSetupPacket> for [u8; ControlSetupPacket::SIZE] {
    fn from(setup: ControlSetupPacket) -> Self {
        setup.bytes
    }
}

impl fmt::Display for ControlSetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bmRequestType={:#04x} bRequest={:#04x} wValue={:#06x} wIndex={:#06x} wLength={}",
            self.request_type_byte(),
            self.request(),
            self.value(),
            self.index(),
            self.length()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{
        CLASS_OUT_TO_INTERFACE, RequestKind, RequestRecipient, STANDARD_IN_FROM_DEVICE,
        VENDOR_OUT_TO_DEVICE,
    };

    #[test]
    fn test_get_device_descriptor_bytes() {
        let rt = RequestType::new(
            RequestDirection::DeviceToHost,
            RequestKind::Standard,
            RequestRecipient::Device,
        );
        let setup = ControlSetupPacket::new(rt, 0x06, 0x0100, 0x0000, 18);
        assert_eq!(
            setup.as_bytes(),
            &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
        assert_eq!(setup.request_type().unwrap(), rt);
        assert_eq!(setup.value(), 0x0100);
        assert_eq!(setup.length(), 18);
    }

    #[test]
    fn test_little_endian_fields() {
        let setup = ControlSetupPacket::new(CLASS_OUT_TO_INTERFACE, 0x09, 0x0302, 0x0102, 0x0405);
        assert_eq!(
            setup.as_bytes(),
            &[0x21, 0x09, 0x02, 0x03, 0x02, 0x01, 0x05, 0x04]
        );
    }

    #[test]
    fn test_in_length_must_match_capacity() {
        let err = ControlSetupPacket::for_buffer(STANDARD_IN_FROM_DEVICE, 0x06, 0x0100, 0, 18, 64)
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::LengthMismatch {
                declared: 18,
                capacity: 64
            }
        );
        assert!(
            ControlSetupPacket::for_buffer(STANDARD_IN_FROM_DEVICE, 0x06, 0x0100, 0, 18, 18).is_ok()
        );
    }

    #[test]
    fn test_out_may_declare_zero_length() {
        assert!(ControlSetupPacket::for_buffer(VENDOR_OUT_TO_DEVICE, 0x01, 0, 0, 0, 0).is_ok());
        assert!(ControlSetupPacket::for_buffer(VENDOR_OUT_TO_DEVICE, 0x01, 0, 0, 0, 8).is_ok());
        assert!(ControlSetupPacket::for_buffer(VENDOR_OUT_TO_DEVICE, 0x01, 0, 0, 8, 8).is_ok());
        assert!(ControlSetupPacket::for_buffer(VENDOR_OUT_TO_DEVICE, 0x01, 0, 0, 4, 8).is_err());
    }

    #[test]
    fn test_oversized_data_stage() {
        let setup = ControlSetupPacket::new(VENDOR_OUT_TO_DEVICE, 0x01, 0, 0, 0);
        assert_eq!(
            setup.validate_data_stage(70_000),
            Err(ProtocolError::DataStageTooLong(70_000))
        );
    }

    #[test]
    fn test_parse_and_equality() {
        let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00, 0xFF];
        let parsed = ControlSetupPacket::parse(&raw).unwrap();
        assert_eq!(
            parsed,
            ControlSetupPacket::new(STANDARD_IN_FROM_DEVICE, 0x06, 0x0100, 0, 18)
        );
        assert_ne!(
            parsed,
            ControlSetupPacket::new(STANDARD_IN_FROM_DEVICE, 0x06, 0x0100, 0, 19)
        );
        assert!(matches!(
            ControlSetupPacket::parse(&raw[..5]),
            Err(ProtocolError::BufferTooSmall {
                needed: 8,
                available: 5
            })
        ));
    }

    #[test]
    fn test_undefined_recipient_surfaces_on_decode() {
        let setup = ControlSetupPacket::from_bytes([0x85, 0, 0, 0, 0, 0, 0, 0]);
        assert!(setup.request_type().is_err());
        assert_eq!(setup.direction(), RequestDirection::DeviceToHost);
    }
}
