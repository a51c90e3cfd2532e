//! Descriptor value objects
//!
//! Immutable records mirroring the standard device, configuration, interface,
//! endpoint and string descriptors. Each can be parsed from the raw bytes a
//! transport returns and serialized back to the wire layout.

use crate::bits::{ConfigurationAttributes, EndpointAddress, EndpointAttributes, TransferType};
use crate::error::{ProtocolError, Result};
use crate::types::DeviceSpeed;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::time::Duration;

/// bDescriptorType codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Device,
    Configuration,
    String,
    Interface,
    Endpoint,
    DeviceQualifier,
    OtherSpeedConfiguration,
    InterfacePower,
    Otg,
    Debug,
    InterfaceAssociation,
    Bos,
    DeviceCapability,
    SuperSpeedEndpointCompanion,
    /// Class- or vendor-specific type (kept verbatim)
    Other(u8),
}

impl DescriptorType {
    pub fn code(self) -> u8 {
        match self {
            Self::Device => 0x01,
            Self::Configuration => 0x02,
            Self::String => 0x03,
            Self::Interface => 0x04,
            Self::Endpoint => 0x05,
            Self::DeviceQualifier => 0x06,
            Self::OtherSpeedConfiguration => 0x07,
            Self::InterfacePower => 0x08,
            Self::Otg => 0x09,
            Self::Debug => 0x0A,
            Self::InterfaceAssociation => 0x0B,
            Self::Bos => 0x0F,
            Self::DeviceCapability => 0x10,
            Self::SuperSpeedEndpointCompanion => 0x30,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Device,
            0x02 => Self::Configuration,
            0x03 => Self::String,
            0x04 => Self::Interface,
            0x05 => Self::Endpoint,
            0x06 => Self::DeviceQualifier,
            0x07 => Self::OtherSpeedConfiguration,
            0x08 => Self::InterfacePower,
            0x09 => Self::Otg,
            0x0A => Self::Debug,
            0x0B => Self::InterfaceAssociation,
            0x0F => Self::Bos,
            0x10 => Self::DeviceCapability,
            0x30 => Self::SuperSpeedEndpointCompanion,
            other => Self::Other(other),
        }
    }
}

/// Validate bLength/bDescriptorType and return bLength
fn check_header(data: &[u8], expected: DescriptorType, min_len: usize) -> Result<usize> {
    if data.len() < min_len {
        return Err(ProtocolError::BufferTooSmall {
            needed: min_len,
            available: data.len(),
        });
    }
    let length = data[0];
    if (length as usize) < min_len || length as usize > data.len() {
        return Err(ProtocolError::InvalidDescriptorLength { length, offset: 0 });
    }
    if data[1] != expected.code() {
        return Err(ProtocolError::InvalidDescriptorType {
            expected: expected.code(),
            actual: data[1],
        });
    }
    Ok(length as usize)
}

fn string_index(raw: u8) -> Option<u8> {
    if raw == 0 { None } else { Some(raw) }
}

/// Binary-coded decimal version (bcdUSB, bcdDevice)
///
/// Each nibble is one decimal digit: `0xJJMN` renders as `"JJ.M.N"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BcdVersion(pub u16);

impl BcdVersion {
    pub fn from_parts(major: u8, minor: u8, sub_minor: u8) -> Self {
        let major = u16::from(major % 100);
        Self(
            ((major / 10) << 12)
                | ((major % 10) << 8)
                | (u16::from(minor & 0x0F) << 4)
                | u16::from(sub_minor & 0x0F),
        )
    }

    fn nibble(self, n: u32) -> u8 {
        ((self.0 >> (n * 4)) & 0x0F) as u8
    }

    pub fn major(self) -> u8 {
        self.nibble(3) * 10 + self.nibble(2)
    }

    pub fn minor(self) -> u8 {
        self.nibble(1)
    }

    pub fn sub_minor(self) -> u8 {
        self.nibble(0)
    }

    /// Every nibble is a decimal digit
    pub fn is_valid(self) -> bool {
        (0..4).all(|n| self.nibble(n) <= 9)
    }
}

impl fmt::Display for BcdVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}{:x}.{:x}.{:x}",
            self.nibble(3),
            self.nibble(2),
            self.nibble(1),
            self.nibble(0)
        )
    }
}

/// Standard device descriptor (18 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    pub usb_version: BcdVersion,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    /// Opaque 16-bit vendor ID
    pub vendor_id: u16,
    /// Opaque 16-bit product ID
    pub product_id: u16,
    pub device_version: BcdVersion,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    /// Exact number of configurations the device exposes
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;
    /// Hub device class
    pub const CLASS_HUB: u8 = 0x09;

    pub fn parse(data: &[u8]) -> Result<Self> {
        check_header(data, DescriptorType::Device, Self::LENGTH)?;
        Ok(Self {
            usb_version: BcdVersion(LittleEndian::read_u16(&data[2..4])),
            class: data[4],
            subclass: data[5],
            protocol: data[6],
            max_packet_size0: data[7],
            vendor_id: LittleEndian::read_u16(&data[8..10]),
            product_id: LittleEndian::read_u16(&data[10..12]),
            device_version: BcdVersion(LittleEndian::read_u16(&data[12..14])),
            manufacturer_index: data[14],
            product_index: data[15],
            serial_number_index: data[16],
            num_configurations: data[17],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[0] = Self::LENGTH as u8;
        out[1] = DescriptorType::Device.code();
        LittleEndian::write_u16(&mut out[2..4], self.usb_version.0);
        out[4] = self.class;
        out[5] = self.subclass;
        out[6] = self.protocol;
        out[7] = self.max_packet_size0;
        LittleEndian::write_u16(&mut out[8..10], self.vendor_id);
        LittleEndian::write_u16(&mut out[10..12], self.product_id);
        LittleEndian::write_u16(&mut out[12..14], self.device_version.0);
        out[14] = self.manufacturer_index;
        out[15] = self.product_index;
        out[16] = self.serial_number_index;
        out[17] = self.num_configurations;
        out
    }

    pub fn manufacturer_string_index(&self) -> Option<u8> {
        string_index(self.manufacturer_index)
    }

    pub fn product_string_index(&self) -> Option<u8> {
        string_index(self.product_index)
    }

    pub fn serial_number_string_index(&self) -> Option<u8> {
        string_index(self.serial_number_index)
    }

    pub fn is_hub(&self) -> bool {
        self.class == Self::CLASS_HUB
    }
}

/// Standard configuration descriptor header (9 bytes)
///
/// `total_length` spans this header plus every interface, endpoint and
/// class-specific descriptor returned by the same fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigurationDescriptor {
    total_length: u16,
    num_interfaces: u8,
    value: u8,
    string_index: u8,
    attributes: ConfigurationAttributes,
    max_power: u8,
}

impl ConfigurationDescriptor {
    pub const LENGTH: usize = 9;

    /// `max_power` is in the raw bMaxPower unit (2 mA, or 8 mA at SuperSpeed)
    pub fn new(
        total_length: u16,
        num_interfaces: u8,
        value: u8,
        string_index: u8,
        attributes: ConfigurationAttributes,
        max_power: u8,
    ) -> Result<Self> {
        if value == 0 {
            return Err(ProtocolError::ReservedConfigurationValue);
        }
        Ok(Self {
            total_length,
            num_interfaces,
            value,
            string_index,
            attributes,
            max_power,
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        check_header(data, DescriptorType::Configuration, Self::LENGTH)?;
        Self::new(
            LittleEndian::read_u16(&data[2..4]),
            data[4],
            data[5],
            data[6],
            ConfigurationAttributes::from_byte(data[7]),
            data[8],
        )
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[0] = Self::LENGTH as u8;
        out[1] = DescriptorType::Configuration.code();
        LittleEndian::write_u16(&mut out[2..4], self.total_length);
        out[4] = self.num_interfaces;
        out[5] = self.value;
        out[6] = self.string_index;
        out[7] = self.attributes.to_byte();
        out[8] = self.max_power;
        out
    }

    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    pub fn num_interfaces(&self) -> u8 {
        self.num_interfaces
    }

    /// bConfigurationValue, never zero
    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn string_index(&self) -> Option<u8> {
        string_index(self.string_index)
    }

    pub fn attributes(&self) -> ConfigurationAttributes {
        self.attributes
    }

    pub fn max_power_raw(&self) -> u8 {
        self.max_power
    }

    pub fn max_power_ma(&self, speed: DeviceSpeed) -> u32 {
        let unit = match speed {
            DeviceSpeed::Super | DeviceSpeed::SuperPlus => 8,
            _ => 2,
        };
        u32::from(self.max_power) * unit
    }
}

/// Standard interface descriptor (9 bytes)
///
/// Keyed by (number, alternate_setting). `num_endpoints` excludes endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
}

impl InterfaceDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(data: &[u8]) -> Result<Self> {
        check_header(data, DescriptorType::Interface, Self::LENGTH)?;
        Ok(Self {
            number: data[2],
            alternate_setting: data[3],
            num_endpoints: data[4],
            class: data[5],
            subclass: data[6],
            protocol: data[7],
            string_index: data[8],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        [
            Self::LENGTH as u8,
            DescriptorType::Interface.code(),
            self.number,
            self.alternate_setting,
            self.num_endpoints,
            self.class,
            self.subclass,
            self.protocol,
            self.string_index,
        ]
    }

    pub fn key(&self) -> (u8, u8) {
        (self.number, self.alternate_setting)
    }

    pub fn interface_string_index(&self) -> Option<u8> {
        string_index(self.string_index)
    }
}

/// Standard endpoint descriptor (7 bytes; audio endpoints carry 2 more)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub attributes: EndpointAttributes,
    /// Raw wMaxPacketSize including the transaction bits
    pub max_packet_size_raw: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const LENGTH: usize = 7;
    const SIZE_MASK: u16 = 0x07FF;

    pub fn parse(data: &[u8]) -> Result<Self> {
        check_header(data, DescriptorType::Endpoint, Self::LENGTH)?;
        Ok(Self {
            address: EndpointAddress::from_byte(data[2]),
            attributes: EndpointAttributes::from_byte(data[3])?,
            max_packet_size_raw: LittleEndian::read_u16(&data[4..6]),
            interval: data[6],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut out = [0u8; Self::LENGTH];
        out[0] = Self::LENGTH as u8;
        out[1] = DescriptorType::Endpoint.code();
        out[2] = self.address.to_byte();
        out[3] = self.attributes.to_byte();
        LittleEndian::write_u16(&mut out[4..6], self.max_packet_size_raw);
        out[6] = self.interval;
        out
    }

    pub fn transfer_type(&self) -> TransferType {
        self.attributes.transfer_type()
    }

    /// Packet size in bytes (low 11 bits)
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size_raw & Self::SIZE_MASK
    }

    /// Additional transactions per microframe (bits 12:11, 0-2)
    pub fn additional_transactions(&self) -> Result<u8> {
        match ((self.max_packet_size_raw >> 11) & 0x03) as u8 {
            value @ 0..=2 => Ok(value),
            value => Err(ProtocolError::UnrecognizedValue {
                field: "additional transactions",
                value,
            }),
        }
    }

    /// Transactions per microframe; only high-bandwidth periodic endpoints exceed 1
    pub fn transactions_per_microframe(&self, speed: DeviceSpeed) -> Result<u8> {
        let periodic = matches!(
            self.transfer_type(),
            TransferType::Isochronous | TransferType::Interrupt
        );
        if speed == DeviceSpeed::High && periodic {
            Ok(1 + self.additional_transactions()?)
        } else {
            Ok(1)
        }
    }

    /// Service interval for periodic endpoints
    ///
    /// Low/full speed interrupt endpoints poll every bInterval frames (1 ms).
    /// Full speed isochronous and all high speed periodic endpoints use
    /// 2^(bInterval-1) frames or microframes. Control and bulk endpoints have
    /// no polling interval (at high speed bInterval is a NAK rate).
    pub fn polling_interval(&self, speed: DeviceSpeed) -> Option<Duration> {
        if self.interval == 0 {
            return None;
        }
        let exponent = u32::from(self.interval.clamp(1, 16) - 1);
        match (self.transfer_type(), speed.uses_microframes()) {
            (TransferType::Control | TransferType::Bulk, _) => None,
            (TransferType::Interrupt, false) => {
                Some(Duration::from_millis(u64::from(self.interval)))
            }
            (TransferType::Isochronous, false) if speed == DeviceSpeed::Low => None,
            (TransferType::Isochronous, false) => Some(Duration::from_millis(1 << exponent)),
            (_, true) => Some(Duration::from_micros(125 << exponent)),
        }
    }
}

/// Decode a string descriptor payload (UTF-16LE)
pub fn parse_string_descriptor(data: &[u8]) -> Result<String> {
    let length = check_header(data, DescriptorType::String, 2)?;
    let payload = &data[2..length];
    if payload.len() % 2 != 0 {
        return Err(ProtocolError::InvalidDescriptorLength {
            length: length as u8,
            offset: 0,
        });
    }
    let units = payload.chunks_exact(2).map(LittleEndian::read_u16);
    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| ProtocolError::InvalidUtf16)
}

/// Decode string descriptor zero: the supported LANGIDs
pub fn parse_language_ids(data: &[u8]) -> Result<Vec<u16>> {
    let length = check_header(data, DescriptorType::String, 2)?;
    Ok(data[2..length]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect())
}

/// Encode a string as a string descriptor
pub fn encode_string_descriptor(value: &str) -> Result<Vec<u8>> {
    let units: Vec<u16> = value.encode_utf16().collect();
    let length = 2 + units.len() * 2;
    if length > u8::MAX as usize {
        return Err(ProtocolError::DataStageTooLong(length));
    }
    let mut out = Vec::with_capacity(length);
    out.push(length as u8);
    out.push(DescriptorType::String.code());
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{RequestDirection, SyncType, UsageType};

    const FLASH_DRIVE: [u8; 18] = [
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x81, 0x07, 0x51, 0x55, 0x00, 0x01, 0x01,
        0x02, 0x03, 0x01,
    ];

    #[test]
    fn test_parse_device_descriptor() {
        let desc = DeviceDescriptor::parse(&FLASH_DRIVE).unwrap();
        assert_eq!(desc.vendor_id, 0x0781);
        assert_eq!(desc.product_id, 0x5551);
        assert_eq!(desc.usb_version.to_string(), "02.0.0");
        assert_eq!(desc.device_version.to_string(), "01.0.0");
        assert_eq!(desc.max_packet_size0, 64);
        assert_eq!(desc.num_configurations, 1);
        assert_eq!(desc.serial_number_string_index(), Some(3));
        assert!(!desc.is_hub());
        assert_eq!(desc.to_bytes(), FLASH_DRIVE);
    }

    #[test]
    fn test_device_descriptor_rejects_bad_header() {
        let mut bytes = FLASH_DRIVE;
        bytes[1] = 0x02;
        assert_eq!(
            DeviceDescriptor::parse(&bytes),
            Err(ProtocolError::InvalidDescriptorType {
                expected: 0x01,
                actual: 0x02
            })
        );
        assert!(matches!(
            DeviceDescriptor::parse(&FLASH_DRIVE[..10]),
            Err(ProtocolError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_bcd_version() {
        let v = BcdVersion(0x0210);
        assert_eq!(v.major(), 2);
        assert_eq!(v.minor(), 1);
        assert_eq!(v.sub_minor(), 0);
        assert_eq!(v.to_string(), "02.1.0");
        assert_eq!(BcdVersion::from_parts(2, 1, 0), v);
        assert_eq!(BcdVersion(0x1234).major(), 12);
        assert!(v.is_valid());
        assert!(!BcdVersion(0x01A0).is_valid());
    }

    #[test]
    fn test_configuration_value_zero_is_reserved() {
        let raw = [0x09, 0x02, 0x09, 0x00, 0x00, 0x00, 0x00, 0x80, 0x32];
        assert_eq!(
            ConfigurationDescriptor::parse(&raw),
            Err(ProtocolError::ReservedConfigurationValue)
        );
    }

    #[test]
    fn test_configuration_descriptor() {
        let raw = [0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0xC0, 0x32];
        let desc = ConfigurationDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.total_length(), 32);
        assert_eq!(desc.value(), 1);
        assert!(desc.attributes().self_powered);
        assert!(!desc.attributes().remote_wakeup);
        assert_eq!(desc.max_power_ma(DeviceSpeed::High), 100);
        assert_eq!(desc.max_power_ma(DeviceSpeed::Super), 400);
        assert_eq!(desc.string_index(), None);
        assert_eq!(desc.to_bytes(), raw);
    }

    #[test]
    fn test_endpoint_packet_size_fields() {
        let ep = EndpointDescriptor {
            address: EndpointAddress::new(1, RequestDirection::DeviceToHost).unwrap(),
            attributes: EndpointAttributes::new(
                TransferType::Isochronous,
                SyncType::Asynchronous,
                UsageType::Data,
            ),
            max_packet_size_raw: (2 << 11) | 1024,
            interval: 1,
        };
        assert_eq!(ep.max_packet_size(), 1024);
        assert_eq!(ep.additional_transactions(), Ok(2));
        assert_eq!(ep.transactions_per_microframe(DeviceSpeed::High), Ok(3));
        assert_eq!(ep.transactions_per_microframe(DeviceSpeed::Full), Ok(1));

        let reserved = EndpointDescriptor {
            max_packet_size_raw: (3 << 11) | 512,
            ..ep
        };
        assert!(reserved.additional_transactions().is_err());

        let parsed = EndpointDescriptor::parse(&ep.to_bytes()).unwrap();
        assert_eq!(parsed, ep);
    }

    #[test]
    fn test_polling_interval() {
        let interrupt = EndpointDescriptor {
            address: EndpointAddress::from_byte(0x81),
            attributes: EndpointAttributes::of(TransferType::Interrupt),
            max_packet_size_raw: 8,
            interval: 10,
        };
        assert_eq!(
            interrupt.polling_interval(DeviceSpeed::Full),
            Some(Duration::from_millis(10))
        );

        let hs_interrupt = EndpointDescriptor {
            interval: 4,
            ..interrupt
        };
        assert_eq!(
            hs_interrupt.polling_interval(DeviceSpeed::High),
            Some(Duration::from_micros(1000))
        );

        let iso = EndpointDescriptor {
            attributes: EndpointAttributes::of(TransferType::Isochronous),
            interval: 3,
            ..interrupt
        };
        assert_eq!(
            iso.polling_interval(DeviceSpeed::Full),
            Some(Duration::from_millis(4))
        );

        let bulk = EndpointDescriptor {
            attributes: EndpointAttributes::of(TransferType::Bulk),
            ..interrupt
        };
        assert_eq!(bulk.polling_interval(DeviceSpeed::High), None);
    }

    #[test]
    fn test_string_descriptor() {
        let raw = encode_string_descriptor("SanDisk").unwrap();
        assert_eq!(raw[0] as usize, raw.len());
        assert_eq!(parse_string_descriptor(&raw).unwrap(), "SanDisk");

        // Lone surrogate
        let bad = [0x04, 0x03, 0x00, 0xD8];
        assert_eq!(parse_string_descriptor(&bad), Err(ProtocolError::InvalidUtf16));
    }

    #[test]
    fn test_language_ids() {
        let raw = [0x06, 0x03, 0x09, 0x04, 0x07, 0x04];
        assert_eq!(parse_language_ids(&raw).unwrap(), vec![0x0409, 0x0407]);
    }

    #[test]
    fn test_descriptor_type_codes() {
        assert_eq!(DescriptorType::from_code(0x24), DescriptorType::Other(0x24));
        assert_eq!(DescriptorType::from_code(0x05), DescriptorType::Endpoint);
        assert_eq!(DescriptorType::Bos.code(), 0x0F);
    }
}
