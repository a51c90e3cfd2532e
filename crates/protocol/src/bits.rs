//! Bit-field codec
//!
//! Encodes and decodes the single-byte bit fields of the USB specification:
//! `bmRequestType`, `bEndpointAddress`, endpoint `bmAttributes` and
//! configuration `bmAttributes`.
//!
//! Encoding is total over the legal domain. Decoding reports
//! [`ProtocolError::UnrecognizedValue`] when masked bits match no enumerator;
//! it never falls back to a default.

use crate::error::{ProtocolError, Result};
use std::fmt;

/// Data-stage direction, bit 7 of `bmRequestType` and `bEndpointAddress`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestDirection {
    /// OUT
    HostToDevice,
    /// IN
    DeviceToHost,
}

impl RequestDirection {
    pub const MASK: u8 = 0x80;

    pub fn to_bits(self) -> u8 {
        match self {
            Self::HostToDevice => 0x00,
            Self::DeviceToHost => 0x80,
        }
    }

    /// Every pattern of bit 7 is defined, so this cannot fail
    pub fn from_bits(byte: u8) -> Self {
        if byte & Self::MASK == 0 {
            Self::HostToDevice
        } else {
            Self::DeviceToHost
        }
    }

    pub fn is_in(self) -> bool {
        self == Self::DeviceToHost
    }
}

/// Request kind, bits 6:5 of `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

impl RequestKind {
    pub const MASK: u8 = 0x60;

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Standard => 0x00,
            Self::Class => 0x20,
            Self::Vendor => 0x40,
            Self::Reserved => 0x60,
        }
    }

    pub fn from_bits(byte: u8) -> Self {
        match byte & Self::MASK {
            0x00 => Self::Standard,
            0x20 => Self::Class,
            0x40 => Self::Vendor,
            _ => Self::Reserved,
        }
    }
}

/// Request recipient, bits 4:0 of `bmRequestType`
///
/// Only 4 of the 32 patterns are defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

impl RequestRecipient {
    pub const MASK: u8 = 0x1F;

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Device => 0,
            Self::Interface => 1,
            Self::Endpoint => 2,
            Self::Other => 3,
        }
    }

    pub fn from_bits(byte: u8) -> Result<Self> {
        match byte & Self::MASK {
            0 => Ok(Self::Device),
            1 => Ok(Self::Interface),
            2 => Ok(Self::Endpoint),
            3 => Ok(Self::Other),
            value => Err(ProtocolError::UnrecognizedValue {
                field: "recipient",
                value,
            }),
        }
    }
}

/// Decoded `bmRequestType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestType {
    pub direction: RequestDirection,
    pub kind: RequestKind,
    pub recipient: RequestRecipient,
}

impl RequestType {
    pub const fn new(
        direction: RequestDirection,
        kind: RequestKind,
        recipient: RequestRecipient,
    ) -> Self {
        Self {
            direction,
            kind,
            recipient,
        }
    }

    pub fn to_byte(self) -> u8 {
        self.direction.to_bits() | self.kind.to_bits() | self.recipient.to_bits()
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(Self {
            direction: RequestDirection::from_bits(byte),
            kind: RequestKind::from_bits(byte),
            recipient: RequestRecipient::from_bits(byte)?,
        })
    }
}

impl From<RequestType> for u8 {
    fn from(request_type: RequestType) -> u8 {
        request_type.to_byte()
    }
}

impl TryFrom<u8> for RequestType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_byte(byte)
    }
}

/// Standard read from the device, e.g. GET_DESCRIPTOR
pub const STANDARD_IN_FROM_DEVICE: RequestType = RequestType::new(
    RequestDirection::DeviceToHost,
    RequestKind::Standard,
    RequestRecipient::Device,
);

/// Standard write to the device, e.g. SET_CONFIGURATION
pub const STANDARD_OUT_TO_DEVICE: RequestType = RequestType::new(
    RequestDirection::HostToDevice,
    RequestKind::Standard,
    RequestRecipient::Device,
);

pub const VENDOR_IN_FROM_DEVICE: RequestType = RequestType::new(
    RequestDirection::DeviceToHost,
    RequestKind::Vendor,
    RequestRecipient::Device,
);

pub const VENDOR_OUT_TO_DEVICE: RequestType = RequestType::new(
    RequestDirection::HostToDevice,
    RequestKind::Vendor,
    RequestRecipient::Device,
);

/// Class request to an interface; the interface number goes in wIndex
pub const CLASS_OUT_TO_INTERFACE: RequestType = RequestType::new(
    RequestDirection::HostToDevice,
    RequestKind::Class,
    RequestRecipient::Interface,
);

pub const CLASS_IN_FROM_INTERFACE: RequestType = RequestType::new(
    RequestDirection::DeviceToHost,
    RequestKind::Class,
    RequestRecipient::Interface,
);

/// Decoded `bEndpointAddress`
///
/// Bits 6:4 are reserved and ignored on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddress {
    number: u8,
    in_direction: bool,
}

impl EndpointAddress {
    pub const NUMBER_MASK: u8 = 0x0F;

    /// The default control pipe
    pub const CONTROL: Self = Self {
        number: 0,
        in_direction: false,
    };

    pub fn new(number: u8, direction: RequestDirection) -> Result<Self> {
        if number > Self::NUMBER_MASK {
            return Err(ProtocolError::EndpointNumberOutOfRange(number));
        }
        Ok(Self {
            number,
            in_direction: direction.is_in(),
        })
    }

    pub fn number(self) -> u8 {
        self.number
    }

    pub fn direction(self) -> RequestDirection {
        if self.in_direction {
            RequestDirection::DeviceToHost
        } else {
            RequestDirection::HostToDevice
        }
    }

    pub fn to_byte(self) -> u8 {
        self.direction().to_bits() | self.number
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            number: byte & Self::NUMBER_MASK,
            in_direction: RequestDirection::from_bits(byte).is_in(),
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.to_byte())
    }
}

/// Endpoint transfer type, bits 1:0 of endpoint `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub const MASK: u8 = 0x03;

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Isochronous => 1,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }

    pub fn from_bits(byte: u8) -> Self {
        match byte & Self::MASK {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// Isochronous synchronization type, bits 3:2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncType {
    NoSynchronization,
    Asynchronous,
    Adaptive,
    Synchronous,
}

impl SyncType {
    pub const MASK: u8 = 0x0C;

    pub fn to_bits(self) -> u8 {
        match self {
            Self::NoSynchronization => 0x00,
            Self::Asynchronous => 0x04,
            Self::Adaptive => 0x08,
            Self::Synchronous => 0x0C,
        }
    }

    pub fn from_bits(byte: u8) -> Self {
        match byte & Self::MASK {
            0x00 => Self::NoSynchronization,
            0x04 => Self::Asynchronous,
            0x08 => Self::Adaptive,
            _ => Self::Synchronous,
        }
    }
}

/// Isochronous usage type, bits 5:4
///
/// Pattern `0b11` is reserved and decodes as unrecognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageType {
    Data,
    Feedback,
    ImplicitFeedbackData,
}

impl UsageType {
    pub const MASK: u8 = 0x30;

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Data => 0x00,
            Self::Feedback => 0x10,
            Self::ImplicitFeedbackData => 0x20,
        }
    }

    pub fn from_bits(byte: u8) -> Result<Self> {
        match byte & Self::MASK {
            0x00 => Ok(Self::Data),
            0x10 => Ok(Self::Feedback),
            0x20 => Ok(Self::ImplicitFeedbackData),
            value => Err(ProtocolError::UnrecognizedValue {
                field: "usage type",
                value,
            }),
        }
    }
}

/// Decoded endpoint `bmAttributes`
///
/// Sync and usage types only exist on isochronous endpoints. For any other
/// transfer type they are normalized to `NoSynchronization`/`Data` at
/// construction, cleared on encode and ignored on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAttributes {
    transfer_type: TransferType,
    sync_type: SyncType,
    usage_type: UsageType,
}

impl EndpointAttributes {
    pub fn new(transfer_type: TransferType, sync_type: SyncType, usage_type: UsageType) -> Self {
        if transfer_type == TransferType::Isochronous {
            Self {
                transfer_type,
                sync_type,
                usage_type,
            }
        } else {
            Self::of(transfer_type)
        }
    }

    /// Attributes for a non-isochronous transfer type
    pub fn of(transfer_type: TransferType) -> Self {
        Self {
            transfer_type,
            sync_type: SyncType::NoSynchronization,
            usage_type: UsageType::Data,
        }
    }

    pub fn transfer_type(self) -> TransferType {
        self.transfer_type
    }

    pub fn sync_type(self) -> SyncType {
        self.sync_type
    }

    pub fn usage_type(self) -> UsageType {
        self.usage_type
    }

    pub fn to_byte(self) -> u8 {
        let transfer = self.transfer_type.to_bits();
        if self.transfer_type != TransferType::Isochronous {
            return transfer;
        }
        transfer | self.sync_type.to_bits() | self.usage_type.to_bits()
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        let transfer_type = TransferType::from_bits(byte);
        if transfer_type != TransferType::Isochronous {
            return Ok(Self::of(transfer_type));
        }
        Ok(Self {
            transfer_type,
            sync_type: SyncType::from_bits(byte),
            usage_type: UsageType::from_bits(byte)?,
        })
    }
}

/// Decoded configuration `bmAttributes`
///
/// Bit 7 is reserved and must be one on the wire; bits 4:0 are reserved zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConfigurationAttributes {
    pub self_powered: bool,
    pub remote_wakeup: bool,
}

impl ConfigurationAttributes {
    pub const RESERVED_ONE: u8 = 0x80;
    pub const SELF_POWERED: u8 = 0x40;
    pub const REMOTE_WAKEUP: u8 = 0x20;

    pub fn to_byte(self) -> u8 {
        let mut byte = Self::RESERVED_ONE;
        if self.self_powered {
            byte |= Self::SELF_POWERED;
        }
        if self.remote_wakeup {
            byte |= Self::REMOTE_WAKEUP;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            self_powered: byte & Self::SELF_POWERED != 0,
            remote_wakeup: byte & Self::REMOTE_WAKEUP != 0,
        }
    }
}
