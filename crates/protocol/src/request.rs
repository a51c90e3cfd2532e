//! Standard device requests (USB 2.0 chapter 9.4)
//!
//! Builders for the standard requests and a consistency check that rejects
//! setup packets whose direction, recipient or fixed fields contradict the
//! request code.

use crate::bits::{
    EndpointAddress, RequestDirection, RequestKind, RequestRecipient, RequestType,
    STANDARD_IN_FROM_DEVICE, STANDARD_OUT_TO_DEVICE,
};
use crate::descriptor::DescriptorType;
use crate::error::{ProtocolError, Result};
use crate::setup::ControlSetupPacket;

/// Feature selector: endpoint halt
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
/// Feature selector: device remote wakeup
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;
/// Feature selector: test mode
pub const FEATURE_TEST_MODE: u16 = 2;

/// Standard request codes (bRequest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardRequest {
    GetStatus,
    ClearFeature,
    SetFeature,
    SetAddress,
    GetDescriptor,
    SetDescriptor,
    GetConfiguration,
    SetConfiguration,
    GetInterface,
    SetInterface,
    SynchFrame,
}

const DEVICE_ONLY: &[RequestRecipient] = &[RequestRecipient::Device];
const INTERFACE_ONLY: &[RequestRecipient] = &[RequestRecipient::Interface];
const ENDPOINT_ONLY: &[RequestRecipient] = &[RequestRecipient::Endpoint];
const ANY_TARGET: &[RequestRecipient] = &[
    RequestRecipient::Device,
    RequestRecipient::Interface,
    RequestRecipient::Endpoint,
];
// Class descriptors (e.g. HID report) are read through the interface
const DESCRIPTOR_TARGET: &[RequestRecipient] =
    &[RequestRecipient::Device, RequestRecipient::Interface];

impl StandardRequest {
    pub fn code(self) -> u8 {
        match self {
            Self::GetStatus => 0x00,
            Self::ClearFeature => 0x01,
            Self::SetFeature => 0x03,
            Self::SetAddress => 0x05,
            Self::GetDescriptor => 0x06,
            Self::SetDescriptor => 0x07,
            Self::GetConfiguration => 0x08,
            Self::SetConfiguration => 0x09,
            Self::GetInterface => 0x0A,
            Self::SetInterface => 0x0B,
            Self::SynchFrame => 0x0C,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0x00 => Self::GetStatus,
            0x01 => Self::ClearFeature,
            0x03 => Self::SetFeature,
            0x05 => Self::SetAddress,
            0x06 => Self::GetDescriptor,
            0x07 => Self::SetDescriptor,
            0x08 => Self::GetConfiguration,
            0x09 => Self::SetConfiguration,
            0x0A => Self::GetInterface,
            0x0B => Self::SetInterface,
            0x0C => Self::SynchFrame,
            value => {
                return Err(ProtocolError::UnrecognizedValue {
                    field: "standard request",
                    value,
                });
            }
        })
    }

    /// Direction fixed by the request definition
    pub fn direction(self) -> RequestDirection {
        match self {
            Self::GetStatus
            | Self::GetDescriptor
            | Self::GetConfiguration
            | Self::GetInterface
            | Self::SynchFrame => RequestDirection::DeviceToHost,
            _ => RequestDirection::HostToDevice,
        }
    }

    pub fn recipients(self) -> &'static [RequestRecipient] {
        match self {
            Self::GetStatus | Self::ClearFeature | Self::SetFeature => ANY_TARGET,
            Self::SetAddress
            | Self::SetDescriptor
            | Self::GetConfiguration
            | Self::SetConfiguration => DEVICE_ONLY,
            Self::GetDescriptor => DESCRIPTOR_TARGET,
            Self::GetInterface | Self::SetInterface => INTERFACE_ONLY,
            Self::SynchFrame => ENDPOINT_ONLY,
        }
    }

    /// wLength fixed by the request definition, if any
    pub fn fixed_length(self) -> Option<u16> {
        match self {
            Self::GetStatus | Self::SynchFrame => Some(2),
            Self::GetConfiguration | Self::GetInterface => Some(1),
            Self::ClearFeature
            | Self::SetFeature
            | Self::SetAddress
            | Self::SetConfiguration
            | Self::SetInterface => Some(0),
            Self::GetDescriptor | Self::SetDescriptor => None,
        }
    }

    /// Device-only requests carry no target in wIndex
    fn requires_zero_index(self) -> bool {
        matches!(
            self,
            Self::SetAddress | Self::GetConfiguration | Self::SetConfiguration
        )
    }
}

/// Reject standard requests whose fields contradict each other
///
/// Class, vendor and reserved requests are not interpreted and always pass,
/// as do standard codes outside the USB 2.0 table (SET_SEL and friends).
pub fn validate_standard(setup: &ControlSetupPacket) -> Result<()> {
    let request_type = setup.request_type()?;
    if request_type.kind != RequestKind::Standard {
        return Ok(());
    }
    let Ok(request) = StandardRequest::from_code(setup.request()) else {
        return Ok(());
    };

    if request_type.direction != request.direction() {
        return Err(ProtocolError::Violation(format!(
            "{:?} must be {:?}",
            request,
            request.direction()
        )));
    }
    if !request.recipients().contains(&request_type.recipient) {
        return Err(ProtocolError::Violation(format!(
            "{:?} cannot target {:?}",
            request, request_type.recipient
        )));
    }
    if request.requires_zero_index() && setup.index() != 0 {
        return Err(ProtocolError::Violation(format!(
            "{:?} is device-only but wIndex is {:#06x}",
            request,
            setup.index()
        )));
    }
    if let Some(length) = request.fixed_length()
        && setup.length() != length
    {
        return Err(ProtocolError::Violation(format!(
            "{:?} requires wLength {}, got {}",
            request,
            length,
            setup.length()
        )));
    }
    if request == StandardRequest::SetAddress && setup.value() > 127 {
        return Err(ProtocolError::Violation(format!(
            "device address {} exceeds 127",
            setup.value()
        )));
    }
    Ok(())
}

fn standard(direction: RequestDirection, recipient: RequestRecipient) -> RequestType {
    RequestType::new(direction, RequestKind::Standard, recipient)
}

/// GET_DESCRIPTOR; `lang_id` is only meaningful for string descriptors
pub fn get_descriptor(
    descriptor_type: DescriptorType,
    index: u8,
    lang_id: u16,
    length: u16,
) -> ControlSetupPacket {
    ControlSetupPacket::new(
        STANDARD_IN_FROM_DEVICE,
        StandardRequest::GetDescriptor.code(),
        (u16::from(descriptor_type.code()) << 8) | u16::from(index),
        lang_id,
        length,
    )
}

pub fn get_configuration() -> ControlSetupPacket {
    ControlSetupPacket::new(
        STANDARD_IN_FROM_DEVICE,
        StandardRequest::GetConfiguration.code(),
        0,
        0,
        1,
    )
}

pub fn set_configuration(value: u8) -> ControlSetupPacket {
    ControlSetupPacket::new(
        STANDARD_OUT_TO_DEVICE,
        StandardRequest::SetConfiguration.code(),
        u16::from(value),
        0,
        0,
    )
}

pub fn get_interface(interface: u8) -> ControlSetupPacket {
    ControlSetupPacket::new(
        standard(RequestDirection::DeviceToHost, RequestRecipient::Interface),
        StandardRequest::GetInterface.code(),
        0,
        u16::from(interface),
        1,
    )
}

pub fn set_interface(interface: u8, alternate_setting: u8) -> ControlSetupPacket {
    ControlSetupPacket::new(
        standard(RequestDirection::HostToDevice, RequestRecipient::Interface),
        StandardRequest::SetInterface.code(),
        u16::from(alternate_setting),
        u16::from(interface),
        0,
    )
}

/// GET_STATUS; `index` is the interface number or endpoint address
pub fn get_status(recipient: RequestRecipient, index: u16) -> ControlSetupPacket {
    ControlSetupPacket::new(
        standard(RequestDirection::DeviceToHost, recipient),
        StandardRequest::GetStatus.code(),
        0,
        index,
        2,
    )
}

pub fn clear_feature(recipient: RequestRecipient, feature: u16, index: u16) -> ControlSetupPacket {
    ControlSetupPacket::new(
        standard(RequestDirection::HostToDevice, recipient),
        StandardRequest::ClearFeature.code(),
        feature,
        index,
        0,
    )
}

pub fn set_feature(recipient: RequestRecipient, feature: u16, index: u16) -> ControlSetupPacket {
    ControlSetupPacket::new(
        standard(RequestDirection::HostToDevice, recipient),
        StandardRequest::SetFeature.code(),
        feature,
        index,
        0,
    )
}

pub fn set_address(address: u8) -> Result<ControlSetupPacket> {
    let setup = ControlSetupPacket::new(
        STANDARD_OUT_TO_DEVICE,
        StandardRequest::SetAddress.code(),
        u16::from(address),
        0,
        0,
    );
    validate_standard(&setup)?;
    Ok(setup)
}

pub fn synch_frame(endpoint: EndpointAddress) -> ControlSetupPacket {
    ControlSetupPacket::new(
        standard(RequestDirection::DeviceToHost, RequestRecipient::Endpoint),
        StandardRequest::SynchFrame.code(),
        0,
        u16::from(endpoint.to_byte()),
        2,
    )
}
