//! Identifier and error types shared by the host stack
//!
//! These types carry no wire encoding of their own. They name devices,
//! sessions and requests, and define the error taxonomy every session
//! operation reports.

use crate::error::ProtocolError;
use std::fmt;
use thiserror::Error;

/// Unique device identifier (registry-assigned)
///
/// Stable for the lifetime of the device connection. Parent/child links
/// between hubs and devices are expressed through this ID, never through
/// references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Opaque native handle returned by a transport `open`
///
/// Only valid between the `open` that produced it and the matching `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

/// Request ID for correlating completions and events
///
/// Assigned from a process-wide atomic counter when a request is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Physical location of a device on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceRef {
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
}

impl DeviceRef {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
    /// Speed not reported by the platform
    Unknown,
}

impl DeviceSpeed {
    /// High speed and above schedule in 125us microframes
    pub fn uses_microframes(self) -> bool {
        matches!(self, Self::High | Self::Super | Self::SuperPlus)
    }
}

impl fmt::Display for DeviceSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "1.5 Mbps",
            Self::Full => "12 Mbps",
            Self::High => "480 Mbps",
            Self::Super => "5 Gbps",
            Self::SuperPlus => "10 Gbps",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Session and transfer errors
///
/// Validation failures are returned synchronously by the call that detects
/// them. Transport failures are recorded on the request outcome and re-raised
/// by a synchronous submit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsbError {
    /// Contradictory or malformed protocol fields
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolError),

    /// Device was disconnected (or vanished mid-call)
    #[error("Device disconnected")]
    Disconnected,

    /// Operation requires an open session
    #[error("Device not open")]
    NotOpen,

    /// Interface is already held by this session
    #[error("Interface {interface} already claimed")]
    AlreadyClaimed { interface: u8 },

    /// Interface is not held by this session
    #[error("Interface {interface} not claimed")]
    NotClaimed { interface: u8 },

    /// Configuration change attempted while interfaces are claimed
    #[error("Configuration busy: {claimed} interface(s) claimed")]
    ConfigurationBusy { claimed: usize },

    /// Inbound transfer returned fewer bytes than requested
    #[error("Short packet: expected {expected} bytes, got {actual}")]
    ShortPacket { expected: usize, actual: usize },

    /// Requested configuration value is not present on the device
    #[error("No such configuration: {0}")]
    NoSuchConfiguration(u8),

    /// Offset/length window does not fit the buffer
    #[error("Invalid buffer window: offset {offset} + length {length} exceeds capacity {capacity}")]
    InvalidBuffer {
        offset: usize,
        length: usize,
        capacity: usize,
    },

    /// Programming error in request lifecycle usage
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Opaque native transport failure
    #[error("Platform error {code}: {message}")]
    Platform { code: i32, message: String },
}

impl UsbError {
    /// Whether the error indicates the device is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}
