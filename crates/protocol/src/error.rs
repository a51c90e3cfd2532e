//! Protocol error types

use thiserror::Error;

/// Codec and descriptor parsing errors
///
/// Raised synchronously by every encode/decode/parse routine in this crate.
/// None of these touch the bus; they describe bytes or field combinations
/// that the USB specification does not allow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Masked bits of a field match no defined enumerator
    #[error("Unrecognized {field} value: {value:#04x}")]
    UnrecognizedValue { field: &'static str, value: u8 },

    /// Endpoint numbers are 4 bits wide
    #[error("Endpoint number {0} out of range (max 15)")]
    EndpointNumberOutOfRange(u8),

    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Declared wLength disagrees with the data stage buffer
    #[error("Setup length mismatch: declared {declared}, buffer capacity {capacity}")]
    LengthMismatch { declared: usize, capacity: usize },

    /// Data stage longer than wLength can express
    #[error("Data stage too long: {0} bytes (max 65535)")]
    DataStageTooLong(usize),

    /// Descriptor carried the wrong bDescriptorType
    #[error("Invalid descriptor type: expected {expected:#04x}, got {actual:#04x}")]
    InvalidDescriptorType { expected: u8, actual: u8 },

    /// bLength is shorter than the fixed part or runs past the buffer
    #[error("Invalid descriptor length {length} at offset {offset}")]
    InvalidDescriptorLength { length: u8, offset: usize },

    /// Configuration value 0 means "unconfigured" and cannot label a configuration
    #[error("Configuration value 0 is reserved for the unconfigured state")]
    ReservedConfigurationValue,

    /// wTotalLength disagrees with the bytes returned by the fetch
    #[error("Configuration total length {declared} does not match {actual} bytes received")]
    TotalLengthMismatch { declared: usize, actual: usize },

    /// A declared child count disagrees with the children present
    #[error("{parent} declares {declared} {child}, found {actual}")]
    ChildCountMismatch {
        parent: &'static str,
        child: &'static str,
        declared: usize,
        actual: usize,
    },

    /// Two siblings share a key that must be unique
    #[error("Duplicate {kind} {key}")]
    DuplicateKey { kind: &'static str, key: String },

    /// String descriptor payload is not valid UTF-16LE
    #[error("String descriptor is not valid UTF-16")]
    InvalidUtf16,

    /// Contradictory field combination in a request
    #[error("Protocol violation: {0}")]
    Violation(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
