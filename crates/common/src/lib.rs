//! Common utilities for usbctl
//!
//! This crate provides functionality shared by the host control plane and
//! its tools: error handling, logging setup, and the event channel through
//! which device and request notifications are published.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
pub use events::{
    DEFAULT_EVENT_CAPACITY, DataEvent, DeviceEvent, ErrorEvent, EventBus, EventSubscriber,
    UsbEvent, create_event_bus,
};
pub use logging::{setup_logging, try_setup_test_logging};
