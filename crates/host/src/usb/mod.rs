//! USB control plane
//!
//! - `transport`: the collaborator that moves bytes, with a rusb-backed
//!   implementation in `native`
//! - `request`: the transfer request (IRP) record
//! - `queue`: per-device serialization of control transfers
//! - `device`: the session state machine for one device
//! - `services`: the registry of devices and their hub topology
//!
//! Every blocking call (open, claim, submit, wait) runs on the caller's
//! thread or on a queue worker thread, never on an async executor.

pub mod device;
pub mod native;
pub mod queue;
pub mod request;
pub mod services;
pub mod transport;

pub use device::{DeviceState, SessionSettings, UsbDevice};
pub use native::{RusbTransport, map_rusb_error};
pub use queue::{DEFAULT_QUEUE_DEPTH, DEFAULT_TIMEOUT, QueueSettings, SubmissionQueue};
pub use request::{Request, RequestState};
pub use services::HostServices;
pub use transport::{DiscoveredDevice, Transport};
