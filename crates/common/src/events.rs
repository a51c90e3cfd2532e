//! Event collaborator
//!
//! Device attach/detach notifications and per-request data/error
//! notifications, published by the control plane at state-commit points.
//! Delivery is a bounded multi-consumer channel: each event reaches exactly
//! one subscriber, and publishing never blocks the publisher.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use protocol::{DeviceId, RequestId, UsbError};
use tracing::{trace, warn};

/// Default event queue capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notification published by the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    /// Device lifecycle change
    Device(DeviceEvent),
    /// A request or session operation failed
    Error(ErrorEvent),
    /// A request completed successfully
    Data(DataEvent),
}

impl UsbEvent {
    pub fn device_id(&self) -> DeviceId {
        match self {
            Self::Device(DeviceEvent::Attached { device_id, .. })
            | Self::Device(DeviceEvent::Detached { device_id }) => *device_id,
            Self::Error(e) => e.device_id,
            Self::Data(d) => d.device_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device connected; `parent` is the hub it hangs off, if known
    Attached {
        device_id: DeviceId,
        parent: Option<DeviceId>,
    },
    /// Device disconnected
    Detached { device_id: DeviceId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    pub device_id: DeviceId,
    pub request_id: RequestId,
    /// Copy of the transferred bytes (empty for OUT transfers)
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub device_id: DeviceId,
    /// None for failures outside a request (e.g. claim during detach)
    pub request_id: Option<RequestId>,
    pub error: UsbError,
}

/// Publishing side of the event channel
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<UsbEvent>,
}

impl EventBus {
    /// Publish without blocking
    ///
    /// A full queue drops the event with a warning; a queue without
    /// subscribers drops it silently.
    pub fn publish(&self, event: UsbEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping event for {}", event.device_id());
            }
            Err(TrySendError::Closed(event)) => {
                trace!("No event subscribers, dropping event for {}", event.device_id());
            }
        }
    }

    pub fn publish_device(&self, event: DeviceEvent) {
        self.publish(UsbEvent::Device(event));
    }

    pub fn publish_data(&self, device_id: DeviceId, request_id: RequestId, data: Vec<u8>) {
        self.publish(UsbEvent::Data(DataEvent {
            device_id,
            request_id,
            data,
        }));
    }

    pub fn publish_error(
        &self,
        device_id: DeviceId,
        request_id: Option<RequestId>,
        error: UsbError,
    ) {
        self.publish(UsbEvent::Error(ErrorEvent {
            device_id,
            request_id,
            error,
        }));
    }

    /// Close the channel; subscribers drain what is queued, then see an error
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Receiving side of the event channel
#[derive(Clone)]
pub struct EventSubscriber {
    rx: Receiver<UsbEvent>,
}

impl EventSubscriber {
    /// Receive the next event (async)
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<UsbEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive without blocking
    pub fn try_recv(&self) -> Option<UsbEvent> {
        self.rx.try_recv().ok()
    }

    /// Take every event currently queued
    pub fn drain(&self) -> Vec<UsbEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Create the event channel
///
/// Returns (EventBus for publishers, EventSubscriber for consumers)
pub fn create_event_bus(capacity: usize) -> (EventBus, EventSubscriber) {
    let (tx, rx) = bounded(capacity.max(1));
    (EventBus { tx }, EventSubscriber { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_roundtrip() {
        let (bus, subscriber) = create_event_bus(8);

        bus.publish_device(DeviceEvent::Attached {
            device_id: DeviceId(1),
            parent: None,
        });
        bus.publish_data(DeviceId(1), RequestId(7), vec![1, 2, 3]);

        let first = subscriber.recv_event().await.unwrap();
        assert!(matches!(
            first,
            UsbEvent::Device(DeviceEvent::Attached { device_id: DeviceId(1), .. })
        ));

        match subscriber.recv_event().await.unwrap() {
            UsbEvent::Data(data) => {
                assert_eq!(data.request_id, RequestId(7));
                assert_eq!(data.data, vec![1, 2, 3]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (bus, subscriber) = create_event_bus(1);
        bus.publish_device(DeviceEvent::Detached {
            device_id: DeviceId(1),
        });
        bus.publish_device(DeviceEvent::Detached {
            device_id: DeviceId(2),
        });

        let events = subscriber.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_id(), DeviceId(1));
    }

    #[test]
    fn test_close_ends_subscription() {
        let (bus, subscriber) = create_event_bus(4);
        bus.publish_error(DeviceId(3), None, UsbError::Disconnected);
        bus.close();

        assert!(matches!(subscriber.recv_blocking(), Ok(UsbEvent::Error(_))));
        assert!(subscriber.recv_blocking().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let (bus, subscriber) = create_event_bus(4);
        drop(subscriber);
        bus.publish_device(DeviceEvent::Detached {
            device_id: DeviceId(9),
        });
    }
}
