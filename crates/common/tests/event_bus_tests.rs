//! Event Bus Integration Tests
//!
//! Tests for the event channel between the control plane (blocking threads)
//! and async consumers.
//!
//! # Test Scenarios
//! - Blocking publishers, async consumer
//! - Pattern-match dispatch over the tagged event variants
//! - Per-publisher ordering under concurrent publishing
//! - Shutdown via close
//!
//! Run with: `cargo test -p common --test event_bus_tests`

use common::{DataEvent, DeviceEvent, ErrorEvent, UsbEvent, create_event_bus};
use protocol::{DeviceId, RequestId, UsbError};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Tally produced by dispatching events through a single match
#[derive(Default)]
struct Tally {
    attached: usize,
    detached: usize,
    data_bytes: usize,
    errors: Vec<UsbError>,
}

impl Tally {
    fn dispatch(&mut self, event: UsbEvent) {
        match event {
            UsbEvent::Device(DeviceEvent::Attached { .. }) => self.attached += 1,
            UsbEvent::Device(DeviceEvent::Detached { .. }) => self.detached += 1,
            UsbEvent::Data(DataEvent { data, .. }) => self.data_bytes += data.len(),
            UsbEvent::Error(ErrorEvent { error, .. }) => self.errors.push(error),
        }
    }
}

// ============================================================================
// Thread → Async Flow Tests
// ============================================================================

#[tokio::test]
async fn test_blocking_publisher_async_consumer() {
    let (bus, subscriber) = create_event_bus(16);

    let publisher = thread::spawn(move || {
        bus.publish_device(DeviceEvent::Attached {
            device_id: DeviceId(1),
            parent: None,
        });
        bus.publish_data(DeviceId(1), RequestId(1), vec![0u8; 18]);
        bus.publish_error(
            DeviceId(1),
            Some(RequestId(2)),
            UsbError::ShortPacket {
                expected: 18,
                actual: 8,
            },
        );
        bus.publish_device(DeviceEvent::Detached {
            device_id: DeviceId(1),
        });
    });

    let mut tally = Tally::default();
    for _ in 0..4 {
        let event = tokio::time::timeout(TEST_TIMEOUT, subscriber.recv_event())
            .await
            .expect("Timed out waiting for event")
            .expect("Channel closed");
        tally.dispatch(event);
    }

    publisher.join().expect("Publisher thread panicked");

    assert_eq!(tally.attached, 1);
    assert_eq!(tally.detached, 1);
    assert_eq!(tally.data_bytes, 18);
    assert_eq!(
        tally.errors,
        vec![UsbError::ShortPacket {
            expected: 18,
            actual: 8
        }]
    );
}

// ============================================================================
// Ordering Tests
// ============================================================================

#[test]
fn test_per_publisher_ordering_is_preserved() {
    let (bus, subscriber) = create_event_bus(1024);

    let publishers: Vec<_> = (0..4u32)
        .map(|device| {
            let bus = bus.clone();
            thread::spawn(move || {
                for request in 0..50u64 {
                    bus.publish_data(DeviceId(device), RequestId(request), Vec::new());
                }
            })
        })
        .collect();

    for publisher in publishers {
        publisher.join().expect("Publisher thread panicked");
    }

    let mut last_seen: HashMap<DeviceId, RequestId> = HashMap::new();
    let events = subscriber.drain();
    assert_eq!(events.len(), 200);

    for event in events {
        if let UsbEvent::Data(data) = event {
            if let Some(previous) = last_seen.insert(data.device_id, data.request_id) {
                assert!(previous < data.request_id);
            }
        } else {
            panic!("unexpected event {:?}", event);
        }
    }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_close_wakes_waiting_consumer() {
    let (bus, subscriber) = create_event_bus(4);

    let waiter = tokio::spawn(async move { subscriber.recv_event().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.close();

    let result = tokio::time::timeout(TEST_TIMEOUT, waiter)
        .await
        .expect("Consumer was not woken")
        .expect("Consumer task panicked");
    assert!(result.is_err());
}

#[test]
fn test_cloned_subscribers_compete_for_events() {
    let (bus, first) = create_event_bus(8);
    let second = first.clone();

    for id in 0..6 {
        bus.publish_device(DeviceEvent::Detached {
            device_id: DeviceId(id),
        });
    }

    let a = first.try_recv();
    let b = second.try_recv();
    assert!(a.is_some() && b.is_some());
    assert_ne!(a, b);
    assert_eq!(first.drain().len() + second.drain().len(), 4);
}
