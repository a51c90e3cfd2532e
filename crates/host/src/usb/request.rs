//! Transfer request (IRP) model
//!
//! A `Request` is a cheap, clonable handle to one control transfer record.
//! The caller fills it in while it is idle, the submission queue moves it to
//! submitted and hands a private copy of the data stage to the transport,
//! and completion writes the result back exactly once.
//!
//! ```text
//! Idle ──submit──▶ Submitted ──complete──▶ Completed(Ok(actual) | Err(error))
//! ```
//!
//! Every accessor returns copies. Nothing outside this module can alias the
//! buffer while a transfer is in flight.

use protocol::{ControlSetupPacket, RequestDirection, RequestId, RequestType, UsbError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle phase of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Submitted,
    Completed,
}

#[derive(Debug)]
struct Inner {
    request_type: RequestType,
    request: u8,
    value: u16,
    index: u16,
    buffer: Vec<u8>,
    offset: usize,
    length: usize,
    accept_short_packet: bool,
    state: RequestState,
    outcome: Option<Result<usize, UsbError>>,
}

#[derive(Debug)]
struct Shared {
    id: RequestId,
    inner: Mutex<Inner>,
    completed: Condvar,
}

/// A control transfer request
#[derive(Debug, Clone)]
pub struct Request {
    shared: Arc<Shared>,
}

/// The private copy of a request handed to the transport
#[derive(Debug)]
pub(crate) struct Transfer {
    pub setup: ControlSetupPacket,
    pub buffer: Vec<u8>,
}

impl Request {
    /// Create an idle request with no data stage
    pub fn new(request_type: RequestType, request: u8, value: u16, index: u16) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
                inner: Mutex::new(Inner {
                    request_type,
                    request,
                    value,
                    index,
                    buffer: Vec::new(),
                    offset: 0,
                    length: 0,
                    accept_short_packet: true,
                    state: RequestState::Idle,
                    outcome: None,
                }),
                completed: Condvar::new(),
            }),
        }
    }

    /// Create a request from a prebuilt setup packet
    ///
    /// IN requests get a zeroed buffer of wLength bytes. OUT requests start
    /// with no data stage; supply one with `set_data`.
    pub fn from_setup(setup: &ControlSetupPacket) -> Result<Self, UsbError> {
        let request_type = setup.request_type()?;
        let request = Self::new(request_type, setup.request(), setup.value(), setup.index());
        if request_type.direction == RequestDirection::DeviceToHost {
            request.set_data(vec![0u8; setup.length() as usize])?;
        }
        Ok(request)
    }

    pub fn id(&self) -> RequestId {
        self.shared.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_idle(&self) -> Result<MutexGuard<'_, Inner>, UsbError> {
        let inner = self.lock();
        if inner.state != RequestState::Idle {
            return Err(UsbError::IllegalState(format!(
                "request {} is {:?}, not idle",
                self.shared.id.0, inner.state
            )));
        }
        Ok(inner)
    }

    pub fn request_type(&self) -> RequestType {
        self.lock().request_type
    }

    pub fn direction(&self) -> RequestDirection {
        self.lock().request_type.direction
    }

    pub fn request(&self) -> u8 {
        self.lock().request
    }

    pub fn value(&self) -> u16 {
        self.lock().value
    }

    pub fn index(&self) -> u16 {
        self.lock().index
    }

    /// Use the whole buffer as the data stage
    pub fn set_data(&self, buffer: Vec<u8>) -> Result<(), UsbError> {
        let length = buffer.len();
        self.set_data_range(buffer, 0, length)
    }

    /// Use `buffer[offset..offset + length]` as the data stage
    pub fn set_data_range(
        &self,
        buffer: Vec<u8>,
        offset: usize,
        length: usize,
    ) -> Result<(), UsbError> {
        let capacity = buffer.len();
        if offset.checked_add(length).is_none_or(|end| end > capacity) {
            return Err(UsbError::InvalidBuffer {
                offset,
                length,
                capacity,
            });
        }
        let mut inner = self.lock_idle()?;
        inner.buffer = buffer;
        inner.offset = offset;
        inner.length = length;
        Ok(())
    }

    /// Copy of the whole buffer
    pub fn buffer(&self) -> Vec<u8> {
        self.lock().buffer.clone()
    }

    /// Copy of the data stage window
    pub fn data(&self) -> Vec<u8> {
        let inner = self.lock();
        inner.buffer[inner.offset..inner.offset + inner.length].to_vec()
    }

    /// Copy of the bytes actually transferred; None unless completed successfully
    pub fn actual_data(&self) -> Option<Vec<u8>> {
        let inner = self.lock();
        match inner.outcome {
            Some(Ok(actual)) => Some(inner.buffer[inner.offset..inner.offset + actual].to_vec()),
            _ => None,
        }
    }

    pub fn offset(&self) -> usize {
        self.lock().offset
    }

    pub fn length(&self) -> usize {
        self.lock().length
    }

    pub fn set_accept_short_packet(&self, accept: bool) -> Result<(), UsbError> {
        self.lock_idle()?.accept_short_packet = accept;
        Ok(())
    }

    pub fn accept_short_packet(&self) -> bool {
        self.lock().accept_short_packet
    }

    /// The setup packet this request serializes to
    pub fn setup(&self) -> Result<ControlSetupPacket, UsbError> {
        let inner = self.lock();
        Self::build_setup(&inner)
    }

    fn build_setup(inner: &Inner) -> Result<ControlSetupPacket, UsbError> {
        let length = u16::try_from(inner.length)
            .map_err(|_| protocol::ProtocolError::DataStageTooLong(inner.length))?;
        Ok(ControlSetupPacket::for_buffer(
            inner.request_type,
            inner.request,
            inner.value,
            inner.index,
            length,
            inner.length,
        )?)
    }

    pub fn state(&self) -> RequestState {
        self.lock().state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == RequestState::Completed
    }

    /// Bytes transferred; valid only after a successful completion
    pub fn actual_length(&self) -> Option<usize> {
        match self.lock().outcome {
            Some(Ok(actual)) => Some(actual),
            _ => None,
        }
    }

    /// Error carried by a failed completion
    pub fn error(&self) -> Option<UsbError> {
        match &self.lock().outcome {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<Result<usize, UsbError>> {
        self.lock().outcome.clone()
    }

    /// Block until completion or until `timeout` elapses
    ///
    /// `None` or a zero duration waits without bound. Returns whether the
    /// request completed. A timeout only releases the caller; the transfer
    /// itself carries on.
    pub fn wait_until_complete(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        let mut inner = self.lock();

        while inner.state != RequestState::Completed {
            match deadline {
                None => {
                    inner = self
                        .shared
                        .completed
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    inner = self
                        .shared
                        .completed
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }

    /// Idle → Submitted, returning the private transfer copy
    pub(crate) fn begin(&self) -> Result<Transfer, UsbError> {
        let mut inner = self.lock_idle()?;
        let setup = Self::build_setup(&inner)?;
        let buffer = match inner.request_type.direction {
            RequestDirection::DeviceToHost => vec![0u8; inner.length],
            RequestDirection::HostToDevice => {
                inner.buffer[inner.offset..inner.offset + inner.length].to_vec()
            }
        };
        inner.state = RequestState::Submitted;
        trace!("Request {} submitted: {}", self.shared.id.0, setup);
        Ok(Transfer { setup, buffer })
    }

    /// Submitted → Idle for a request that never reached the transport
    pub(crate) fn rollback(&self) {
        let mut inner = self.lock();
        if inner.state == RequestState::Submitted {
            inner.state = RequestState::Idle;
        }
    }

    /// Record the transport result and wake every waiter
    ///
    /// Inbound bytes are copied into the data window even when the short
    /// packet policy turns the outcome into an error. A second completion
    /// is rejected.
    pub(crate) fn complete(
        &self,
        result: Result<usize, UsbError>,
        received: &[u8],
    ) -> Result<(), UsbError> {
        let mut inner = self.lock();
        if inner.state == RequestState::Completed {
            return Err(UsbError::IllegalState(format!(
                "request {} completed twice",
                self.shared.id.0
            )));
        }

        let inbound = inner.request_type.direction == RequestDirection::DeviceToHost;
        let outcome = match result {
            Ok(actual) if inbound => {
                let actual = actual.min(inner.length).min(received.len());
                let start = inner.offset;
                inner.buffer[start..start + actual].copy_from_slice(&received[..actual]);
                if actual < inner.length && !inner.accept_short_packet {
                    Err(UsbError::ShortPacket {
                        expected: inner.length,
                        actual,
                    })
                } else {
                    Ok(actual)
                }
            }
            Ok(actual) => Ok(actual.min(inner.length)),
            Err(e) => Err(e),
        };

        trace!("Request {} completed: {:?}", self.shared.id.0, outcome);
        inner.outcome = Some(outcome);
        inner.state = RequestState::Completed;
        drop(inner);
        self.shared.completed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{DescriptorType, STANDARD_IN_FROM_DEVICE, VENDOR_OUT_TO_DEVICE, get_descriptor};
    use std::thread;

    fn device_descriptor_request() -> Request {
        Request::from_setup(&get_descriptor(DescriptorType::Device, 0, 0, 18)).unwrap()
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = device_descriptor_request();
        let b = device_descriptor_request();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_from_setup_allocates_in_buffer() {
        let request = device_descriptor_request();
        assert_eq!(request.length(), 18);
        assert_eq!(request.state(), RequestState::Idle);
        assert_eq!(
            request.setup().unwrap().as_bytes(),
            &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
    }

    #[test]
    fn test_set_data_range_rejects_out_of_range() {
        let request = Request::new(VENDOR_OUT_TO_DEVICE, 0x01, 0, 0);
        assert_eq!(
            request.set_data_range(vec![0; 8], 4, 5),
            Err(UsbError::InvalidBuffer {
                offset: 4,
                length: 5,
                capacity: 8
            })
        );
        assert!(matches!(
            request.set_data_range(vec![0; 8], usize::MAX, 2),
            Err(UsbError::InvalidBuffer { .. })
        ));
        request.set_data_range(vec![1, 2, 3, 4, 5], 1, 3).unwrap();
        assert_eq!(request.data(), vec![2, 3, 4]);
        assert_eq!(request.setup().unwrap().length(), 3);
    }

    #[test]
    fn test_reads_are_copies() {
        let request = Request::new(VENDOR_OUT_TO_DEVICE, 0x01, 0, 0);
        request.set_data(vec![1, 2, 3]).unwrap();
        let mut copy = request.data();
        copy[0] = 0xFF;
        assert_eq!(request.data(), vec![1, 2, 3]);

        let transfer = request.begin().unwrap();
        assert_eq!(transfer.buffer, vec![1, 2, 3]);
    }

    #[test]
    fn test_mutation_rejected_after_submit() {
        let request = device_descriptor_request();
        request.begin().unwrap();
        assert_eq!(request.state(), RequestState::Submitted);
        assert!(matches!(
            request.set_data(vec![0; 4]),
            Err(UsbError::IllegalState(_))
        ));
        assert!(matches!(request.begin(), Err(UsbError::IllegalState(_))));
    }

    #[test]
    fn test_complete_twice_is_detected() {
        let request = device_descriptor_request();
        request.begin().unwrap();
        request.complete(Ok(18), &[0u8; 18]).unwrap();
        assert!(matches!(
            request.complete(Ok(18), &[0u8; 18]),
            Err(UsbError::IllegalState(_))
        ));
        assert_eq!(request.actual_length(), Some(18));
    }

    #[test]
    fn test_short_packet_policy() {
        let accepted = device_descriptor_request();
        accepted.begin().unwrap();
        accepted.complete(Ok(8), &[7u8; 8]).unwrap();
        assert_eq!(accepted.actual_length(), Some(8));
        assert_eq!(accepted.actual_data(), Some(vec![7u8; 8]));

        let rejected = device_descriptor_request();
        rejected.set_accept_short_packet(false).unwrap();
        rejected.begin().unwrap();
        rejected.complete(Ok(8), &[7u8; 8]).unwrap();
        assert_eq!(
            rejected.error(),
            Some(UsbError::ShortPacket {
                expected: 18,
                actual: 8
            })
        );
        assert_eq!(rejected.actual_length(), None);
        // Bytes still landed in the buffer
        assert_eq!(&rejected.buffer()[..8], &[7u8; 8]);
    }

    #[test]
    fn test_error_and_length_are_exclusive() {
        let request = Request::new(STANDARD_IN_FROM_DEVICE, 0x00, 0, 0);
        request.set_data(vec![0; 2]).unwrap();
        request.begin().unwrap();
        request.complete(Err(UsbError::Disconnected), &[]).unwrap();
        assert_eq!(request.error(), Some(UsbError::Disconnected));
        assert_eq!(request.actual_length(), None);
        assert_eq!(request.actual_data(), None);
    }

    #[test]
    fn test_wait_times_out_without_completion() {
        let request = device_descriptor_request();
        assert!(!request.wait_until_complete(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let request = device_descriptor_request();
        request.begin().unwrap();

        let producer = request.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete(Ok(18), &[1u8; 18]).unwrap();
        });

        // Zero means unbounded
        assert!(request.wait_until_complete(Some(Duration::ZERO)));
        assert!(request.is_complete());
        handle.join().unwrap();
    }
}
