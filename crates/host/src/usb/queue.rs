//! Per-device submission queue
//!
//! Control pipes are serial, so every device session gets one dedicated
//! worker thread fed by a bounded channel. Every submitted request runs on
//! that worker: at most one submitted transfer is in flight and requests
//! complete in the order they were enqueued. A batch is one channel message,
//! so no other caller's request can land between its members.
//!
//! Descriptor and string fetches made by the session itself go through
//! `Transport::raw_descriptor` on the caller's thread instead; the transport
//! serializes those with its own per-handle lock.

use crate::usb::request::{Request, Transfer};
use crate::usb::transport::Transport;
use common::EventBus;
use protocol::{DeviceHandle, DeviceId, UsbError};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default timeout for a single control transfer (5 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of pending jobs before submitters block
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub timeout: Duration,
    pub depth: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// A run of requests executed back to back
struct Job {
    handle: DeviceHandle,
    requests: Vec<(Request, Transfer)>,
}

pub struct SubmissionQueue {
    device_id: DeviceId,
    tx: async_channel::Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SubmissionQueue {
    /// Start the worker thread for one device session
    ///
    /// `connected` is shared with the owning session; once it drops to false
    /// every request still queued completes with `Disconnected` without
    /// touching the transport.
    pub fn spawn(
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        events: EventBus,
        connected: Arc<AtomicBool>,
        settings: QueueSettings,
    ) -> Result<Self, UsbError> {
        let (tx, rx) = async_channel::bounded(settings.depth.max(1));
        let worker = QueueWorker {
            device_id,
            transport,
            events,
            connected,
            timeout: settings.timeout,
            rx,
        };

        let handle = std::thread::Builder::new()
            .name(format!("usb-queue-{}", device_id))
            .spawn(move || worker.run())
            .map_err(|e| UsbError::Platform {
                code: e.raw_os_error().unwrap_or(-99),
                message: format!("failed to spawn queue worker: {}", e),
            })?;

        debug!("Submission queue started for {}", device_id);
        Ok(Self {
            device_id,
            tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue requests to run in order without interleaving
    ///
    /// Every request moves to Submitted before anything is queued. If one of
    /// them cannot be submitted the whole call fails and the others return
    /// to Idle. Blocks while the queue is full.
    pub fn enqueue(&self, handle: DeviceHandle, requests: &[Request]) -> Result<(), UsbError> {
        let mut staged = Vec::with_capacity(requests.len());
        for request in requests {
            match request.begin() {
                Ok(transfer) => staged.push((request.clone(), transfer)),
                Err(e) => {
                    for (begun, _) in &staged {
                        begun.rollback();
                    }
                    return Err(e);
                }
            }
        }

        let job = Job {
            handle,
            requests: staged,
        };
        self.tx.send_blocking(job).map_err(|rejected| {
            // Worker has shut down; nothing will ever complete these
            for (request, _) in &rejected.into_inner().requests {
                request.rollback();
            }
            UsbError::Disconnected
        })
    }

    /// Number of jobs waiting for the worker
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Stop accepting work, let the worker drain, and join it
    pub fn shutdown(&self) {
        self.tx.close();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("Submission queue worker for {} panicked", self.device_id);
        }
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct QueueWorker {
    device_id: DeviceId,
    transport: Arc<dyn Transport>,
    events: EventBus,
    connected: Arc<AtomicBool>,
    timeout: Duration,
    rx: async_channel::Receiver<Job>,
}

impl QueueWorker {
    fn run(self) {
        info!("Submission queue worker for {} started", self.device_id);

        // Ends once the sender is closed and every queued job has run
        while let Ok(job) = self.rx.recv_blocking() {
            for (request, transfer) in job.requests {
                self.execute(job.handle, request, transfer);
            }
        }

        info!("Submission queue worker for {} stopped", self.device_id);
    }

    fn execute(&self, handle: DeviceHandle, request: Request, transfer: Transfer) {
        let Transfer { setup, mut buffer } = transfer;

        let result = if self.connected.load(Ordering::Acquire) {
            // Keep the worker alive if the transport panics
            catch_unwind(AssertUnwindSafe(|| {
                self.transport
                    .control_transfer(handle, &setup, &mut buffer, self.timeout)
            }))
            .unwrap_or_else(|panic| {
                error!("Panic in transport during {}: {:?}", setup, panic);
                Err(UsbError::Platform {
                    code: -99,
                    message: "transport panicked".to_string(),
                })
            })
        } else {
            Err(UsbError::Disconnected)
        };

        if let Err(e) = &result {
            warn!(
                "Control transfer {} on {} failed: {}",
                setup, self.device_id, e
            );
        }

        if let Err(e) = request.complete(result, &buffer) {
            error!("{}", e);
            return;
        }

        match request.outcome() {
            Some(Ok(_)) => self.events.publish_data(
                self.device_id,
                request.id(),
                request.actual_data().unwrap_or_default(),
            ),
            Some(Err(e)) => self
                .events
                .publish_error(self.device_id, Some(request.id()), e),
            None => {}
        }
    }
}
