//! Device control plane
//!
//! One `UsbDevice` per physical device. It owns the session state machine:
//!
//! ```text
//! Disconnected ──attach──▶ Connected ──open──▶ Open ──set_configuration(n)──▶ Configured(n)
//!      ▲                        ▲                │                                │
//!      └──────detach────────────┴────close───────┴────────────────────────────────┘
//! ```
//!
//! Claimed interfaces and detached kernel drivers are only mutated under the
//! session lock. Transfers go through the per-session submission queue and
//! never hold that lock while they wait.

use crate::usb::queue::{QueueSettings, SubmissionQueue};
use crate::usb::request::Request;
use crate::usb::transport::{DiscoveredDevice, Transport};
use common::{DeviceEvent, EventBus};
use protocol::{
    Configuration, DescriptorTree, DescriptorType, DeviceDescriptor, DeviceHandle, DeviceId,
    DeviceRef, DeviceSpeed, RequestKind, UsbError, parse_string_descriptor, validate_standard,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    /// Present on the bus but not opened
    Connected,
    /// Open with no active configuration
    Open,
    Configured(u8),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub queue: QueueSettings,
    /// Keep string descriptors for the lifetime of the open session
    pub cache_strings: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            cache_strings: true,
        }
    }
}

#[derive(Default)]
struct Session {
    handle: Option<DeviceHandle>,
    queue: Option<Arc<SubmissionQueue>>,
    active_configuration: u8,
    claimed: BTreeSet<u8>,
    alternate_settings: BTreeMap<u8, u8>,
    detached_drivers: BTreeSet<u8>,
    languages: Option<Vec<u16>>,
    strings: HashMap<u8, String>,
    tree: Option<Arc<DescriptorTree>>,
}

impl Session {
    fn handle(&self) -> Result<DeviceHandle, UsbError> {
        self.handle.ok_or(UsbError::NotOpen)
    }

    /// Forget everything tied to the native handle
    fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct UsbDevice {
    id: DeviceId,
    device_ref: DeviceRef,
    parent: Option<DeviceId>,
    speed: DeviceSpeed,
    descriptor: DeviceDescriptor,
    transport: Arc<dyn Transport>,
    events: EventBus,
    settings: SessionSettings,
    connected: Arc<AtomicBool>,
    session: Mutex<Session>,
}

impl UsbDevice {
    /// Wrap a discovered device; it starts out disconnected until `attach`
    pub fn new(
        id: DeviceId,
        parent: Option<DeviceId>,
        discovered: &DiscoveredDevice,
        transport: Arc<dyn Transport>,
        events: EventBus,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id,
            device_ref: discovered.device_ref,
            parent,
            speed: discovered.speed,
            descriptor: discovered.descriptor,
            transport,
            events,
            settings,
            connected: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(Session::default()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn device_ref(&self) -> DeviceRef {
        self.device_ref
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    /// Device descriptor as reported at enumeration
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn is_hub(&self) -> bool {
        self.descriptor.is_hub()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<(), UsbError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(UsbError::Disconnected)
        }
    }

    /// Lock the session and require it to be open on a present device
    fn open_session(&self) -> Result<(MutexGuard<'_, Session>, DeviceHandle), UsbError> {
        self.ensure_connected()?;
        let session = self.lock();
        let handle = session.handle()?;
        Ok((session, handle))
    }

    pub fn state(&self) -> DeviceState {
        if !self.is_connected() {
            return DeviceState::Disconnected;
        }
        let session = self.lock();
        match (session.handle, session.active_configuration) {
            (None, _) => DeviceState::Connected,
            (Some(_), 0) => DeviceState::Open,
            (Some(_), n) => DeviceState::Configured(n),
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().handle.is_some()
    }

    /// Active bConfigurationValue as last set or read (0 = unconfigured)
    pub fn active_configuration(&self) -> u8 {
        self.lock().active_configuration
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.lock().claimed.iter().copied().collect()
    }

    pub fn is_claimed(&self, interface: u8) -> bool {
        self.lock().claimed.contains(&interface)
    }

    /// Whether a kernel driver was detached from `interface` by this session
    pub fn has_detached_driver(&self, interface: u8) -> bool {
        self.lock().detached_drivers.contains(&interface)
    }

    pub fn alternate_setting(&self, interface: u8) -> Option<u8> {
        self.lock().alternate_settings.get(&interface).copied()
    }

    /// Disconnected → Connected
    pub fn attach(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!("Device {} attached at {}", self.id, self.device_ref);
            self.events.publish_device(DeviceEvent::Attached {
                device_id: self.id,
                parent: self.parent,
            });
        }
    }

    /// Any state → Disconnected
    ///
    /// Requests still queued complete with `Disconnected`. Claims are dropped
    /// without talking to the device since it is gone.
    pub fn detach(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut session = self.lock();
        if let Some(queue) = session.queue.take() {
            queue.shutdown();
        }
        if let Some(handle) = session.handle.take() {
            self.transport.close(handle);
        }
        session.reset();
        drop(session);

        info!("Device {} detached", self.id);
        self.events
            .publish_device(DeviceEvent::Detached { device_id: self.id });
    }

    /// Connected → Open; a no-op when already open
    pub fn open(&self) -> Result<(), UsbError> {
        self.ensure_connected()?;
        let mut session = self.lock();
        if session.handle.is_some() {
            return Ok(());
        }

        let handle = self.transport.open(self.device_ref)?;
        let queue = match SubmissionQueue::spawn(
            self.id,
            self.transport.clone(),
            self.events.clone(),
            self.connected.clone(),
            self.settings.queue,
        ) {
            Ok(queue) => queue,
            Err(e) => {
                self.transport.close(handle);
                return Err(e);
            }
        };

        session.handle = Some(handle);
        session.queue = Some(Arc::new(queue));
        debug!("Opened device {} as {:?}", self.id, handle);
        Ok(())
    }

    /// Open → Connected; a no-op when not open
    ///
    /// Drains the submission queue, releases every claimed interface and
    /// hands detached interfaces back to their kernel drivers.
    pub fn close(&self) {
        let mut session = self.lock();
        let Some(handle) = session.handle else {
            return;
        };
        if let Some(queue) = session.queue.take() {
            queue.shutdown();
        }

        if self.is_connected() {
            let claimed: Vec<u8> = session.claimed.iter().copied().collect();
            for interface in claimed {
                if let Err(e) = self.transport.release_interface(handle, interface) {
                    warn!("Failed to release interface {}: {}", interface, e);
                }
                if session.detached_drivers.remove(&interface) {
                    self.reattach_driver(handle, interface);
                }
            }
        }

        self.transport.close(handle);
        session.reset();
        debug!("Closed device {}", self.id);
    }

    fn reattach_driver(&self, handle: DeviceHandle, interface: u8) {
        match self.transport.attach_kernel_driver(handle, interface) {
            Ok(()) => debug!(
                "Reattached kernel driver to interface {} on device {}",
                interface, self.id
            ),
            Err(e) => warn!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            ),
        }
    }

    /// Activate configuration `value` (0 unconfigures)
    ///
    /// Refused while any interface is claimed.
    pub fn set_configuration(&self, value: u8) -> Result<(), UsbError> {
        let (mut session, handle) = self.open_session()?;
        if !session.claimed.is_empty() {
            return Err(UsbError::ConfigurationBusy {
                claimed: session.claimed.len(),
            });
        }
        if value != 0 && !self.load_tree(&mut session, handle)?.contains_configuration(value) {
            return Err(UsbError::NoSuchConfiguration(value));
        }

        self.transport.set_configuration(handle, value)?;
        session.active_configuration = value;
        session.alternate_settings.clear();
        debug!("Device {} configuration set to {}", self.id, value);
        Ok(())
    }

    /// Read the active configuration from the device
    pub fn get_configuration(&self) -> Result<u8, UsbError> {
        let request = Request::from_setup(&protocol::get_configuration())?;
        self.submit(&request)?;
        let value = request.actual_data().and_then(|d| d.first().copied());
        let value = value.ok_or(UsbError::ShortPacket {
            expected: 1,
            actual: 0,
        })?;
        self.lock().active_configuration = value;
        Ok(value)
    }

    /// Claim `interface` for this session
    ///
    /// With `force`, a kernel driver bound to the interface is detached
    /// first and reattached when the interface is released.
    pub fn claim_interface(&self, interface: u8, force: bool) -> Result<(), UsbError> {
        let (mut session, handle) = self.open_session()?;
        if session.claimed.contains(&interface) {
            return Err(UsbError::AlreadyClaimed { interface });
        }

        let mut detached = false;
        if force && self.transport.is_kernel_driver_active(handle, interface)? {
            debug!(
                "Detaching kernel driver from interface {} on device {}",
                interface, self.id
            );
            self.transport.detach_kernel_driver(handle, interface)?;
            detached = true;
        }

        if let Err(e) = self.transport.claim_interface(handle, interface) {
            warn!("Failed to claim interface {}: {}", interface, e);
            if detached && !e.is_disconnect() {
                self.reattach_driver(handle, interface);
            }
            return Err(e);
        }

        session.claimed.insert(interface);
        if detached {
            session.detached_drivers.insert(interface);
        }
        debug!("Claimed interface {} on device {}", interface, self.id);
        Ok(())
    }

    /// Release `interface`, then reattach its kernel driver if claim detached one
    pub fn release_interface(&self, interface: u8) -> Result<(), UsbError> {
        let (mut session, handle) = self.open_session()?;
        if !session.claimed.contains(&interface) {
            return Err(UsbError::NotClaimed { interface });
        }

        self.transport.release_interface(handle, interface)?;
        session.claimed.remove(&interface);
        session.alternate_settings.remove(&interface);
        debug!("Released interface {} on device {}", interface, self.id);

        if session.detached_drivers.remove(&interface) {
            self.transport.attach_kernel_driver(handle, interface)?;
            debug!(
                "Reattached kernel driver to interface {} on device {}",
                interface, self.id
            );
        }
        Ok(())
    }

    /// Select an alternate setting on a claimed interface
    pub fn set_interface(&self, interface: u8, setting: u8) -> Result<(), UsbError> {
        let (mut session, handle) = self.open_session()?;
        if !session.claimed.contains(&interface) {
            return Err(UsbError::NotClaimed { interface });
        }
        self.transport
            .set_alternate_setting(handle, interface, setting)?;
        session.alternate_settings.insert(interface, setting);
        Ok(())
    }

    /// Fetch and decode the device descriptor
    pub fn device_descriptor(&self) -> Result<DeviceDescriptor, UsbError> {
        let (_session, handle) = self.open_session()?;
        let raw = self
            .transport
            .raw_descriptor(handle, DescriptorType::Device, 0, 0)?;
        Ok(DeviceDescriptor::parse(&raw)?)
    }

    /// Every configuration the device declares, fetched once per session
    pub fn configuration_tree(&self) -> Result<Arc<DescriptorTree>, UsbError> {
        let (mut session, handle) = self.open_session()?;
        self.load_tree(&mut session, handle)
    }

    fn load_tree(
        &self,
        session: &mut Session,
        handle: DeviceHandle,
    ) -> Result<Arc<DescriptorTree>, UsbError> {
        if let Some(tree) = &session.tree {
            return Ok(tree.clone());
        }

        let raw = self
            .transport
            .raw_descriptor(handle, DescriptorType::Device, 0, 0)?;
        let device = DeviceDescriptor::parse(&raw)?;
        let mut configurations = Vec::with_capacity(device.num_configurations as usize);
        for index in 0..device.num_configurations {
            let raw = self
                .transport
                .raw_descriptor(handle, DescriptorType::Configuration, index, 0)?;
            configurations.push(Configuration::parse(&raw)?);
        }

        let tree = Arc::new(DescriptorTree::new(device, configurations)?);
        session.tree = Some(tree.clone());
        Ok(tree)
    }

    /// Read string descriptor `index` in the device's first language
    ///
    /// Index 0 means "no string" and returns `None` without any I/O, as does
    /// a device that reports no languages.
    pub fn get_string_descriptor(&self, index: u8) -> Result<Option<String>, UsbError> {
        if index == 0 {
            return Ok(None);
        }
        let (mut session, handle) = self.open_session()?;
        if let Some(cached) = session.strings.get(&index) {
            return Ok(Some(cached.clone()));
        }

        let languages = match &session.languages {
            Some(languages) => languages.clone(),
            None => {
                let languages = self.transport.supported_languages(handle)?;
                debug!("Device {} languages: {:04x?}", self.id, languages);
                session.languages = Some(languages.clone());
                languages
            }
        };
        let Some(&lang_id) = languages.first() else {
            return Ok(None);
        };

        let raw = self
            .transport
            .raw_descriptor(handle, DescriptorType::String, index, lang_id)?;
        let value = parse_string_descriptor(&raw)?;
        if self.settings.cache_strings {
            session.strings.insert(index, value.clone());
        }
        Ok(Some(value))
    }

    pub fn manufacturer(&self) -> Result<Option<String>, UsbError> {
        self.get_string_descriptor(self.descriptor.manufacturer_index)
    }

    pub fn product(&self) -> Result<Option<String>, UsbError> {
        self.get_string_descriptor(self.descriptor.product_index)
    }

    pub fn serial_number(&self) -> Result<Option<String>, UsbError> {
        self.get_string_descriptor(self.descriptor.serial_number_index)
    }

    /// Validate and queue requests in order
    fn enqueue(&self, requests: &[Request]) -> Result<(), UsbError> {
        let (queue, handle) = {
            let (session, handle) = self.open_session()?;
            let queue = session.queue.clone().ok_or(UsbError::NotOpen)?;
            (queue, handle)
        };

        for request in requests {
            let setup = request.setup()?;
            if request.request_type().kind == RequestKind::Standard {
                validate_standard(&setup)?;
            }
        }
        queue.enqueue(handle, requests)
    }

    /// Submit and block until completion; returns the actual length
    pub fn submit(&self, request: &Request) -> Result<usize, UsbError> {
        self.enqueue(std::slice::from_ref(request))?;
        request.wait_until_complete(None);
        match request.outcome() {
            Some(outcome) => outcome,
            None => Err(UsbError::IllegalState(format!(
                "request {} woke without an outcome",
                request.id().0
            ))),
        }
    }

    /// Submit and return at once; completion is observed on the request or
    /// as a data/error event
    pub fn submit_async(&self, request: &Request) -> Result<(), UsbError> {
        self.enqueue(std::slice::from_ref(request))
    }

    /// Run requests back to back and wait for all of them
    ///
    /// Every member completes on its own; the first error in order is returned.
    pub fn submit_batch(&self, requests: &[Request]) -> Result<(), UsbError> {
        self.enqueue(requests)?;
        let mut first_error = None;
        for request in requests {
            request.wait_until_complete(None);
            if first_error.is_none() {
                first_error = request.error();
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn submit_batch_async(&self, requests: &[Request]) -> Result<(), UsbError> {
        self.enqueue(requests)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}
