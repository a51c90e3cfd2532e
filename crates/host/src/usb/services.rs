//! Host services registry
//!
//! Process-wide state for one host: the transport, the event bus and every
//! known device keyed by `DeviceId`. Nothing here is global; callers create
//! a `HostServices`, initialize it with the first `scan`, and tear it down
//! with `shutdown`.
//!
//! The hub topology is stored as IDs only. A device knows its parent's ID,
//! a hub node lists its children's IDs, and traversal always goes back
//! through the registry.

use crate::usb::device::{SessionSettings, UsbDevice};
use crate::usb::transport::{DiscoveredDevice, Transport};
use common::EventBus;
use protocol::{DeviceId, DeviceRef, UsbError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct Node {
    device: Arc<UsbDevice>,
    children: Vec<DeviceId>,
}

#[derive(Default)]
struct Registry {
    nodes: BTreeMap<DeviceId, Node>,
    by_ref: HashMap<DeviceRef, DeviceId>,
    next_device_id: u32,
    initialized: bool,
    shut_down: bool,
}

impl Registry {
    /// IDs of `id` and everything below it, children before parents
    fn subtree(&self, id: DeviceId, out: &mut Vec<DeviceId>) {
        if let Some(node) = self.nodes.get(&id) {
            for child in &node.children {
                self.subtree(*child, out);
            }
            out.push(id);
        }
    }
}

pub struct HostServices {
    transport: Arc<dyn Transport>,
    events: EventBus,
    settings: SessionSettings,
    registry: Mutex<Registry>,
}

impl HostServices {
    pub fn new(transport: Arc<dyn Transport>, events: EventBus, settings: SessionSettings) -> Self {
        Self {
            transport,
            events,
            settings,
            registry: Mutex::new(Registry {
                next_device_id: 1,
                ..Registry::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Reconcile the registry with the bus
    ///
    /// The first call initializes the services. New devices are registered
    /// and attached parents first; devices no longer on the bus are
    /// detached. Returns the IDs attached by this scan.
    pub fn scan(&self) -> Result<Vec<DeviceId>, UsbError> {
        if self.lock().shut_down {
            return Err(UsbError::IllegalState(
                "host services already shut down".to_string(),
            ));
        }
        let discovered = self.transport.enumerate()?;

        let present: HashSet<DeviceRef> = discovered.iter().map(|d| d.device_ref).collect();
        let gone: Vec<DeviceId> = {
            let registry = self.lock();
            registry
                .by_ref
                .iter()
                .filter(|(device_ref, _)| !present.contains(device_ref))
                .map(|(_, id)| *id)
                .collect()
        };
        for id in gone {
            self.detach(id);
        }

        let mut attached = Vec::new();
        let mut registry = self.lock();
        let mut pending: Vec<&DiscoveredDevice> = discovered
            .iter()
            .filter(|d| !registry.by_ref.contains_key(&d.device_ref))
            .collect();

        // Parents first: take whatever has its parent registered (or no
        // parent on this bus at all) until nothing is left
        while !pending.is_empty() {
            let (ready, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|d| {
                d.parent.is_none_or(|p| registry.by_ref.contains_key(&p) || !present.contains(&p))
            });
            if ready.is_empty() {
                // Parent cycle in the transport's report; register as roots
                for d in rest {
                    attached.push(self.register(&mut registry, d, None));
                }
                break;
            }
            for d in ready {
                let parent = d.parent.and_then(|p| registry.by_ref.get(&p).copied());
                attached.push(self.register(&mut registry, d, parent));
            }
            pending = rest;
        }

        if !registry.initialized {
            registry.initialized = true;
            info!(
                "Host services initialized with {} devices",
                registry.nodes.len()
            );
        }
        let devices: Vec<Arc<UsbDevice>> = attached
            .iter()
            .filter_map(|id| registry.nodes.get(id).map(|n| n.device.clone()))
            .collect();
        drop(registry);

        for device in devices {
            device.attach();
        }
        Ok(attached)
    }

    fn register(
        &self,
        registry: &mut Registry,
        discovered: &DiscoveredDevice,
        parent: Option<DeviceId>,
    ) -> DeviceId {
        let id = DeviceId(registry.next_device_id);
        registry.next_device_id += 1;

        let device = Arc::new(UsbDevice::new(
            id,
            parent,
            discovered,
            self.transport.clone(),
            self.events.clone(),
            self.settings,
        ));
        debug!(
            "Registered {} at {} ({:04x}:{:04x}), parent {:?}",
            id,
            discovered.device_ref,
            discovered.descriptor.vendor_id,
            discovered.descriptor.product_id,
            parent
        );

        if let Some(node) = parent.and_then(|p| registry.nodes.get_mut(&p)) {
            node.children.push(id);
        }
        registry.by_ref.insert(discovered.device_ref, id);
        registry.nodes.insert(
            id,
            Node {
                device,
                children: Vec::new(),
            },
        );
        id
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<UsbDevice>> {
        self.lock().nodes.get(&id).map(|n| n.device.clone())
    }

    pub fn find(&self, device_ref: DeviceRef) -> Option<Arc<UsbDevice>> {
        let registry = self.lock();
        let id = registry.by_ref.get(&device_ref)?;
        registry.nodes.get(id).map(|n| n.device.clone())
    }

    /// Every registered device in ID order
    pub fn devices(&self) -> Vec<Arc<UsbDevice>> {
        self.lock()
            .nodes
            .values()
            .map(|n| n.device.clone())
            .collect()
    }

    pub fn children(&self, id: DeviceId) -> Vec<DeviceId> {
        self.lock()
            .nodes
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Devices without a registered parent
    pub fn roots(&self) -> Vec<DeviceId> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, n)| n.device.parent().is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Detach a device and everything attached below it
    ///
    /// Children are force-disconnected depth first before their hub. Returns
    /// the IDs in the order they were detached.
    pub fn detach(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut order = Vec::new();
        let mut removed = Vec::new();
        {
            let mut registry = self.lock();
            registry.subtree(id, &mut order);
            for child in &order {
                if let Some(node) = registry.nodes.remove(child) {
                    registry.by_ref.remove(&node.device.device_ref());
                    removed.push(node.device);
                }
            }
            let parent = removed.last().and_then(|d| d.parent());
            if let Some(node) = parent.and_then(|p| registry.nodes.get_mut(&p)) {
                node.children.retain(|c| *c != id);
            }
        }

        for device in removed {
            device.detach();
        }
        order
    }

    /// Detach every device and close the event bus
    pub fn shutdown(&self) {
        let roots = {
            let mut registry = self.lock();
            if registry.shut_down {
                return;
            }
            registry.shut_down = true;
            registry
                .nodes
                .iter()
                .filter(|(_, n)| n.device.parent().is_none())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
        };
        for root in roots {
            self.detach(root);
        }
        self.events.close();
        info!("Host services shut down");
    }
}

impl Drop for HostServices {
    fn drop(&mut self) {
        self.shutdown();
    }
}
