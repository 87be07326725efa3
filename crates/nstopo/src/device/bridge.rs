//! Bridge devices and their port membership.

use std::collections::BTreeMap;

use super::{DeviceCommand, DeviceKind, DeviceSnapshot, LinkActor, LinkDevice};
use crate::events::{BridgeEvent, DeviceEvent, Notification, NotificationHub};

/// A bridge: a link device plus the set of enslaved ports.
///
/// Ports are keyed by a monotonically increasing slot, so iteration order
/// is join order and removing one port leaves the others in place.
#[derive(Debug, Clone)]
pub struct Bridge {
    base: LinkDevice,
    ports: BTreeMap<u64, u32>,
    next_slot: u64,
}

impl Bridge {
    pub fn new(base: LinkDevice) -> Self {
        Self {
            base,
            ports: BTreeMap::new(),
            next_slot: 0,
        }
    }

    /// Current ports in join order.
    pub fn ports(&self) -> Vec<u32> {
        self.ports.values().copied().collect()
    }

    pub fn has_port(&self, index: u32) -> bool {
        self.ports.values().any(|&p| p == index)
    }

    /// Returns `true` if the port was not already a member.
    pub fn add_port(&mut self, index: u32) -> bool {
        if self.has_port(index) {
            return false;
        }
        self.ports.insert(self.next_slot, index);
        self.next_slot += 1;
        true
    }

    /// Returns `true` if the port was a member.
    pub fn remove_port(&mut self, index: u32) -> bool {
        let slot = self
            .ports
            .iter()
            .find_map(|(&slot, &p)| (p == index).then_some(slot));
        match slot {
            Some(slot) => {
                self.ports.remove(&slot);
                true
            }
            None => false,
        }
    }

    fn publish(&self, hub: &NotificationHub, event: BridgeEvent, port: Option<u32>) {
        hub.publish(Notification::Bridge {
            event,
            device: self.snapshot(),
            port,
        });
    }
}

impl LinkActor for Bridge {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Bridge
    }

    fn base(&self) -> &LinkDevice {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LinkDevice {
        &mut self.base
    }

    fn snapshot(&self) -> DeviceSnapshot {
        let mut snapshot = self.base.snapshot(DeviceKind::Bridge);
        snapshot.ports = Some(self.ports());
        snapshot
    }

    fn created(&self, hub: &NotificationHub) {
        hub.publish(Notification::Device {
            event: DeviceEvent::Create,
            device: self.snapshot(),
        });
        self.publish(hub, BridgeEvent::Create, None);
    }

    fn deleted(&self, hub: &NotificationHub) {
        self.publish(hub, BridgeEvent::Delete, None);
        hub.publish(Notification::Device {
            event: DeviceEvent::Delete,
            device: self.snapshot(),
        });
    }

    fn handle(&mut self, command: DeviceCommand, hub: &NotificationHub) {
        match command {
            DeviceCommand::AddPort(port) => {
                if self.add_port(port) {
                    self.publish(hub, BridgeEvent::PortAdded, Some(port));
                }
            }
            DeviceCommand::RemovePort(port) => {
                if self.remove_port(port) {
                    self.publish(hub, BridgeEvent::PortRemoved, Some(port));
                } else {
                    tracing::debug!(port, "not a port of this bridge");
                }
            }
            other => tracing::debug!(command = ?other, "command not supported by bridge, ignored"),
        }
    }
}
