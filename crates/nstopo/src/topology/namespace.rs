//! The per-namespace aggregate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ipnet::IpNet;
use serde::Serialize;

use super::endpoint::namespace_of;
use super::pairing::PeerEvent;
use super::Topology;
use crate::config::TopologyConfig;
use crate::device::l3::{self, L3Device, L3Handle, L3Snapshot};
use crate::device::veth::{PeerResolution, resolve_peer};
use crate::device::{self, DeviceHandle, DeviceKind, DeviceSnapshot, LinkDevice};
use crate::events::{NamespaceEvent, Notification, NotificationHub};
use crate::update::{AddrUpdate, LinkUpdate, OperState, Route, RouteUpdate, TopologyUpdate, UpdateKind};
use crate::{Error, Result};

/// Whether any device in the namespace carries layer-3 addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    #[default]
    Bridged,
    Network,
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bridged => "bridged",
            Self::Network => "network",
        })
    }
}

/// Point-in-time view of a namespace, without its devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceSnapshot {
    pub name: String,
    pub kind: NamespaceKind,
    /// Connected endpoints, `<namespace>:<index>` or bare namespace names.
    pub connections: Vec<String>,
    pub routes: Vec<Route>,
}

impl NamespaceSnapshot {
    /// Distinct namespaces this one is connected to.
    pub fn peers(&self) -> Vec<&str> {
        let peers: BTreeSet<&str> = self.connections.iter().map(|c| namespace_of(c)).collect();
        peers.into_iter().collect()
    }
}

/// A device with its address set, if it has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDump {
    pub device: DeviceSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<L3Snapshot>,
}

/// A namespace with every device it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceDump {
    pub namespace: NamespaceSnapshot,
    pub devices: Vec<DeviceDump>,
}

#[derive(Debug, Default)]
struct State {
    kind: NamespaceKind,
    devices: BTreeMap<u32, DeviceHandle>,
    addresses: BTreeMap<u32, L3Handle>,
    /// Device index to master index, mirrored so port changes can be routed
    /// without asking the device.
    masters: BTreeMap<u32, u32>,
    routes: Vec<Route>,
    connections: BTreeSet<String>,
}

/// The devices, routes and connections of one network namespace.
///
/// Device state lives in the device actors; the namespace only keeps their
/// handles. The internal lock is never held across an `.await`.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    config: TopologyConfig,
    hub: Arc<NotificationHub>,
    topology: Weak<Topology>,
    state: Mutex<State>,
}

impl Namespace {
    pub(crate) fn new(
        name: impl Into<String>,
        config: TopologyConfig,
        hub: Arc<NotificationHub>,
        topology: Weak<Topology>,
    ) -> Self {
        let namespace = Self {
            name: name.into(),
            config,
            hub,
            topology,
            state: Mutex::new(State::default()),
        };
        namespace.publish(NamespaceEvent::Create);
        namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: NamespaceEvent) {
        self.hub.publish(Notification::Namespace {
            event,
            namespace: self.snapshot(),
        });
    }

    pub fn kind(&self) -> NamespaceKind {
        self.state().kind
    }

    pub fn snapshot(&self) -> NamespaceSnapshot {
        let state = self.state();
        NamespaceSnapshot {
            name: self.name.clone(),
            kind: state.kind,
            connections: state.connections.iter().cloned().collect(),
            routes: state.routes.clone(),
        }
    }

    pub fn device(&self, index: u32) -> Option<DeviceHandle> {
        self.state().devices.get(&index).cloned()
    }

    pub fn address_device(&self, index: u32) -> Option<L3Handle> {
        self.state().addresses.get(&index).cloned()
    }

    /// Indices of every link-layer device, ascending.
    pub fn device_indices(&self) -> Vec<u32> {
        self.state().devices.keys().copied().collect()
    }

    pub fn master_of(&self, index: u32) -> Option<u32> {
        self.state().masters.get(&index).copied()
    }

    pub fn connections(&self) -> Vec<String> {
        self.state().connections.iter().cloned().collect()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state().routes.clone()
    }

    /// Whether any connection entry belongs to namespace `name`.
    pub fn is_connected_to(&self, name: &str) -> bool {
        self.state()
            .connections
            .iter()
            .any(|c| namespace_of(c) == name)
    }

    fn bridge(&self, index: u32) -> Option<DeviceHandle> {
        self.device(index)
            .filter(|h| h.kind() == DeviceKind::Bridge)
    }

    /// Create the actor for a newly announced link.
    ///
    /// An index that is already present is left alone.
    pub async fn add_link_device(&self, update: &LinkUpdate) {
        let index = update.index;
        let handle = {
            let mut state = self.state();
            if state.devices.contains_key(&index) {
                tracing::warn!(namespace = %self.name, index, "device already exists, add ignored");
                return;
            }
            let base = LinkDevice::new(self.name.clone(), index, update.name.clone());
            let handle = device::spawn_for(
                base,
                &update.device_type,
                update.peer_index,
                self.hub.clone(),
                self.config.channel_capacity,
            );
            state.devices.insert(index, handle.clone());
            handle
        };
        tracing::debug!(namespace = %self.name, index, kind = ?handle.kind(), name = %update.name, "device added");

        self.send(index, handle.set_flags(update.flags, update.oper_state).await);

        match handle.kind() {
            DeviceKind::Bridge => self.adopt_ports(&handle).await,
            DeviceKind::Veth => {
                if let Some(master) = update.master {
                    self.set_master(index, master).await;
                }
                self.announce_veth(&handle, update).await;
            }
            DeviceKind::Interface => {
                if let Some(master) = update.master {
                    self.set_master(index, master).await;
                }
            }
        }
    }

    /// Add devices already enslaved to a bridge that showed up after them.
    async fn adopt_ports(&self, bridge: &DeviceHandle) {
        let ports: Vec<u32> = self
            .state()
            .masters
            .iter()
            .filter(|&(_, &master)| master == bridge.index())
            .map(|(&port, _)| port)
            .collect();
        for port in ports {
            self.send(bridge.index(), bridge.add_port(port).await);
        }
    }

    async fn announce_veth(&self, handle: &DeviceHandle, update: &LinkUpdate) {
        let Some(topology) = self.topology.upgrade() else {
            return;
        };
        let resolution = if update.peer_netnsid.is_some() && update.peer_index.is_none() {
            PeerResolution::default()
        } else {
            resolve_peer(
                topology.probe(),
                &self.name,
                update.index,
                update.peer_index,
                update.peer_netnsid.is_some(),
                self.config.peer_retry_delay,
            )
            .await
        };

        let mut snapshot = match handle.dump().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(namespace = %self.name, index = update.index, error = %e, "veth gone before announcing");
                return;
            }
        };
        snapshot.peer_index = resolution.peer_index.or(snapshot.peer_index);
        topology
            .handle_peer_event(PeerEvent::create(snapshot, resolution.local_peer))
            .await;
    }

    /// Attach an address set to link `index`, creating its L3 actor.
    ///
    /// If the link already has one, the addresses are added to it instead.
    pub async fn add_address_device(&self, index: u32, addresses: Vec<IpNet>) {
        if let Some(existing) = self.address_device(index) {
            for address in addresses {
                self.send(index, existing.add_address(address).await);
            }
            return;
        }

        let (link, changed) = {
            let mut state = self.state();
            let Some(link) = state.devices.get(&index).cloned() else {
                tracing::debug!(namespace = %self.name, index, "address for unknown link ignored");
                return;
            };
            let handle = l3::spawn(
                L3Device::new(self.name.clone(), index),
                addresses,
                self.hub.clone(),
                self.config.channel_capacity,
            );
            state.addresses.insert(index, handle);
            let changed = state.kind != NamespaceKind::Network;
            state.kind = NamespaceKind::Network;
            (link, changed)
        };

        if changed {
            tracing::debug!(namespace = %self.name, "namespace now carries addresses");
            self.publish(NamespaceEvent::TypeChange);
        }
        self.send(index, link.transform().await);
    }

    pub async fn add_address(&self, index: u32, address: IpNet) {
        match self.address_device(index) {
            Some(handle) => self.send(index, handle.add_address(address).await),
            None => self.add_address_device(index, vec![address]).await,
        }
    }

    pub async fn remove_address(&self, index: u32, address: IpNet) {
        match self.address_device(index) {
            Some(handle) => self.send(index, handle.remove_address(address).await),
            None => tracing::debug!(namespace = %self.name, index, %address, "no addresses on link, remove ignored"),
        }
    }

    /// Delete the link-layer and L3 actors of `index`.
    ///
    /// Returns `false` when neither existed.
    pub async fn remove_device(&self, index: u32) -> bool {
        let (link, addresses, master) = {
            let mut state = self.state();
            let master = state.masters.remove(&index);
            (
                state.devices.remove(&index),
                state.addresses.remove(&index),
                master,
            )
        };
        if link.is_none() && addresses.is_none() {
            tracing::debug!(namespace = %self.name, index, "remove of unknown device ignored");
            return false;
        }

        if let Some(addresses) = addresses
            && let Err(e) = addresses.delete().await
        {
            tracing::debug!(namespace = %self.name, index, error = %e, "address actor already gone");
        }

        let Some(link) = link else {
            return true;
        };
        if let Some(master) = master
            && let Some(bridge) = self.bridge(master)
        {
            self.send(master, bridge.remove_port(index).await);
        }

        let snapshot = match link.delete().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(namespace = %self.name, index, error = %e, "device actor already gone");
                return true;
            }
        };
        tracing::debug!(namespace = %self.name, index, name = %snapshot.name, "device removed");

        if snapshot.kind == DeviceKind::Veth
            && let Some(topology) = self.topology.upgrade()
        {
            topology.handle_peer_event(PeerEvent::delete(snapshot)).await;
        }
        true
    }

    pub async fn set_flags(&self, index: u32, flags: u32, oper_state: OperState) {
        match self.device(index) {
            Some(handle) => self.send(index, handle.set_flags(flags, oper_state).await),
            None => self.unknown(index, "set_flags"),
        }
    }

    /// Point device `index` at `master`, moving its bridge port along.
    pub async fn set_master(&self, index: u32, master: u32) {
        if master == 0 {
            return;
        }
        let (handle, previous) = {
            let mut state = self.state();
            let Some(handle) = state.devices.get(&index).cloned() else {
                drop(state);
                self.unknown(index, "set_master");
                return;
            };
            let previous = state.masters.insert(index, master);
            (handle, previous)
        };
        if previous == Some(master) {
            return;
        }

        if let Some(previous) = previous
            && let Some(bridge) = self.bridge(previous)
        {
            self.send(previous, bridge.remove_port(index).await);
        }
        self.send(index, handle.set_master(master).await);
        match self.bridge(master) {
            Some(bridge) => self.send(master, bridge.add_port(index).await),
            None => tracing::debug!(namespace = %self.name, index, master, "master is not a known bridge"),
        }
    }

    pub async fn unset_master(&self, index: u32) {
        let (handle, previous) = {
            let mut state = self.state();
            let Some(handle) = state.devices.get(&index).cloned() else {
                drop(state);
                self.unknown(index, "unset_master");
                return;
            };
            (handle, state.masters.remove(&index))
        };
        let Some(previous) = previous else {
            return;
        };

        self.send(index, handle.unset_master().await);
        if let Some(bridge) = self.bridge(previous) {
            self.send(previous, bridge.remove_port(index).await);
        }
    }

    pub async fn rename(&self, index: u32, name: &str) {
        match self.device(index) {
            Some(handle) => self.send(index, handle.rename(name).await),
            None => self.unknown(index, "rename"),
        }
    }

    /// Record a connection to `peer`. Returns `true` on an actual change.
    pub fn connect(&self, peer: &str) -> bool {
        let inserted = self.state().connections.insert(peer.to_string());
        if inserted {
            tracing::debug!(namespace = %self.name, peer, "connected");
            self.publish(NamespaceEvent::Connect);
        }
        inserted
    }

    /// Drop a connection to `peer`. Returns `true` on an actual change.
    pub fn disconnect(&self, peer: &str) -> bool {
        let removed = self.state().connections.remove(peer);
        if removed {
            tracing::debug!(namespace = %self.name, peer, "disconnected");
            self.publish(NamespaceEvent::Disconnect);
        }
        removed
    }

    /// Drop every connection into namespace `name`. Returns how many went.
    pub fn disconnect_namespace(&self, name: &str) -> usize {
        let stale: Vec<String> = self
            .state()
            .connections
            .iter()
            .filter(|c| namespace_of(c) == name)
            .cloned()
            .collect();
        stale.iter().filter(|peer| self.disconnect(peer)).count()
    }

    pub fn add_route(&self, route: Route) -> bool {
        {
            let mut state = self.state();
            if state.routes.contains(&route) {
                return false;
            }
            state.routes.push(route);
        }
        self.publish(NamespaceEvent::RouteAdd);
        true
    }

    pub fn delete_route(&self, route: &Route) -> bool {
        {
            let mut state = self.state();
            let before = state.routes.len();
            state.routes.retain(|r| r != route);
            if state.routes.len() == before {
                return false;
            }
        }
        self.publish(NamespaceEvent::RouteDelete);
        true
    }

    /// Snapshot one device and its addresses.
    pub async fn dump(&self, index: u32) -> Result<DeviceDump> {
        let handle = self.device(index).ok_or_else(|| Error::DeviceNotFound {
            namespace: self.name.clone(),
            index,
        })?;
        let device = handle.dump().await?;
        let addresses = match self.address_device(index) {
            Some(l3) => Some(l3.dump().await?),
            None => None,
        };
        Ok(DeviceDump { device, addresses })
    }

    /// Snapshot every device, ascending by index.
    ///
    /// Devices deleted while the dump is in flight are skipped.
    pub async fn dump_all(&self) -> NamespaceDump {
        let mut devices = Vec::new();
        for index in self.device_indices() {
            match self.dump(index).await {
                Ok(dump) => devices.push(dump),
                Err(e) => tracing::debug!(namespace = %self.name, index, error = %e, "device skipped in dump"),
            }
        }
        NamespaceDump {
            namespace: self.snapshot(),
            devices,
        }
    }

    /// Route a link notification to the matching operation.
    ///
    /// A partial update carries the current value of every field, so each
    /// narrow setter runs and the no-op ones fire nothing.
    pub async fn apply_link_update(&self, update: &LinkUpdate) {
        match (update.kind, update.full) {
            (UpdateKind::New, true) => self.add_link_device(update).await,
            (UpdateKind::Delete, true) => {
                self.remove_device(update.index).await;
            }
            (UpdateKind::New, false) => {
                if self.device(update.index).is_none() {
                    self.unknown(update.index, "link update");
                    return;
                }
                match update.master {
                    Some(master) => self.set_master(update.index, master).await,
                    None => self.unset_master(update.index).await,
                }
                if !update.name.is_empty() {
                    self.rename(update.index, &update.name).await;
                }
                self.set_flags(update.index, update.flags, update.oper_state)
                    .await;
            }
            (UpdateKind::Delete, false) => {
                if update.master.is_some() {
                    self.unset_master(update.index).await;
                }
            }
        }
    }

    pub async fn apply_address_update(&self, update: &AddrUpdate) {
        match update.kind {
            UpdateKind::New => self.add_address(update.index, update.address).await,
            UpdateKind::Delete => self.remove_address(update.index, update.address).await,
        }
    }

    pub fn apply_route_update(&self, update: &RouteUpdate) {
        match update.kind {
            UpdateKind::New => self.add_route(update.route.clone()),
            UpdateKind::Delete => self.delete_route(&update.route),
        };
    }

    pub async fn apply(&self, update: &TopologyUpdate) {
        tracing::trace!(namespace = %self.name, ?update, "apply");
        match update {
            TopologyUpdate::Link(link) => self.apply_link_update(link).await,
            TopologyUpdate::Address(addr) => self.apply_address_update(addr).await,
            TopologyUpdate::Route(route) => self.apply_route_update(route),
        }
    }

    /// Delete every device, clear the routes and announce the deletion.
    pub(crate) async fn teardown(&self) {
        let indices: BTreeSet<u32> = {
            let state = self.state();
            state
                .devices
                .keys()
                .chain(state.addresses.keys())
                .copied()
                .collect()
        };
        for index in indices {
            self.remove_device(index).await;
        }
        self.state().routes.clear();
        self.publish(NamespaceEvent::Delete);
    }

    fn unknown(&self, index: u32, operation: &str) {
        tracing::debug!(namespace = %self.name, index, operation, "unknown device, ignored");
    }

    fn send(&self, index: u32, result: Result<()>) {
        if let Err(e) = result {
            tracing::debug!(namespace = %self.name, index, error = %e, "device command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Status;
    use crate::events::{BridgeEvent, DeviceEvent, EventKind};
    use crate::update::{DeviceType, IFF_UP};
    use tokio::sync::mpsc::Receiver;

    fn namespace() -> (Namespace, Receiver<Notification>) {
        let hub = Arc::new(NotificationHub::new());
        let (_, rx) = hub.channel(None, 256);
        let ns = Namespace::new("ns1", TopologyConfig::default(), hub, Weak::new());
        (ns, rx)
    }

    fn drain(rx: &mut Receiver<Notification>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(n) = rx.try_recv() {
            kinds.push(n.kind());
        }
        kinds
    }

    fn route(dst: &str, gw: &str) -> Route {
        Route {
            source: None,
            destination: Some(dst.parse().unwrap()),
            gateway: Some(gw.parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_duplicate_add_ignored() {
        let (ns, mut rx) = namespace();
        let update = LinkUpdate::added(3, "eth0", DeviceType::Other);
        ns.add_link_device(&update).await;
        ns.add_link_device(&update.clone().name("eth9")).await;
        let dump = ns.dump(3).await.unwrap();
        assert_eq!(dump.device.name, "eth0");
        let creates = drain(&mut rx)
            .into_iter()
            .filter(|k| *k == EventKind::Device(DeviceEvent::Create))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_bridge_port_follows_master() {
        let (ns, mut rx) = namespace();
        ns.add_link_device(&LinkUpdate::added(10, "br0", DeviceType::Bridge))
            .await;
        ns.add_link_device(&LinkUpdate::added(11, "eth1", DeviceType::Other))
            .await;
        ns.apply_link_update(&LinkUpdate::changed(11).name("eth1").master(10))
            .await;

        let bridge = ns.dump(10).await.unwrap().device;
        assert_eq!(bridge.ports, Some(vec![11]));
        assert_eq!(ns.dump(11).await.unwrap().device.master, Some(10));
        assert!(drain(&mut rx).contains(&EventKind::Bridge(BridgeEvent::PortAdded)));

        ns.apply_link_update(&LinkUpdate::released(11, 10)).await;
        assert_eq!(ns.dump(10).await.unwrap().device.ports, Some(vec![]));
        assert_eq!(ns.dump(11).await.unwrap().device.master, None);
    }

    #[tokio::test]
    async fn test_late_bridge_adopts_ports() {
        let (ns, _rx) = namespace();
        ns.add_link_device(&LinkUpdate::added(11, "eth1", DeviceType::Other).master(10))
            .await;
        ns.add_link_device(&LinkUpdate::added(10, "br0", DeviceType::Bridge))
            .await;
        assert_eq!(ns.dump(10).await.unwrap().device.ports, Some(vec![11]));
    }

    #[tokio::test]
    async fn test_unknown_index_is_noop() {
        let (ns, mut rx) = namespace();
        drain(&mut rx);
        ns.set_flags(42, IFF_UP, OperState::Up).await;
        ns.set_master(42, 1).await;
        ns.unset_master(42).await;
        ns.rename(42, "x").await;
        ns.remove_address(42, "10.0.0.1/24".parse().unwrap()).await;
        assert!(!ns.remove_device(42).await);
        assert!(drain(&mut rx).is_empty());
        assert!(matches!(ns.dump(42).await, Err(Error::DeviceNotFound { index: 42, .. })));
    }

    #[tokio::test]
    async fn test_first_address_transforms() {
        let (ns, mut rx) = namespace();
        ns.add_link_device(&LinkUpdate::added(2, "eth0", DeviceType::Other).up(OperState::Up))
            .await;
        drain(&mut rx);

        ns.add_address(2, "10.0.0.2/24".parse().unwrap()).await;
        ns.add_address(2, "10.0.0.3/24".parse().unwrap()).await;
        assert_eq!(ns.kind(), NamespaceKind::Network);

        let dump = ns.dump(2).await.unwrap();
        assert_eq!(dump.device.status, Status::Up);
        assert_eq!(dump.addresses.unwrap().addresses.len(), 2);

        let kinds = drain(&mut rx);
        assert!(kinds.contains(&EventKind::Namespace(NamespaceEvent::TypeChange)));
        assert!(kinds.contains(&EventKind::Device(DeviceEvent::Transform)));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::Namespace(NamespaceEvent::TypeChange))
                .count(),
            1
        );
    }

    #[test]
    fn test_route_dedup() {
        let (ns, mut rx) = namespace();
        drain(&mut rx);
        assert!(ns.add_route(route("10.1.0.0/16", "10.0.0.1")));
        assert!(!ns.add_route(route("10.1.0.0/16", "10.0.0.1")));
        assert!(ns.add_route(route("10.1.0.0/16", "10.0.0.254")));
        assert_eq!(ns.routes().len(), 2);
        assert!(ns.delete_route(&route("10.1.0.0/16", "10.0.0.1")));
        assert!(!ns.delete_route(&route("10.1.0.0/16", "10.0.0.1")));
        assert_eq!(
            drain(&mut rx),
            vec![
                EventKind::Namespace(NamespaceEvent::RouteAdd),
                EventKind::Namespace(NamespaceEvent::RouteAdd),
                EventKind::Namespace(NamespaceEvent::RouteDelete),
            ]
        );
    }

    #[test]
    fn test_connections_by_namespace() {
        let (ns, _rx) = namespace();
        assert!(ns.connect("ns2:21"));
        assert!(!ns.connect("ns2:21"));
        assert!(ns.connect("ns2:23"));
        assert!(ns.is_connected_to("ns2"));
        assert!(!ns.is_connected_to("ns3"));
        assert_eq!(ns.snapshot().peers(), vec!["ns2"]);
        assert!(ns.disconnect("ns2:21"));
        assert!(ns.is_connected_to("ns2"));
    }

    #[tokio::test]
    async fn test_teardown_deletes_everything() {
        let (ns, mut rx) = namespace();
        ns.add_link_device(&LinkUpdate::added(2, "eth0", DeviceType::Other))
            .await;
        ns.add_address(2, "10.0.0.2/24".parse().unwrap()).await;
        ns.add_route(route("0.0.0.0/0", "10.0.0.1"));
        ns.teardown().await;

        assert!(ns.device_indices().is_empty());
        assert!(ns.routes().is_empty());
        let kinds = drain(&mut rx);
        assert_eq!(kinds.last(), Some(&EventKind::Namespace(NamespaceEvent::Delete)));
        assert!(kinds.contains(&EventKind::Device(DeviceEvent::Delete)));
    }
}
