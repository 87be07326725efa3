//! The topology registry.
//!
//! [`Topology`] owns every [`Namespace`] and the buffer of veth announcements
//! still waiting for their other half. It is created once and shared as an
//! `Arc<Topology>` by whatever feeds it updates.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nstopo::{NotificationHub, Topology, TopologyConfig};
//! use nstopo::probe::NoProbe;
//! use nstopo::update::{DeviceType, LinkUpdate};
//!
//! let hub = Arc::new(NotificationHub::new());
//! let topology = Topology::new(TopologyConfig::default(), hub, Arc::new(NoProbe));
//! let ns = topology.create_namespace("ns1");
//! ns.add_link_device(&LinkUpdate::added(10, "br0", DeviceType::Bridge)).await;
//! let dump = topology.dump("ns1", 10).await?;
//! ```

mod endpoint;
mod namespace;
pub mod pairing;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

pub use endpoint::{EndpointId, namespace_of};
pub use namespace::{DeviceDump, Namespace, NamespaceDump, NamespaceKind, NamespaceSnapshot};
pub use pairing::{CorrelationKey, PeerEvent, PeerEventKind, PendingPeers};

use crate::config::TopologyConfig;
use crate::events::NotificationHub;
use crate::probe::LinkProbe;
use crate::update::TopologyUpdate;
use crate::{Error, Result};

/// Registry of namespaces plus the shared veth pairing buffer.
pub struct Topology {
    config: TopologyConfig,
    hub: Arc<NotificationHub>,
    probe: Arc<dyn LinkProbe>,
    namespaces: RwLock<BTreeMap<String, Arc<Namespace>>>,
    pending: tokio::sync::Mutex<PendingPeers>,
    this: Weak<Topology>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("config", &self.config)
            .field("namespaces", &self.namespace_names())
            .finish_non_exhaustive()
    }
}

impl Topology {
    pub fn new(
        config: TopologyConfig,
        hub: Arc<NotificationHub>,
        probe: Arc<dyn LinkProbe>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            hub,
            probe,
            namespaces: RwLock::new(BTreeMap::new()),
            pending: tokio::sync::Mutex::new(PendingPeers::new()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn probe(&self) -> &dyn LinkProbe {
        self.probe.as_ref()
    }

    /// Register a namespace, or return the one already registered under `name`.
    pub fn create_namespace(&self, name: &str) -> Arc<Namespace> {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = namespaces.get(name) {
            tracing::debug!(namespace = name, "namespace already registered");
            return existing.clone();
        }
        tracing::info!(namespace = name, "namespace created");
        let namespace = Arc::new(Namespace::new(
            name,
            self.config.clone(),
            self.hub.clone(),
            self.this.clone(),
        ));
        namespaces.insert(name.to_string(), namespace.clone());
        let others: Vec<Arc<Namespace>> = namespaces
            .iter()
            .filter(|(other, _)| other.as_str() != name)
            .map(|(_, ns)| ns.clone())
            .collect();
        drop(namespaces);

        // Entries left behind by an earlier namespace of the same name.
        for other in others {
            let released = other.disconnect_namespace(name);
            if released > 0 {
                tracing::debug!(namespace = name, peer = %other.name(), released, "stale connections released");
            }
        }
        namespace
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// The host namespace, registered on first use.
    pub fn default_namespace(&self) -> Arc<Namespace> {
        self.create_namespace(&self.config.default_namespace)
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Tear a namespace down after the settle period.
    ///
    /// Every device is deleted first, with its usual side effects, then the
    /// namespace is dropped from the registry. Returns `false` if no such
    /// namespace was registered.
    pub async fn delete_namespace(&self, name: &str) -> bool {
        let Some(namespace) = self.namespace(name) else {
            tracing::debug!(namespace = name, "delete of unknown namespace ignored");
            return false;
        };
        tokio::time::sleep(self.config.namespace_grace_period).await;
        self.teardown_namespace(&namespace).await;
        true
    }

    /// Delete every device of `namespace` and unregister it, without waiting.
    ///
    /// For callers that already let the namespace's updates settle.
    pub async fn teardown_namespace(&self, namespace: &Arc<Namespace>) {
        namespace.teardown().await;
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // A namespace of the same name may have been registered meanwhile.
        if namespaces
            .get(namespace.name())
            .is_some_and(|current| Arc::ptr_eq(current, namespace))
        {
            namespaces.remove(namespace.name());
        }
        tracing::info!(namespace = %namespace.name(), "namespace deleted");
    }

    /// Connect two identifiers (`ns:index` or bare namespace names) both ways.
    ///
    /// Nothing happens unless both namespaces are registered.
    pub fn connect(&self, a: &str, b: &str) {
        let (Some(ns_a), Some(ns_b)) = (
            self.namespace(namespace_of(a)),
            self.namespace(namespace_of(b)),
        ) else {
            tracing::debug!(a, b, "connect to unknown namespace ignored");
            return;
        };
        ns_a.connect(b);
        ns_b.connect(a);
    }

    /// Disconnect two identifiers both ways.
    ///
    /// Each registered side drops its entry even if the other side is gone,
    /// so a survivor can release a namespace that was already deleted.
    pub fn disconnect(&self, a: &str, b: &str) {
        if let Some(ns) = self.namespace(namespace_of(a)) {
            ns.disconnect(b);
        }
        if let Some(ns) = self.namespace(namespace_of(b)) {
            ns.disconnect(a);
        }
    }

    /// Route a kernel update to its namespace.
    pub async fn apply(&self, namespace: &str, update: &TopologyUpdate) {
        match self.namespace(namespace) {
            Some(ns) => ns.apply(update).await,
            None => tracing::debug!(namespace, "update for unknown namespace dropped"),
        }
    }

    pub async fn dump(&self, namespace: &str, index: u32) -> Result<DeviceDump> {
        let ns = self
            .namespace(namespace)
            .ok_or_else(|| Error::NamespaceNotFound {
                name: namespace.to_string(),
            })?;
        ns.dump(index).await
    }

    /// Snapshot every namespace and device, ordered by namespace name.
    pub async fn dump_all(&self) -> Vec<NamespaceDump> {
        let namespaces: Vec<Arc<Namespace>> = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut dumps = Vec::with_capacity(namespaces.len());
        for ns in namespaces {
            dumps.push(ns.dump_all().await);
        }
        dumps
    }

    /// Veth announcements still waiting for their counterpart.
    pub async fn pending_peers(&self) -> Vec<PeerEvent> {
        self.pending.lock().await.records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, NamespaceEvent, Notification};
    use crate::probe::NoProbe;
    use crate::update::{DeviceType, LinkUpdate};
    use std::time::Duration;

    fn topology() -> Arc<Topology> {
        let config = TopologyConfig::default()
            .with_namespace_grace_period(Duration::from_millis(1))
            .with_peer_retry_delay(Duration::from_millis(1));
        Topology::new(config, Arc::new(NotificationHub::new()), Arc::new(NoProbe))
    }

    #[test]
    fn test_create_is_idempotent() {
        let topo = topology();
        let a = topo.create_namespace("ns1");
        let b = topo.create_namespace("ns1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(topo.default_namespace().name(), "default");
        assert_eq!(topo.namespace_names(), vec!["default", "ns1"]);
    }

    #[test]
    fn test_connect_symmetric_and_tolerant() {
        let topo = topology();
        let ns1 = topo.create_namespace("ns1");
        let ns2 = topo.create_namespace("ns2");

        topo.connect("ns1:20", "ns2:21");
        assert!(ns1.is_connected_to("ns2"));
        assert!(ns2.is_connected_to("ns1"));

        topo.connect("ns1:5", "gone:6");
        assert!(!ns1.is_connected_to("gone"));
        topo.disconnect("ns1:5", "gone:6");
        assert_eq!(ns1.connections(), vec!["ns2:21"]);

        topo.disconnect("ns1:20", "ns2:21");
        assert!(!ns1.is_connected_to("ns2"));
        assert!(!ns2.is_connected_to("ns1"));
    }

    #[test]
    fn test_disconnect_twice_notifies_once() {
        let topo = topology();
        let ns1 = topo.create_namespace("ns1");
        topo.create_namespace("ns2");
        topo.connect("ns1", "ns2");

        let (_, mut rx) = topo.hub().channel(
            Some(vec![EventKind::Namespace(NamespaceEvent::Disconnect)]),
            16,
        );
        topo.disconnect("ns1", "ns2");
        topo.disconnect("ns1", "ns2");

        let mut events: Vec<Notification> = Vec::new();
        while let Ok(n) = rx.try_recv() {
            events.push(n);
        }
        // One per side.
        assert_eq!(events.len(), 2);
        assert_eq!(events.iter().filter(|n| n.namespace() == "ns1").count(), 1);
        assert!(ns1.connections().is_empty());
    }

    #[tokio::test]
    async fn test_delete_namespace() {
        let topo = topology();
        let ns = topo.create_namespace("ns1");
        ns.add_link_device(&LinkUpdate::added(3, "eth0", DeviceType::Other))
            .await;

        assert!(topo.delete_namespace("ns1").await);
        assert!(!topo.delete_namespace("ns1").await);
        assert!(topo.namespace("ns1").is_none());
        assert!(matches!(
            topo.dump("ns1", 3).await,
            Err(Error::NamespaceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dump_all_ordered() {
        let topo = topology();
        topo.create_namespace("b");
        let a = topo.create_namespace("a");
        a.add_link_device(&LinkUpdate::added(2, "eth0", DeviceType::Other))
            .await;
        a.add_link_device(&LinkUpdate::added(1, "lo", DeviceType::Other))
            .await;

        let dumps = topo.dump_all().await;
        let names: Vec<&str> = dumps.iter().map(|d| d.namespace.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let indices: Vec<u32> = dumps[0].devices.iter().map(|d| d.device.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }
}
