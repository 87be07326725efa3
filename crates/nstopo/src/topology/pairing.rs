//! Veth pair rendezvous.
//!
//! The two halves of a veth pair are announced independently, possibly by
//! two namespaces that are discovered at different times. Each announcement
//! becomes a [`PeerEvent`]. An event that finds no counterpart is parked in
//! [`PendingPeers`] under its own `index:peer` key until the other half
//! arrives and looks it up under the reciprocal key.
//!
//! Every decision runs with the topology's pending-buffer lock held, from
//! the first lookup to the last connect or disconnect.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::{EndpointId, Topology};
use crate::device::{DeviceKind, DeviceSnapshot, VethPeer};
use crate::events::{Notification, VethEvent};

/// Buffer key: `<index>:<peer index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CorrelationKey {
    pub index: u32,
    pub peer_index: Option<u32>,
}

impl CorrelationKey {
    pub fn new(index: u32, peer_index: Option<u32>) -> Self {
        Self { index, peer_index }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_index {
            Some(peer) => write!(f, "{}:{}", self.index, peer),
            None => write!(f, "{}:?", self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerEventKind {
    Create,
    Delete,
}

/// One veth endpoint announcing its creation or deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerEvent {
    pub kind: PeerEventKind,
    pub namespace: String,
    pub index: u32,
    pub name: String,
    pub peer_index: Option<u32>,
    /// The far end, when it is already known.
    pub peer: Option<VethPeer>,
    /// Device state when the event was raised.
    pub snapshot: DeviceSnapshot,
}

impl PeerEvent {
    /// A new endpoint, with the peer found by the same-namespace lookup if any.
    pub fn create(snapshot: DeviceSnapshot, local_peer: Option<VethPeer>) -> Self {
        let peer_index = local_peer
            .as_ref()
            .map(|p| p.index)
            .or(snapshot.peer_index);
        Self {
            kind: PeerEventKind::Create,
            namespace: snapshot.namespace.clone(),
            index: snapshot.index,
            name: snapshot.name.clone(),
            peer_index,
            peer: local_peer,
            snapshot,
        }
    }

    /// A removed endpoint, described by its final snapshot.
    pub fn delete(snapshot: DeviceSnapshot) -> Self {
        let peer = snapshot.peer.clone();
        let peer_index = peer.as_ref().map(|p| p.index).or(snapshot.peer_index);
        Self {
            kind: PeerEventKind::Delete,
            namespace: snapshot.namespace.clone(),
            index: snapshot.index,
            name: snapshot.name.clone(),
            peer_index,
            peer,
            snapshot,
        }
    }

    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(self.index, self.peer_index)
    }

    /// The key the other half of the pair files itself under.
    pub fn peer_key(&self) -> Option<CorrelationKey> {
        self.peer_index
            .map(|peer| CorrelationKey::new(peer, Some(self.index)))
    }

    pub fn endpoint(&self) -> EndpointId {
        EndpointId::new(self.namespace.clone(), self.index)
    }

    pub fn peer_endpoint(&self) -> Option<EndpointId> {
        self.peer
            .as_ref()
            .map(|p| EndpointId::new(p.namespace.clone(), p.index))
    }

    pub fn peer_namespace(&self) -> Option<&str> {
        self.peer.as_ref().map(|p| p.namespace.as_str())
    }

    /// This endpoint as seen from its peer.
    pub fn identity(&self) -> VethPeer {
        VethPeer {
            index: self.index,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Whether the two events could describe two halves of one link.
    fn matches_counterpart(&self, other: &PeerEvent) -> bool {
        self.peer_namespace().is_none_or(|ns| ns == other.namespace)
            && other.peer_namespace().is_none_or(|ns| ns == self.namespace)
    }
}

/// Unresolved peer events, keyed by correlation key and namespace.
#[derive(Debug, Default)]
pub struct PendingPeers {
    records: HashMap<CorrelationKey, Vec<PeerEvent>>,
}

impl PendingPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an event. A record with the same key from the same namespace is
    /// replaced and returned.
    pub fn insert(&mut self, event: PeerEvent) -> Option<PeerEvent> {
        let slot = self.records.entry(event.key()).or_default();
        match slot.iter().position(|r| r.namespace == event.namespace) {
            Some(pos) => Some(std::mem::replace(&mut slot[pos], event)),
            None => {
                slot.push(event);
                None
            }
        }
    }

    /// Take a `kind` record filed under `event`'s own key by `event`'s own
    /// namespace. Indices are per namespace, so a record from anywhere else
    /// describes a different device.
    pub fn take_own(&mut self, event: &PeerEvent, kind: PeerEventKind) -> Option<PeerEvent> {
        let key = event.key();
        let slot = self.records.get(&key)?;
        let pos = slot
            .iter()
            .position(|r| r.kind == kind && r.namespace == event.namespace)?;
        self.remove_at(key, pos)
    }

    /// Take a `kind` record filed by the other half of `event`'s link.
    pub fn take_counterpart(
        &mut self,
        event: &PeerEvent,
        kind: PeerEventKind,
    ) -> Option<PeerEvent> {
        let key = event.peer_key()?;
        let slot = self.records.get(&key)?;
        let pos = slot
            .iter()
            .position(|r| r.kind == kind && event.matches_counterpart(r))?;
        self.remove_at(key, pos)
    }

    fn remove_at(&mut self, key: CorrelationKey, pos: usize) -> Option<PeerEvent> {
        let slot = self.records.get_mut(&key)?;
        let record = slot.remove(pos);
        if slot.is_empty() {
            self.records.remove(&key);
        }
        Some(record)
    }

    pub fn contains(&self, key: CorrelationKey) -> bool {
        self.records.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every parked event, ordered by key then namespace.
    pub fn records(&self) -> Vec<PeerEvent> {
        let mut all: Vec<PeerEvent> = self.records.values().flatten().cloned().collect();
        all.sort_by(|a, b| (a.key(), &a.namespace).cmp(&(b.key(), &b.namespace)));
        all
    }
}

impl Topology {
    /// Run one rendezvous attempt for a veth endpoint.
    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let mut pending = self.pending.lock().await;
        tracing::debug!(
            namespace = %event.namespace,
            index = event.index,
            key = %event.key(),
            kind = ?event.kind,
            "peer event"
        );
        match event.kind {
            PeerEventKind::Create => self.on_create(&mut pending, event).await,
            PeerEventKind::Delete => self.on_delete(&mut pending, event).await,
        }
    }

    async fn on_create(&self, pending: &mut PendingPeers, event: PeerEvent) {
        // Same link torn down and recreated before the stale delete was consumed.
        if let Some(stale) = pending.take_own(&event, PeerEventKind::Delete) {
            if let Some(peer_endpoint) = stale.peer_endpoint() {
                tracing::debug!(key = %event.key(), from = %stale.namespace, "recreated endpoint re-paired");
                self.disconnect_endpoints(&stale.endpoint(), &peer_endpoint);
                if let Some(peer) = stale.peer.clone() {
                    self.pair_endpoint(&event.endpoint(), peer).await;
                }
                self.pair_endpoint(&peer_endpoint, event.identity()).await;
                self.connect_endpoints(&event.endpoint(), &peer_endpoint);
                return;
            }
            tracing::debug!(key = %event.key(), "stale delete without a known peer dropped");
        }

        if let Some(counterpart) = pending.take_counterpart(&event, PeerEventKind::Create) {
            tracing::debug!(
                key = %event.key(),
                peer_namespace = %counterpart.namespace,
                "veth pair matched"
            );
            self.pair_endpoint(&event.endpoint(), counterpart.identity())
                .await;
            self.pair_endpoint(&counterpart.endpoint(), event.identity())
                .await;
            self.connect_endpoints(&event.endpoint(), &counterpart.endpoint());
            return;
        }

        let endpoint = event.endpoint();
        if let Some(replaced) = pending.insert(event) {
            tracing::debug!(key = %replaced.key(), namespace = %replaced.namespace, "pending peer event replaced");
        }
        if let Some(handle) = self.veth_handle(&endpoint)
            && let Err(e) = handle.peer_unknown().await
        {
            tracing::debug!(endpoint = %endpoint, error = %e, "veth gone before peer unknown");
        }
    }

    async fn on_delete(&self, pending: &mut PendingPeers, event: PeerEvent) {
        // Deleted before the counterpart ever confirmed.
        if let Some(record) = pending.take_own(&event, PeerEventKind::Create) {
            tracing::debug!(key = %event.key(), namespace = %record.namespace, "pending create consumed by delete");
            if let Some(peer_endpoint) = event.peer_endpoint() {
                self.disconnect_endpoints(&event.endpoint(), &peer_endpoint);
            }
            return;
        }

        if let Some(counterpart) = pending.take_counterpart(&event, PeerEventKind::Delete) {
            tracing::debug!(key = %event.key(), peer_namespace = %counterpart.namespace, "veth pair deleted");
            self.hub.publish(Notification::Veth {
                event: VethEvent::Delete,
                device: counterpart.snapshot.clone(),
            });
            self.hub.publish(Notification::Veth {
                event: VethEvent::Delete,
                device: event.snapshot.clone(),
            });
            self.disconnect_endpoints(&event.endpoint(), &counterpart.endpoint());
            return;
        }

        if let Some(replaced) = pending.insert(event) {
            tracing::debug!(key = %replaced.key(), namespace = %replaced.namespace, "pending peer event replaced");
        }
    }

    fn veth_handle(&self, endpoint: &EndpointId) -> Option<crate::device::DeviceHandle> {
        self.namespace(&endpoint.namespace)?
            .device(endpoint.index)
            .filter(|h| h.kind() == DeviceKind::Veth)
    }

    async fn pair_endpoint(&self, endpoint: &EndpointId, peer: VethPeer) {
        let Some(handle) = self.veth_handle(endpoint) else {
            tracing::debug!(endpoint = %endpoint, "no live veth to pair");
            return;
        };
        if let Err(e) = handle.pair(peer).await {
            tracing::debug!(endpoint = %endpoint, error = %e, "veth gone before pairing");
        }
    }

    fn connect_endpoints(&self, a: &EndpointId, b: &EndpointId) {
        self.connect(&a.to_string(), &b.to_string());
    }

    fn disconnect_endpoints(&self, a: &EndpointId, b: &EndpointId) {
        self.disconnect(&a.to_string(), &b.to_string());
    }
}
