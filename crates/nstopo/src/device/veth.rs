//! Veth endpoints and peer resolution.

use std::time::Duration;

use super::{DeviceCommand, DeviceKind, DeviceSnapshot, LinkActor, LinkDevice, VethPeer};
use crate::events::{Notification, NotificationHub, VethEvent};
use crate::probe::LinkProbe;
use crate::update::DeviceType;

/// One end of a veth pair.
#[derive(Debug, Clone)]
pub struct Veth {
    base: LinkDevice,
    peer_index: Option<u32>,
    peer: Option<VethPeer>,
}

impl Veth {
    /// A veth that knows, at most, the kernel index of its peer.
    pub fn new(base: LinkDevice, peer_index: Option<u32>) -> Self {
        Self {
            base,
            peer_index,
            peer: None,
        }
    }

    pub fn peer(&self) -> Option<&VethPeer> {
        self.peer.as_ref()
    }

    /// Record the far end. Returns `true` if the identity changed.
    pub fn pair(&mut self, peer: VethPeer) -> bool {
        if self.peer.as_ref() == Some(&peer) {
            return false;
        }
        self.peer_index = Some(peer.index);
        self.peer = Some(peer);
        true
    }

    fn publish(&self, hub: &NotificationHub, event: VethEvent) {
        hub.publish(Notification::Veth {
            event,
            device: self.snapshot(),
        });
    }
}

impl LinkActor for Veth {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Veth
    }

    fn base(&self) -> &LinkDevice {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LinkDevice {
        &mut self.base
    }

    fn snapshot(&self) -> DeviceSnapshot {
        let mut snapshot = self.base.snapshot(DeviceKind::Veth);
        snapshot.peer_index = self.peer_index;
        snapshot.peer = self.peer.clone();
        snapshot
    }

    fn handle(&mut self, command: DeviceCommand, hub: &NotificationHub) {
        match command {
            DeviceCommand::Pair(peer) => {
                if self.pair(peer) {
                    self.publish(hub, VethEvent::Pair);
                }
            }
            DeviceCommand::PeerUnknown => self.publish(hub, VethEvent::Unknown),
            other => tracing::debug!(command = ?other, "command not supported by veth, ignored"),
        }
    }
}

/// What could be learned about a new veth's peer before pairing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerResolution {
    /// Peer index as reported by the kernel, if any.
    pub peer_index: Option<u32>,
    /// The peer, when it is visible in the same namespace.
    pub local_peer: Option<VethPeer>,
}

impl PeerResolution {
    fn settled(&self, remote: bool) -> bool {
        self.local_peer.is_some() || (remote && self.peer_index.is_some())
    }
}

/// Resolve the peer of veth `index` in `namespace`.
///
/// The kernel-reported peer index is used when present, otherwise the link
/// is probed for it. Unless the kernel already said the peer lives in
/// another namespace (`remote`), the peer is then looked up locally. If the
/// lookup comes back empty it is retried once after `retry_delay`; after that
/// the peer is left unknown. Probe failures are logged and treated like an
/// empty lookup.
pub async fn resolve_peer(
    probe: &dyn LinkProbe,
    namespace: &str,
    index: u32,
    reported: Option<u32>,
    remote: bool,
    retry_delay: Duration,
) -> PeerResolution {
    let first = lookup(probe, namespace, index, reported, remote).await;
    if first.settled(remote) {
        return first;
    }

    tracing::debug!(namespace, index, ?retry_delay, "veth peer not visible, retrying");
    tokio::time::sleep(retry_delay).await;

    let second = lookup(probe, namespace, index, first.peer_index, remote).await;
    if !second.settled(remote) {
        tracing::debug!(namespace, index, peer_index = ?second.peer_index, "veth peer unknown");
    }
    second
}

async fn lookup(
    probe: &dyn LinkProbe,
    namespace: &str,
    index: u32,
    known: Option<u32>,
    remote: bool,
) -> PeerResolution {
    let peer_index = match known {
        Some(peer_index) => Some(peer_index),
        None => match probe.link(namespace, index).await {
            Ok(link) => link.and_then(|l| l.peer_index),
            Err(e) => {
                tracing::warn!(namespace, index, error = %e, "resolving veth link failed");
                None
            }
        },
    };

    let mut resolution = PeerResolution {
        peer_index,
        local_peer: None,
    };
    let Some(peer_index) = peer_index else {
        return resolution;
    };
    if remote {
        return resolution;
    }

    match probe.link(namespace, peer_index).await {
        Ok(Some(link))
            if link.device_type == DeviceType::Veth
                && link.peer_index.is_none_or(|p| p == index) =>
        {
            resolution.local_peer = Some(VethPeer {
                index: peer_index,
                name: link.name,
                namespace: namespace.to_string(),
            });
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(namespace, index = peer_index, error = %e, "probing veth peer failed");
        }
    }
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbedLink, StaticProbe};

    fn veth_link(index: u32, name: &str, peer: u32) -> ProbedLink {
        ProbedLink {
            index,
            name: name.into(),
            device_type: DeviceType::Veth,
            peer_index: Some(peer),
            peer_netnsid: None,
        }
    }

    #[test]
    fn test_pair_changes_once() {
        let mut veth = Veth::new(LinkDevice::new("ns1", 20, "veth0"), Some(21));
        let peer = VethPeer {
            index: 21,
            name: "eth0".into(),
            namespace: "ns2".into(),
        };
        assert!(veth.pair(peer.clone()));
        assert!(!veth.pair(peer));
        assert_eq!(veth.snapshot().peer_index, Some(21));
    }

    #[tokio::test]
    async fn test_local_peer_found() {
        let probe = StaticProbe::new();
        probe.insert("ns1", veth_link(21, "veth1", 20));
        let res = resolve_peer(&probe, "ns1", 20, Some(21), false, Duration::from_millis(1)).await;
        assert_eq!(res.peer_index, Some(21));
        assert_eq!(res.local_peer.unwrap().name, "veth1");
    }

    #[tokio::test]
    async fn test_peer_index_probed() {
        let probe = StaticProbe::new();
        probe.insert("ns1", veth_link(20, "veth0", 21));
        let res = resolve_peer(&probe, "ns1", 20, None, false, Duration::from_millis(1)).await;
        assert_eq!(res.peer_index, Some(21));
        assert!(res.local_peer.is_none());
    }

    #[tokio::test]
    async fn test_remote_hint_skips_lookup() {
        let probe = StaticProbe::new();
        probe.insert("ns1", veth_link(21, "veth1", 20));
        let res = resolve_peer(&probe, "ns1", 20, Some(21), true, Duration::from_secs(60)).await;
        assert_eq!(res.peer_index, Some(21));
        assert!(res.local_peer.is_none());
    }

    #[tokio::test]
    async fn test_non_reciprocal_link_ignored() {
        let probe = StaticProbe::new();
        probe.insert("ns1", veth_link(21, "veth1", 99));
        let res = resolve_peer(&probe, "ns1", 20, Some(21), false, Duration::from_millis(1)).await;
        assert!(res.local_peer.is_none());
    }
}
