//! Topology integration tests.
//!
//! These drive a [`Topology`] with abstract updates, the way a kernel feed
//! would, and check the resulting model and notifications. The kernel test
//! at the bottom needs root and the `integration` feature:
//!
//! ```bash
//! sudo cargo test -p nstopo --features integration --test topology
//! ```

#[macro_use]
#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Recorder, ScriptedProbe, topology, topology_with};
use nstopo::events::{
    AddressEvent, BridgeEvent, DeviceEvent, EventKind, NamespaceEvent, VethEvent,
};
use nstopo::topology::CorrelationKey;
use nstopo::update::{AddrUpdate, DeviceType, LinkUpdate, Route, RouteUpdate, UpdateKind};
use nstopo::{Notification, Topology, TopologyUpdate, VethPeer};

fn veth(index: u32, peer: u32) -> LinkUpdate {
    LinkUpdate::added(index, format!("veth{index}"), DeviceType::Veth).peer(peer)
}

/// A veth whose peer the kernel places in another namespace.
fn remote_veth(index: u32, peer: u32) -> LinkUpdate {
    veth(index, peer).peer_netnsid(0)
}

fn peer(namespace: &str, index: u32) -> VethPeer {
    VethPeer {
        index,
        name: format!("veth{index}"),
        namespace: namespace.into(),
    }
}

async fn apply(topology: &Topology, namespace: &str, update: impl Into<TopologyUpdate>) {
    topology.apply(namespace, &update.into()).await;
}

async fn peer_of(topology: &Topology, namespace: &str, index: u32) -> Option<VethPeer> {
    topology.dump(namespace, index).await.unwrap().device.peer
}

fn connections(topology: &Topology, namespace: &str) -> Vec<String> {
    topology.namespace(namespace).unwrap().connections()
}

fn assert_symmetric(topology: &Topology) {
    let names = topology.namespace_names();
    for x in &names {
        for y in &names {
            let xy = topology.namespace(x).unwrap().is_connected_to(y);
            let yx = topology.namespace(y).unwrap().is_connected_to(x);
            assert_eq!(xy, yx, "{x} -> {y} is {xy} but {y} -> {x} is {yx}");
        }
    }
}

/// Pair ns1:20 with ns2:21, announcing `first` before the other half.
async fn paired(first: &str) -> (Arc<Topology>, Recorder) {
    let (topology, recorder) = topology();
    topology.create_namespace("ns1");
    topology.create_namespace("ns2");

    let halves = [("ns1", remote_veth(20, 21)), ("ns2", remote_veth(21, 20))];
    let (a, b) = if first == "ns1" {
        (&halves[0], &halves[1])
    } else {
        (&halves[1], &halves[0])
    };
    apply(&topology, a.0, a.1.clone()).await;
    apply(&topology, b.0, b.1.clone()).await;

    (topology, recorder)
}

#[tokio::test]
async fn test_pairing_converges_in_either_order() {
    for first in ["ns1", "ns2"] {
        let (topology, recorder) = paired(first).await;

        assert_eq!(peer_of(&topology, "ns1", 20).await, Some(peer("ns2", 21)));
        assert_eq!(peer_of(&topology, "ns2", 21).await, Some(peer("ns1", 20)));
        assert_eq!(connections(&topology, "ns1"), vec!["ns2:21"]);
        assert_eq!(connections(&topology, "ns2"), vec!["ns1:20"]);
        assert!(topology.pending_peers().await.is_empty());

        assert_eq!(recorder.count("ns1", EventKind::Veth(VethEvent::Pair)), 1);
        assert_eq!(recorder.count("ns2", EventKind::Veth(VethEvent::Pair)), 1);
        // Only the half that had to wait was reported unknown.
        assert_eq!(recorder.count(first, EventKind::Veth(VethEvent::Unknown)), 1);
        assert_eq!(
            recorder
                .kinds()
                .iter()
                .filter(|k| **k == EventKind::Veth(VethEvent::Unknown))
                .count(),
            1
        );
    }
}

#[tokio::test]
async fn test_delete_before_counterpart_leaves_nothing_behind() {
    let (topology, recorder) = topology();
    topology.create_namespace("ns1");
    topology.create_namespace("ns2");

    apply(&topology, "ns1", remote_veth(20, 21)).await;
    assert_eq!(topology.pending_peers().await.len(), 1);

    apply(&topology, "ns1", LinkUpdate::removed(20)).await;
    assert!(topology.pending_peers().await.is_empty());

    // The other half shows up late and finds nobody.
    apply(&topology, "ns2", remote_veth(21, 20)).await;
    let pending = topology.pending_peers().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key(), CorrelationKey::new(21, Some(20)));
    assert!(
        pending
            .iter()
            .all(|p| p.key() != CorrelationKey::new(20, Some(21)))
    );

    assert!(connections(&topology, "ns1").is_empty());
    assert!(connections(&topology, "ns2").is_empty());
    assert_eq!(recorder.count("ns1", EventKind::Namespace(NamespaceEvent::Connect)), 0);
    assert_eq!(recorder.count("ns2", EventKind::Namespace(NamespaceEvent::Connect)), 0);
    assert_eq!(peer_of(&topology, "ns2", 21).await, None);
}

#[tokio::test]
async fn test_pairs_sharing_indices_stay_apart() {
    // ns1:20 <-> ns2:21 is live; ns3:20 <-> ns4:21 is an unrelated link
    // with the same indices, announced around the delete of ns1:20.
    let (topology, recorder) = paired("ns1").await;
    topology.create_namespace("ns3");
    topology.create_namespace("ns4");

    apply(&topology, "ns3", remote_veth(20, 21)).await;
    apply(&topology, "ns1", LinkUpdate::removed(20)).await;
    apply(&topology, "ns4", remote_veth(21, 20)).await;

    assert_eq!(peer_of(&topology, "ns3", 20).await, Some(peer("ns4", 21)));
    assert_eq!(peer_of(&topology, "ns4", 21).await, Some(peer("ns3", 20)));
    assert_eq!(connections(&topology, "ns3"), vec!["ns4:21"]);
    assert_eq!(connections(&topology, "ns4"), vec!["ns3:20"]);
    assert!(!topology.namespace("ns2").unwrap().is_connected_to("ns3"));
    // The old link stays wired until the delete of ns2:21 arrives.
    assert_eq!(connections(&topology, "ns1"), vec!["ns2:21"]);
    assert_eq!(connections(&topology, "ns2"), vec!["ns1:20"]);
    assert_eq!(peer_of(&topology, "ns2", 21).await, Some(peer("ns1", 20)));
    assert_eq!(topology.pending_peers().await.len(), 1);

    apply(&topology, "ns2", LinkUpdate::removed(21)).await;
    assert!(connections(&topology, "ns1").is_empty());
    assert!(connections(&topology, "ns2").is_empty());
    assert!(topology.pending_peers().await.is_empty());
    assert_eq!(connections(&topology, "ns3"), vec!["ns4:21"]);
    assert_eq!(recorder.count("ns3", EventKind::Veth(VethEvent::Delete)), 0);
    assert_symmetric(&topology);
}

#[tokio::test]
async fn test_recreated_endpoint_is_repaired() {
    let (topology, _recorder) = paired("ns1").await;
    topology.create_namespace("ns3");
    // Unrelated half in another namespace, same key.
    apply(&topology, "ns3", remote_veth(20, 21)).await;

    apply(&topology, "ns1", LinkUpdate::removed(20)).await;
    apply(&topology, "ns1", remote_veth(20, 21)).await;

    assert_eq!(peer_of(&topology, "ns1", 20).await, Some(peer("ns2", 21)));
    assert_eq!(peer_of(&topology, "ns2", 21).await, Some(peer("ns1", 20)));
    assert_eq!(connections(&topology, "ns2"), vec!["ns1:20"]);
    assert!(connections(&topology, "ns3").is_empty());
    let pending = topology.pending_peers().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].namespace, "ns3");
    assert_symmetric(&topology);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_halves_pair_once() {
    for _ in 0..50 {
        let (topology, recorder) = topology();
        topology.create_namespace("ns1");
        topology.create_namespace("ns2");

        let left = tokio::spawn({
            let topology = topology.clone();
            async move { apply(&topology, "ns1", remote_veth(20, 21)).await }
        });
        let right = tokio::spawn({
            let topology = topology.clone();
            async move { apply(&topology, "ns2", remote_veth(21, 20)).await }
        });
        left.await.unwrap();
        right.await.unwrap();

        assert_eq!(peer_of(&topology, "ns1", 20).await, Some(peer("ns2", 21)));
        assert_eq!(peer_of(&topology, "ns2", 21).await, Some(peer("ns1", 20)));
        assert_eq!(connections(&topology, "ns1"), vec!["ns2:21"]);
        assert_eq!(connections(&topology, "ns2"), vec!["ns1:20"]);
        assert!(topology.pending_peers().await.is_empty());
        assert_eq!(
            recorder
                .kinds()
                .iter()
                .filter(|k| **k == EventKind::Veth(VethEvent::Pair))
                .count(),
            2
        );
    }
}

#[tokio::test]
async fn test_same_namespace_pair_after_retry() {
    let probe = ScriptedProbe::new();
    probe.veth("ns1", 30, 31);
    probe.veth("ns1", 31, 30);
    // The peer is not visible yet when the first half is announced.
    probe.hide_for("ns1", 31, 1);

    let (topology, _recorder) = topology_with(probe.clone());
    topology.create_namespace("ns1");

    apply(&topology, "ns1", veth(30, 31)).await;
    apply(&topology, "ns1", veth(31, 30)).await;

    assert_eq!(peer_of(&topology, "ns1", 30).await, Some(peer("ns1", 31)));
    assert_eq!(peer_of(&topology, "ns1", 31).await, Some(peer("ns1", 30)));
    assert_eq!(connections(&topology, "ns1"), vec!["ns1:30", "ns1:31"]);
    assert!(topology.pending_peers().await.is_empty());
    // Two lookups for 31 (one hidden), one for 30.
    assert_eq!(probe.lookups(), 3);
}

#[tokio::test]
async fn test_connections_stay_symmetric() {
    let (topology, _recorder) = topology();
    for name in ["ns1", "ns2", "ns3"] {
        topology.create_namespace(name);
    }

    topology.connect("ns1", "ns2");
    assert_symmetric(&topology);
    topology.connect("ns2:5", "ns3:6");
    assert_symmetric(&topology);
    assert!(topology.namespace("ns3").unwrap().is_connected_to("ns2"));

    // Nothing is recorded against a namespace that is not registered.
    topology.connect("ns1", "ghost:1");
    assert!(!topology.namespace("ns1").unwrap().is_connected_to("ghost"));
    topology.create_namespace("ghost");
    assert_symmetric(&topology);

    topology.connect("ns1", "ghost:1");
    assert_eq!(connections(&topology, "ns1"), vec!["ghost:1", "ns2"]);
    assert_eq!(connections(&topology, "ghost"), vec!["ns1"]);
    assert_symmetric(&topology);

    topology.disconnect("ns1", "ns2");
    assert_symmetric(&topology);
    topology.disconnect("ns2:5", "ns3:6");
    assert_symmetric(&topology);

    assert!(connections(&topology, "ns2").is_empty());
    assert!(connections(&topology, "ns3").is_empty());
}

#[tokio::test]
async fn test_recreated_namespace_starts_disconnected() {
    let (topology, recorder) = paired("ns1").await;
    assert!(topology.delete_namespace("ns1").await);
    assert_eq!(connections(&topology, "ns2"), vec!["ns1:20"]);

    topology.create_namespace("ns1");
    assert!(connections(&topology, "ns2").is_empty());
    assert!(connections(&topology, "ns1").is_empty());
    assert_symmetric(&topology);
    assert_eq!(recorder.count("ns2", EventKind::Namespace(NamespaceEvent::Disconnect)), 1);
}

#[tokio::test]
async fn test_disconnect_twice_notifies_once() {
    let (topology, recorder) = topology();
    topology.create_namespace("ns1");
    topology.create_namespace("ns2");
    topology.connect("ns1", "ns2");

    topology.disconnect("ns1", "ns2");
    assert!(connections(&topology, "ns1").is_empty());
    topology.disconnect("ns1", "ns2");
    assert!(connections(&topology, "ns1").is_empty());

    for ns in ["ns1", "ns2"] {
        assert_eq!(recorder.count(ns, EventKind::Namespace(NamespaceEvent::Connect)), 1);
        assert_eq!(recorder.count(ns, EventKind::Namespace(NamespaceEvent::Disconnect)), 1);
    }
}

#[tokio::test]
async fn test_duplicate_route_is_stored_once() {
    let (topology, recorder) = topology();
    topology.create_namespace("ns1");

    let route = Route {
        source: None,
        destination: Some("10.1.0.0/16".parse().unwrap()),
        gateway: Some("192.168.1.1".parse().unwrap()),
    };
    let add = RouteUpdate {
        kind: UpdateKind::New,
        route: route.clone(),
    };
    apply(&topology, "ns1", add.clone()).await;
    apply(&topology, "ns1", add).await;

    let ns = topology.namespace("ns1").unwrap();
    assert_eq!(ns.routes(), vec![route.clone()]);
    assert_eq!(recorder.count("ns1", EventKind::Namespace(NamespaceEvent::RouteAdd)), 1);

    let delete = RouteUpdate {
        kind: UpdateKind::Delete,
        route,
    };
    apply(&topology, "ns1", delete.clone()).await;
    apply(&topology, "ns1", delete).await;
    assert!(ns.routes().is_empty());
    assert_eq!(recorder.count("ns1", EventKind::Namespace(NamespaceEvent::RouteDelete)), 1);
}

#[tokio::test]
async fn test_namespace_deletion_tears_down_devices() {
    let (topology, recorder) = topology();
    topology.create_namespace("ns1");

    apply(&topology, "ns1", LinkUpdate::added(10, "br0", DeviceType::Bridge)).await;
    apply(&topology, "ns1", LinkUpdate::added(11, "eth1", DeviceType::Other).master(10)).await;
    apply(
        &topology,
        "ns1",
        AddrUpdate::new(UpdateKind::New, 11, "10.0.0.2/24".parse().unwrap()),
    )
    .await;
    assert_eq!(topology.dump("ns1", 10).await.unwrap().device.ports, Some(vec![11]));

    assert!(topology.delete_namespace("ns1").await);
    assert!(topology.namespace("ns1").is_none());
    assert!(topology.dump("ns1", 10).await.is_err());

    assert_eq!(recorder.count("ns1", EventKind::Device(DeviceEvent::Delete)), 2);
    assert_eq!(recorder.count("ns1", EventKind::Bridge(BridgeEvent::Delete)), 1);
    assert_eq!(recorder.count("ns1", EventKind::Address(AddressEvent::Delete)), 1);
    assert_eq!(recorder.count("ns1", EventKind::Namespace(NamespaceEvent::Delete)), 1);
    // Namespace delete comes after every device delete.
    assert_eq!(
        recorder.kinds().last(),
        Some(&EventKind::Namespace(NamespaceEvent::Delete))
    );

    assert!(!topology.delete_namespace("ns1").await);
}

#[tokio::test]
async fn test_deleted_namespace_releases_veth_peer() {
    let (topology, recorder) = paired("ns1").await;

    assert!(topology.delete_namespace("ns1").await);
    // The surviving half is still wired until its own delete arrives.
    assert_eq!(connections(&topology, "ns2"), vec!["ns1:20"]);
    assert_eq!(topology.pending_peers().await.len(), 1);

    apply(&topology, "ns2", LinkUpdate::removed(21)).await;
    assert!(connections(&topology, "ns2").is_empty());
    assert!(topology.pending_peers().await.is_empty());
    assert_eq!(recorder.count("ns1", EventKind::Veth(VethEvent::Delete)), 1);
    assert_eq!(recorder.count("ns2", EventKind::Veth(VethEvent::Delete)), 1);
}

#[tokio::test]
async fn test_bridge_scenario() {
    let (topology, recorder) = topology();
    topology.create_namespace("ns1");

    apply(&topology, "ns1", LinkUpdate::added(10, "br0", DeviceType::Bridge)).await;
    let bridge = topology.dump("ns1", 10).await.unwrap().device;
    assert_eq!(bridge.ports, Some(vec![]));
    let created = recorder.of("ns1", EventKind::Bridge(BridgeEvent::Create));
    assert_eq!(created.len(), 1);
    assert!(matches!(
        &created[0],
        Notification::Bridge { device, port: None, .. } if device.index == 10 && device.ports == Some(vec![])
    ));

    apply(&topology, "ns1", LinkUpdate::added(11, "eth1", DeviceType::Other)).await;
    apply(&topology, "ns1", LinkUpdate::changed(11).master(10).name("eth1")).await;

    assert_eq!(topology.dump("ns1", 11).await.unwrap().device.master, Some(10));
    assert_eq!(topology.dump("ns1", 10).await.unwrap().device.ports, Some(vec![11]));

    let added = recorder.of("ns1", EventKind::Bridge(BridgeEvent::PortAdded));
    assert_eq!(added.len(), 1);
    assert!(matches!(
        &added[0],
        Notification::Bridge { device, port: Some(11), .. } if device.ports == Some(vec![11])
    ));
    assert_eq!(recorder.count("ns1", EventKind::Device(DeviceEvent::SetMaster)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_veth_scenario() {
    let probe = ScriptedProbe::new();
    let (topology, recorder) = topology_with(probe.clone());
    topology.create_namespace("ns1");
    topology.create_namespace("ns2");

    apply(&topology, "ns1", veth(20, 21)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    apply(&topology, "ns2", veth(21, 20)).await;

    let d20 = peer_of(&topology, "ns1", 20).await.unwrap();
    let d21 = peer_of(&topology, "ns2", 21).await.unwrap();
    assert_eq!(d20.namespace, "ns2");
    assert_eq!(d21.namespace, "ns1");

    let ns1 = topology.namespace("ns1").unwrap();
    let ns2 = topology.namespace("ns2").unwrap();
    assert!(ns1.is_connected_to("ns2"));
    assert!(ns2.is_connected_to("ns1"));
    assert_eq!(ns1.snapshot().peers(), vec!["ns2"]);

    // Neither peer was ever visible locally: one lookup plus one retry each.
    assert_eq!(probe.lookups(), 4);
    assert_eq!(recorder.count("ns1", EventKind::Veth(VethEvent::Pair)), 1);
}

#[cfg(feature = "integration")]
#[tokio::test(flavor = "multi_thread")]
async fn test_kernel_veth_between_namespaces() -> nstopo::Result<()> {
    use common::TestNamespace;
    use nstopo::monitor::Monitor;
    use nstopo::netlink::{NamespaceSource, NetlinkProbe};

    require_root!();

    let left = TestNamespace::new("left")?;
    let right = TestNamespace::new("right")?;

    let probe = Arc::new(NetlinkProbe::new());
    let (topology, recorder) = topology_with(probe.clone());
    let monitor = Monitor::new(topology.clone(), probe)?;
    for ns in [&left, &right] {
        monitor
            .start_namespace(ns.name(), NamespaceSource::Named(ns.name().into()))
            .await?;
    }

    left.ip(&[
        "link", "add", "vt0", "type", "veth", "peer", "name", "vt1", "netns", right.name(),
    ])?;

    let mut connected = false;
    for _ in 0..50 {
        let l = topology.namespace(left.name()).map(|n| n.is_connected_to(right.name()));
        let r = topology.namespace(right.name()).map(|n| n.is_connected_to(left.name()));
        if l == Some(true) && r == Some(true) {
            connected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(connected, "veth pair never paired: {:?}", recorder.kinds());

    left.ip(&["link", "del", "vt0"])?;
    for _ in 0..50 {
        if !topology
            .namespace(right.name())
            .is_some_and(|n| n.is_connected_to(left.name()))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(connections(&topology, right.name()).is_empty());

    monitor.shutdown().await;
    Ok(())
}
