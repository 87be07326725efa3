//! Live model of Linux network namespace topology.
//!
//! `nstopo` keeps an in-memory picture of every monitored network namespace:
//! its devices (bridges, veth endpoints, everything else), the addresses on
//! them, its main-table routes, and which namespaces are wired together by
//! veth pairs. Each device is a small tokio actor; observers subscribe to a
//! [`NotificationHub`] and receive full snapshots whenever something changes.
//!
//! The model is fed abstract [`update`] values. The [`netlink`] module
//! produces them from rtnetlink, one socket pair per namespace, and
//! [`monitor::Monitor`] wires the two together. Recorded updates can be
//! replayed without touching the kernel.
//!
//! # Features
//!
//! - `namespace_watcher` (default) - follow `/var/run/netns` with inotify
//! - `integration` - tests that need root and a real kernel
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nstopo::{NotificationHub, Topology, TopologyConfig};
//! use nstopo::monitor::Monitor;
//! use nstopo::netlink::NetlinkProbe;
//!
//! #[tokio::main]
//! async fn main() -> nstopo::Result<()> {
//!     let hub = Arc::new(NotificationHub::new());
//!     hub.subscribe_named(&["veth.pair", "namespace.connect"], |n| println!("{n:?}"))?;
//!
//!     let probe = Arc::new(NetlinkProbe::new());
//!     let topology = Topology::new(TopologyConfig::default(), hub, probe.clone());
//!     let monitor = Monitor::new(topology.clone(), probe)?;
//!     monitor.start_default().await?;
//!
//!     for ns in topology.dump_all().await {
//!         println!("{}: {} devices", ns.namespace.name, ns.devices.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod monitor;
pub mod netlink;
pub mod probe;
pub mod topology;
pub mod update;

#[cfg(feature = "namespace_watcher")]
pub mod watcher;

pub use config::TopologyConfig;
pub use device::{DeviceHandle, DeviceKind, DeviceSnapshot, Status, VethPeer};
pub use error::{Error, Result};
pub use events::{EventKind, Notification, NotificationHub, SubscriptionId};
pub use topology::{DeviceDump, Namespace, NamespaceDump, NamespaceKind, NamespaceSnapshot, Topology};
pub use update::{NamespaceLifecycle, TopologyUpdate};
