//! Change notifications and the hub that fans them out.
//!
//! Every mutation of the model produces one [`Notification`]: the event kind
//! plus a complete snapshot of the object after the change. Observers never
//! see deltas and never need to query back into the model.
//!
//! # Example
//!
//! ```ignore
//! use nstopo::events::{NotificationHub, Notification};
//!
//! let hub = NotificationHub::new();
//! hub.subscribe_named(&["veth.pair", "namespace.connect"], |n: &Notification| {
//!     println!("{}", n.kind());
//! })?;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use ipnet::IpNet;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::device::DeviceSnapshot;
use crate::device::l3::L3Snapshot;
use crate::topology::NamespaceSnapshot;
use crate::{Error, Result};

/// Namespace-level changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceEvent {
    Create,
    Delete,
    TypeChange,
    Connect,
    Disconnect,
    RouteAdd,
    RouteDelete,
}

impl NamespaceEvent {
    pub const ALL: [Self; 7] = [
        Self::Create,
        Self::Delete,
        Self::TypeChange,
        Self::Connect,
        Self::Disconnect,
        Self::RouteAdd,
        Self::RouteDelete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::TypeChange => "type_change",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::RouteAdd => "route_add",
            Self::RouteDelete => "route_delete",
        }
    }
}

/// Changes common to every link-layer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEvent {
    Create,
    Delete,
    Up,
    Down,
    LowerLayerDown,
    SetMaster,
    UnsetMaster,
    /// An address set was attached to the link.
    Transform,
}

impl DeviceEvent {
    pub const ALL: [Self; 8] = [
        Self::Create,
        Self::Delete,
        Self::Up,
        Self::Down,
        Self::LowerLayerDown,
        Self::SetMaster,
        Self::UnsetMaster,
        Self::Transform,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Up => "up",
            Self::Down => "down",
            Self::LowerLayerDown => "lower_layer_down",
            Self::SetMaster => "set_master",
            Self::UnsetMaster => "unset_master",
            Self::Transform => "transform",
        }
    }
}

/// Bridge-specific changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeEvent {
    Create,
    Delete,
    PortAdded,
    PortRemoved,
}

impl BridgeEvent {
    pub const ALL: [Self; 4] = [Self::Create, Self::Delete, Self::PortAdded, Self::PortRemoved];

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::PortAdded => "port_added",
            Self::PortRemoved => "port_removed",
        }
    }
}

/// Veth peer resolution changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VethEvent {
    Pair,
    Unknown,
    Delete,
}

impl VethEvent {
    pub const ALL: [Self; 3] = [Self::Pair, Self::Unknown, Self::Delete];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pair => "pair",
            Self::Unknown => "unknown",
            Self::Delete => "delete",
        }
    }
}

/// Layer-3 address set changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressEvent {
    Create,
    AddAddress,
    RemoveAddress,
    Delete,
}

impl AddressEvent {
    pub const ALL: [Self; 4] = [
        Self::Create,
        Self::AddAddress,
        Self::RemoveAddress,
        Self::Delete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::AddAddress => "add_address",
            Self::RemoveAddress => "remove_address",
            Self::Delete => "delete",
        }
    }
}

/// A subscribable event kind, written `<object>.<event>` in text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Namespace(NamespaceEvent),
    Device(DeviceEvent),
    Bridge(BridgeEvent),
    Veth(VethEvent),
    Address(AddressEvent),
}

impl EventKind {
    /// Every kind in the vocabulary.
    pub fn all() -> impl Iterator<Item = EventKind> {
        NamespaceEvent::ALL
            .into_iter()
            .map(Self::Namespace)
            .chain(DeviceEvent::ALL.into_iter().map(Self::Device))
            .chain(BridgeEvent::ALL.into_iter().map(Self::Bridge))
            .chain(VethEvent::ALL.into_iter().map(Self::Veth))
            .chain(AddressEvent::ALL.into_iter().map(Self::Address))
    }

    pub fn object(&self) -> &'static str {
        match self {
            Self::Namespace(_) => "namespace",
            Self::Device(_) => "device",
            Self::Bridge(_) => "bridge",
            Self::Veth(_) => "veth",
            Self::Address(_) => "address",
        }
    }

    pub fn event(&self) -> &'static str {
        match self {
            Self::Namespace(e) => e.name(),
            Self::Device(e) => e.name(),
            Self::Bridge(e) => e.name(),
            Self::Veth(e) => e.name(),
            Self::Address(e) => e.name(),
        }
    }

    /// Expand a kind pattern. `<object>.*` selects every event of an object.
    pub fn parse_pattern(pattern: &str) -> Result<Vec<EventKind>> {
        if let Some(object) = pattern.strip_suffix(".*") {
            let kinds: Vec<_> = Self::all().filter(|k| k.object() == object).collect();
            if kinds.is_empty() {
                return Err(Error::UnknownEventKind {
                    name: pattern.to_string(),
                });
            }
            return Ok(kinds);
        }
        pattern.parse().map(|kind| vec![kind])
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object(), self.event())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::all()
            .find(|kind| kind.to_string() == wanted)
            .ok_or_else(|| Error::UnknownEventKind {
                name: s.to_string(),
            })
    }
}

/// A self-contained change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum Notification {
    Namespace {
        event: NamespaceEvent,
        namespace: NamespaceSnapshot,
    },
    Device {
        event: DeviceEvent,
        device: DeviceSnapshot,
    },
    Bridge {
        event: BridgeEvent,
        device: DeviceSnapshot,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u32>,
    },
    Veth {
        event: VethEvent,
        device: DeviceSnapshot,
    },
    Address {
        event: AddressEvent,
        device: L3Snapshot,
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<IpNet>,
    },
}

impl Notification {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Namespace { event, .. } => EventKind::Namespace(*event),
            Self::Device { event, .. } => EventKind::Device(*event),
            Self::Bridge { event, .. } => EventKind::Bridge(*event),
            Self::Veth { event, .. } => EventKind::Veth(*event),
            Self::Address { event, .. } => EventKind::Address(*event),
        }
    }

    /// Namespace the changed object belongs to.
    pub fn namespace(&self) -> &str {
        match self {
            Self::Namespace { namespace, .. } => &namespace.name,
            Self::Device { device, .. } | Self::Bridge { device, .. } | Self::Veth { device, .. } => {
                &device.namespace
            }
            Self::Address { device, .. } => &device.namespace,
        }
    }

    /// Kernel index of the changed device, if the object is a device.
    pub fn index(&self) -> Option<u32> {
        match self {
            Self::Namespace { .. } => None,
            Self::Device { device, .. } | Self::Bridge { device, .. } | Self::Veth { device, .. } => {
                Some(device.index)
            }
            Self::Address { device, .. } => Some(device.index),
        }
    }
}

/// Handle returned by every subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Sink = Box<dyn Fn(&Notification) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: Option<HashSet<EventKind>>,
    sink: Sink,
}

impl Subscriber {
    fn wants(&self, kind: &EventKind) -> bool {
        self.filter.as_ref().is_none_or(|kinds| kinds.contains(kind))
    }
}

/// Observer registry shared by the topology and all device actors.
///
/// Sinks run synchronously on the publishing task, so they must not block
/// and must not subscribe or unsubscribe from inside the callback. Use
/// [`NotificationHub::channel`] to move work elsewhere.
pub struct NotificationHub {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, filter: Option<HashSet<EventKind>>, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, filter, sink });
        id
    }

    /// Receive every notification.
    pub fn subscribe_all<F>(&self, sink: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.register(None, Box::new(sink))
    }

    /// Receive only the listed kinds.
    pub fn subscribe<I, F>(&self, kinds: I, sink: F) -> SubscriptionId
    where
        I: IntoIterator<Item = EventKind>,
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.register(Some(kinds.into_iter().collect()), Box::new(sink))
    }

    /// Receive the kinds named in text form (`namespace.connect`, `veth.*`).
    ///
    /// The whole list is validated before anything is registered, so an
    /// unknown name leaves the hub untouched.
    pub fn subscribe_named<S, F>(&self, names: &[S], sink: F) -> Result<SubscriptionId>
    where
        S: AsRef<str>,
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let kinds = parse_kinds(names)?;
        Ok(self.subscribe(kinds, sink))
    }

    /// Receive notifications on a channel holding up to `capacity` of them.
    ///
    /// `None` subscribes to everything. Publishing never waits on the
    /// receiver: a notification that finds the channel full is dropped and
    /// logged.
    pub fn channel(
        &self,
        kinds: Option<Vec<EventKind>>,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = AtomicU64::new(0);
        let sink: Sink = Box::new(move |notification: &Notification| {
            match tx.try_send(notification.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(lost)) => {
                    let dropped = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(kind = %lost.kind(), dropped, "subscriber queue full, notification dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        });
        let id = self.register(kinds.map(|k| k.into_iter().collect()), sink);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver a notification to every interested subscriber.
    pub fn publish(&self, notification: Notification) {
        let kind = notification.kind();
        tracing::trace!(%kind, namespace = notification.namespace(), "notify");
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for subscriber in subscribers.iter().filter(|s| s.wants(&kind)) {
            (subscriber.sink)(&notification);
        }
    }
}

/// Parse a list of kind patterns, failing on the first unknown one.
pub fn parse_kinds<S: AsRef<str>>(names: &[S]) -> Result<Vec<EventKind>> {
    let mut kinds = Vec::new();
    for name in names {
        kinds.extend(EventKind::parse_pattern(name.as_ref())?);
    }
    Ok(kinds)
}
