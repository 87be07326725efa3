//! Abstract kernel updates consumed by the topology.
//!
//! The netlink adapter produces these from `RTM_*` messages, and replay
//! scripts deserialize them from JSON. The core never sees raw netlink.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Administrative "up" flag.
pub const IFF_UP: u32 = 0x1;
/// Driver signals the link is running.
pub const IFF_RUNNING: u32 = 0x40;
/// Carrier is present.
pub const IFF_LOWER_UP: u32 = 0x1_0000;

/// Whether an update adds/changes or removes an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    New,
    Delete,
}

/// RFC 2863 operational state, as reported in `IFLA_OPERSTATE`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperState {
    Unknown,
    #[default]
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

impl OperState {
    /// Map the kernel's `IF_OPER_*` value.
    pub fn from_kernel(value: u8) -> Self {
        match value {
            0 => Self::Unknown,
            1 => Self::NotPresent,
            2 => Self::Down,
            3 => Self::LowerLayerDown,
            4 => Self::Testing,
            5 => Self::Dormant,
            6 => Self::Up,
            _ => Self::Unknown,
        }
    }
}

/// Link kind from `IFLA_INFO_KIND`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceType {
    Bridge,
    Veth,
    /// Any other kind; empty for links without link info (physical, loopback).
    #[default]
    Other,
    Named(String),
}

impl DeviceType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Bridge => "bridge",
            Self::Veth => "veth",
            Self::Other => "",
            Self::Named(kind) => kind,
        }
    }
}

impl From<&str> for DeviceType {
    fn from(kind: &str) -> Self {
        match kind {
            "bridge" => Self::Bridge,
            "veth" => Self::Veth,
            "" => Self::Other,
            other => Self::Named(other.to_string()),
        }
    }
}

impl From<String> for DeviceType {
    fn from(kind: String) -> Self {
        Self::from(kind.as_str())
    }
}

impl From<DeviceType> for String {
    fn from(kind: DeviceType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A link (RTM_NEWLINK / RTM_DELLINK) notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkUpdate {
    pub kind: UpdateKind,
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<u32>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub oper_state: OperState,
    /// The whole object was (re)announced rather than a single field.
    #[serde(default)]
    pub full: bool,
    /// Kernel-reported veth peer index (`IFLA_LINK`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_index: Option<u32>,
    /// Peer lives in another namespace (`IFLA_LINK_NETNSID`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_netnsid: Option<i32>,
}

impl LinkUpdate {
    fn new(kind: UpdateKind, index: u32, full: bool) -> Self {
        Self {
            kind,
            index,
            master: None,
            name: String::new(),
            device_type: DeviceType::Other,
            flags: 0,
            oper_state: OperState::NotPresent,
            full,
            peer_index: None,
            peer_netnsid: None,
        }
    }

    /// A full announcement of a link.
    pub fn added(index: u32, name: impl Into<String>, device_type: DeviceType) -> Self {
        let mut update = Self::new(UpdateKind::New, index, true);
        update.name = name.into();
        update.device_type = device_type;
        update
    }

    /// A full removal of a link.
    pub fn removed(index: u32) -> Self {
        Self::new(UpdateKind::Delete, index, true)
    }

    /// A single-field change of an existing link.
    pub fn changed(index: u32) -> Self {
        Self::new(UpdateKind::New, index, false)
    }

    /// A partial delete, as sent when a port leaves its master.
    pub fn released(index: u32, master: u32) -> Self {
        let mut update = Self::new(UpdateKind::Delete, index, false);
        update.master = Some(master);
        update
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn master(mut self, master: u32) -> Self {
        self.master = (master != 0).then_some(master);
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn oper_state(mut self, state: OperState) -> Self {
        self.oper_state = state;
        self
    }

    /// Shorthand for an administratively up link with the given carrier state.
    pub fn up(self, state: OperState) -> Self {
        self.flags(IFF_UP | IFF_RUNNING).oper_state(state)
    }

    pub fn peer(mut self, peer_index: u32) -> Self {
        self.peer_index = Some(peer_index);
        self
    }

    pub fn peer_netnsid(mut self, nsid: i32) -> Self {
        self.peer_netnsid = Some(nsid);
        self
    }

    pub fn is_bridge(&self) -> bool {
        self.device_type == DeviceType::Bridge
    }

    pub fn is_veth(&self) -> bool {
        self.device_type == DeviceType::Veth
    }
}

/// An address (RTM_NEWADDR / RTM_DELADDR) notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrUpdate {
    pub kind: UpdateKind,
    pub index: u32,
    pub address: IpNet,
}

impl AddrUpdate {
    pub fn new(kind: UpdateKind, index: u32, address: IpNet) -> Self {
        Self {
            kind,
            index,
            address,
        }
    }
}

/// A route in a namespace's main table.
///
/// Routes are identified by the (source, destination, gateway) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IpAddr>,
    /// `None` for the default route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<IpNet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Some(dst) => write!(f, "{dst}")?,
            None => f.write_str("default")?,
        }
        if let Some(gw) = &self.gateway {
            write!(f, " via {gw}")?;
        }
        if let Some(src) = &self.source {
            write!(f, " src {src}")?;
        }
        Ok(())
    }
}

/// A route (RTM_NEWROUTE / RTM_DELROUTE) notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub kind: UpdateKind,
    pub route: Route,
}

/// Any per-namespace kernel update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopologyUpdate {
    Link(LinkUpdate),
    Address(AddrUpdate),
    Route(RouteUpdate),
}

impl From<LinkUpdate> for TopologyUpdate {
    fn from(update: LinkUpdate) -> Self {
        Self::Link(update)
    }
}

impl From<AddrUpdate> for TopologyUpdate {
    fn from(update: AddrUpdate) -> Self {
        Self::Address(update)
    }
}

impl From<RouteUpdate> for TopologyUpdate {
    fn from(update: RouteUpdate) -> Self {
        Self::Route(update)
    }
}

/// Namespace appearance or teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Start,
    Destroy,
}

/// A namespace lifecycle notification from the discovery side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceLifecycle {
    pub kind: LifecycleKind,
    /// Namespace name (entry under `/var/run/netns`, or a caller-chosen id).
    pub name: String,
}

impl NamespaceLifecycle {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            kind: LifecycleKind::Start,
            name: name.into(),
        }
    }

    pub fn destroy(name: impl Into<String>) -> Self {
        Self {
            kind: LifecycleKind::Destroy,
            name: name.into(),
        }
    }
}
