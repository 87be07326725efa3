//! Device actors.
//!
//! Every kernel link object is owned by one tokio task. The task holds the
//! device state exclusively and applies commands from a bounded mailbox one
//! at a time, so commands sent to the same device take effect in send order.
//! The namespace holds a [`DeviceHandle`] and never touches the state
//! directly.
//!
//! Specialized devices ([`bridge::Bridge`], [`veth::Veth`]) wrap a
//! [`LinkDevice`] and plug into the shared loop through [`LinkActor`].
//! Address sets live in a separate actor, [`l3::L3Device`].

pub mod bridge;
pub mod l3;
pub mod veth;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::events::{DeviceEvent, Notification, NotificationHub};
use crate::update::{DeviceType, IFF_UP, OperState};
use crate::{Error, Result};

/// Derived link status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Down,
    Up,
    LowerLayerDown,
}

impl Status {
    /// Status for an (interface flags, operational state) pair.
    ///
    /// An administratively down link is always `Down`. An up link follows
    /// its carrier: `Up`/`Unknown` is up, `LowerLayerDown` is reported as
    /// such, and every other state counts as down.
    pub fn from_link(flags: u32, oper_state: OperState) -> Self {
        if flags & IFF_UP == 0 {
            return Self::Down;
        }
        match oper_state {
            OperState::Up | OperState::Unknown => Self::Up,
            OperState::LowerLayerDown => Self::LowerLayerDown,
            _ => Self::Down,
        }
    }

    fn event(self) -> DeviceEvent {
        match self {
            Self::Down => DeviceEvent::Down,
            Self::Up => DeviceEvent::Up,
            Self::LowerLayerDown => DeviceEvent::LowerLayerDown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Down => "DOWN",
            Self::Up => "UP",
            Self::LowerLayerDown => "LOWERLAYERDOWN",
        })
    }
}

/// Which actor flavour backs a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Interface,
    Bridge,
    Veth,
}

impl From<&DeviceType> for DeviceKind {
    fn from(device_type: &DeviceType) -> Self {
        match device_type {
            DeviceType::Bridge => Self::Bridge,
            DeviceType::Veth => Self::Veth,
            _ => Self::Interface,
        }
    }
}

/// Identity of the far end of a veth pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VethPeer {
    pub index: u32,
    pub name: String,
    pub namespace: String,
}

/// Point-in-time view of a link-layer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub index: u32,
    pub name: String,
    pub namespace: String,
    pub kind: DeviceKind,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<u32>,
    pub flags: u32,
    pub oper_state: OperState,
    /// Bridge ports in the order they joined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u32>>,
    /// Kernel-reported peer index of a veth, known before pairing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<VethPeer>,
}

/// State shared by every link-layer device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDevice {
    name: String,
    index: u32,
    namespace: String,
    status: Status,
    master: Option<u32>,
    flags: u32,
    oper_state: OperState,
}

impl LinkDevice {
    pub fn new(namespace: impl Into<String>, index: u32, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index,
            namespace: namespace.into(),
            status: Status::Down,
            master: None,
            flags: 0,
            oper_state: OperState::NotPresent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn master(&self) -> Option<u32> {
        self.master
    }

    /// Apply new flags and operational state.
    ///
    /// Returns the event to announce, or `None` when nothing changed.
    pub fn set_flags(&mut self, flags: u32, oper_state: OperState) -> Option<DeviceEvent> {
        if self.flags == flags && self.oper_state == oper_state {
            return None;
        }
        self.flags = flags;
        self.oper_state = oper_state;
        self.status = Status::from_link(flags, oper_state);
        Some(self.status.event())
    }

    pub fn set_master(&mut self, master: u32) -> Option<DeviceEvent> {
        if master == 0 || self.master == Some(master) {
            return None;
        }
        self.master = Some(master);
        Some(DeviceEvent::SetMaster)
    }

    pub fn unset_master(&mut self) -> Option<DeviceEvent> {
        self.master.take().map(|_| DeviceEvent::UnsetMaster)
    }

    /// Returns `true` if the name changed.
    pub fn rename(&mut self, name: String) -> bool {
        if self.name == name {
            return false;
        }
        self.name = name;
        true
    }

    pub fn snapshot(&self, kind: DeviceKind) -> DeviceSnapshot {
        DeviceSnapshot {
            index: self.index,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            kind,
            status: self.status,
            master: self.master,
            flags: self.flags,
            oper_state: self.oper_state,
            ports: None,
            peer_index: None,
            peer: None,
        }
    }
}

/// Messages accepted by a link-layer device actor.
#[derive(Debug)]
pub(crate) enum DeviceCommand {
    SetFlags { flags: u32, oper_state: OperState },
    SetMaster(u32),
    UnsetMaster,
    Rename(String),
    Transform,
    AddPort(u32),
    RemovePort(u32),
    Pair(VethPeer),
    PeerUnknown,
    Dump(oneshot::Sender<DeviceSnapshot>),
    Delete(oneshot::Sender<DeviceSnapshot>),
}

/// Behaviour plugged into the shared device loop.
pub(crate) trait LinkActor: Send + 'static {
    fn kind(&self) -> DeviceKind;

    fn base(&self) -> &LinkDevice;

    fn base_mut(&mut self) -> &mut LinkDevice;

    fn snapshot(&self) -> DeviceSnapshot {
        self.base().snapshot(self.kind())
    }

    fn created(&self, hub: &NotificationHub) {
        hub.publish(Notification::Device {
            event: DeviceEvent::Create,
            device: self.snapshot(),
        });
    }

    fn deleted(&self, hub: &NotificationHub) {
        hub.publish(Notification::Device {
            event: DeviceEvent::Delete,
            device: self.snapshot(),
        });
    }

    /// Commands specific to this flavour of device.
    fn handle(&mut self, command: DeviceCommand, _hub: &NotificationHub) {
        tracing::debug!(?command, "command not supported by device, ignored");
    }
}

impl LinkActor for LinkDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Interface
    }

    fn base(&self) -> &LinkDevice {
        self
    }

    fn base_mut(&mut self) -> &mut LinkDevice {
        self
    }
}

/// Start an actor task and return its handle.
pub(crate) fn spawn<A: LinkActor>(
    actor: A,
    hub: Arc<NotificationHub>,
    capacity: usize,
) -> DeviceHandle {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = DeviceHandle {
        index: actor.base().index(),
        namespace: actor.base().namespace().into(),
        kind: actor.kind(),
        tx,
    };
    let span = tracing::debug_span!(
        "device",
        namespace = %handle.namespace,
        index = handle.index
    );
    tokio::spawn(run(actor, rx, hub).instrument(span));
    handle
}

async fn run<A: LinkActor>(
    mut actor: A,
    mut mailbox: mpsc::Receiver<DeviceCommand>,
    hub: Arc<NotificationHub>,
) {
    actor.created(&hub);

    while let Some(command) = mailbox.recv().await {
        tracing::trace!(?command, "device command");
        let event = match command {
            DeviceCommand::SetFlags { flags, oper_state } => {
                actor.base_mut().set_flags(flags, oper_state)
            }
            DeviceCommand::SetMaster(master) => actor.base_mut().set_master(master),
            DeviceCommand::UnsetMaster => actor.base_mut().unset_master(),
            DeviceCommand::Rename(name) => {
                if actor.base_mut().rename(name) {
                    tracing::debug!(name = actor.base().name(), "renamed");
                }
                None
            }
            DeviceCommand::Transform => Some(DeviceEvent::Transform),
            DeviceCommand::Dump(reply) => {
                let _ = reply.send(actor.snapshot());
                None
            }
            DeviceCommand::Delete(reply) => {
                mailbox.close();
                actor.deleted(&hub);
                let _ = reply.send(actor.snapshot());
                return;
            }
            other => {
                actor.handle(other, &hub);
                None
            }
        };

        if let Some(event) = event {
            hub.publish(Notification::Device {
                event,
                device: actor.snapshot(),
            });
        }
    }

    tracing::trace!("device mailbox closed");
}

/// Sending side of a device actor.
///
/// Sends wait for mailbox capacity, which is how a busy actor applies
/// backpressure to the namespace feeding it.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    index: u32,
    namespace: Arc<str>,
    kind: DeviceKind,
    tx: mpsc::Sender<DeviceCommand>,
}

impl DeviceHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Whether the actor task is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn gone(&self) -> Error {
        Error::ActorGone {
            namespace: self.namespace.to_string(),
            index: self.index,
        }
    }

    async fn send(&self, command: DeviceCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| self.gone())
    }

    pub async fn set_flags(&self, flags: u32, oper_state: OperState) -> Result<()> {
        self.send(DeviceCommand::SetFlags { flags, oper_state }).await
    }

    pub async fn set_master(&self, master: u32) -> Result<()> {
        self.send(DeviceCommand::SetMaster(master)).await
    }

    pub async fn unset_master(&self) -> Result<()> {
        self.send(DeviceCommand::UnsetMaster).await
    }

    pub async fn rename(&self, name: impl Into<String>) -> Result<()> {
        self.send(DeviceCommand::Rename(name.into())).await
    }

    /// Announce that an address set was attached to this link.
    pub async fn transform(&self) -> Result<()> {
        self.send(DeviceCommand::Transform).await
    }

    pub async fn add_port(&self, port: u32) -> Result<()> {
        self.send(DeviceCommand::AddPort(port)).await
    }

    pub async fn remove_port(&self, port: u32) -> Result<()> {
        self.send(DeviceCommand::RemovePort(port)).await
    }

    pub async fn pair(&self, peer: VethPeer) -> Result<()> {
        self.send(DeviceCommand::Pair(peer)).await
    }

    pub async fn peer_unknown(&self) -> Result<()> {
        self.send(DeviceCommand::PeerUnknown).await
    }

    /// Snapshot the device once every earlier command has been applied.
    pub async fn dump(&self) -> Result<DeviceSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceCommand::Dump(reply)).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Stop the actor. Returns the final snapshot.
    pub async fn delete(&self) -> Result<DeviceSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceCommand::Delete(reply)).await?;
        rx.await.map_err(|_| self.gone())
    }
}

/// Spawn the actor matching a link's kind.
pub(crate) fn spawn_for(
    base: LinkDevice,
    device_type: &DeviceType,
    peer_index: Option<u32>,
    hub: Arc<NotificationHub>,
    capacity: usize,
) -> DeviceHandle {
    match DeviceKind::from(device_type) {
        DeviceKind::Bridge => spawn(bridge::Bridge::new(base), hub, capacity),
        DeviceKind::Veth => spawn(veth::Veth::new(base, peer_index), hub, capacity),
        DeviceKind::Interface => spawn(base, hub, capacity),
    }
}
