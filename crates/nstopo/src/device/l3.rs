//! Layer-3 address sets.
//!
//! An L3 device shares its `(namespace, index)` identity with the link of
//! the same index but runs as its own actor, so address churn never queues
//! behind link commands.

use std::sync::Arc;

use ipnet::IpNet;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::events::{AddressEvent, Notification, NotificationHub};
use crate::{Error, Result};

/// Point-in-time view of an address set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct L3Snapshot {
    pub index: u32,
    pub namespace: String,
    pub addresses: Vec<IpNet>,
}

/// Addresses assigned to one link, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3Device {
    index: u32,
    namespace: String,
    addresses: Vec<IpNet>,
}

impl L3Device {
    pub fn new(namespace: impl Into<String>, index: u32) -> Self {
        Self {
            index,
            namespace: namespace.into(),
            addresses: Vec::new(),
        }
    }

    pub fn addresses(&self) -> &[IpNet] {
        &self.addresses
    }

    /// Append an address unless the same (address, prefix) is present.
    pub fn add_address(&mut self, address: IpNet) -> bool {
        if self.addresses.contains(&address) {
            return false;
        }
        self.addresses.push(address);
        true
    }

    pub fn remove_address(&mut self, address: &IpNet) -> bool {
        let before = self.addresses.len();
        self.addresses.retain(|a| a != address);
        self.addresses.len() != before
    }

    pub fn snapshot(&self) -> L3Snapshot {
        L3Snapshot {
            index: self.index,
            namespace: self.namespace.clone(),
            addresses: self.addresses.clone(),
        }
    }

    fn publish(&self, hub: &NotificationHub, event: AddressEvent, address: Option<IpNet>) {
        hub.publish(Notification::Address {
            event,
            device: self.snapshot(),
            address,
        });
    }
}

#[derive(Debug)]
enum AddressCommand {
    Add(IpNet),
    Remove(IpNet),
    Dump(oneshot::Sender<L3Snapshot>),
    Delete(oneshot::Sender<L3Snapshot>),
}

/// Start an address actor seeded with `initial` addresses.
pub(crate) fn spawn(
    device: L3Device,
    initial: Vec<IpNet>,
    hub: Arc<NotificationHub>,
    capacity: usize,
) -> L3Handle {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = L3Handle {
        index: device.index,
        namespace: device.namespace.as_str().into(),
        tx,
    };
    let span = tracing::debug_span!("l3", namespace = %handle.namespace, index = handle.index);
    tokio::spawn(run(device, initial, rx, hub).instrument(span));
    handle
}

async fn run(
    mut device: L3Device,
    initial: Vec<IpNet>,
    mut mailbox: mpsc::Receiver<AddressCommand>,
    hub: Arc<NotificationHub>,
) {
    device.publish(&hub, AddressEvent::Create, None);
    for address in initial {
        if device.add_address(address) {
            device.publish(&hub, AddressEvent::AddAddress, Some(address));
        }
    }

    while let Some(command) = mailbox.recv().await {
        tracing::trace!(?command, "address command");
        match command {
            AddressCommand::Add(address) => {
                if device.add_address(address) {
                    device.publish(&hub, AddressEvent::AddAddress, Some(address));
                } else {
                    tracing::debug!(%address, "duplicate address ignored");
                }
            }
            AddressCommand::Remove(address) => {
                if device.remove_address(&address) {
                    device.publish(&hub, AddressEvent::RemoveAddress, Some(address));
                }
            }
            AddressCommand::Dump(reply) => {
                let _ = reply.send(device.snapshot());
            }
            AddressCommand::Delete(reply) => {
                mailbox.close();
                let addresses = device.addresses.clone();
                for address in addresses {
                    device.remove_address(&address);
                    device.publish(&hub, AddressEvent::RemoveAddress, Some(address));
                }
                device.publish(&hub, AddressEvent::Delete, None);
                let _ = reply.send(device.snapshot());
                return;
            }
        }
    }
}

/// Sending side of an address actor.
#[derive(Debug, Clone)]
pub struct L3Handle {
    index: u32,
    namespace: Arc<str>,
    tx: mpsc::Sender<AddressCommand>,
}

impl L3Handle {
    pub fn index(&self) -> u32 {
        self.index
    }

    fn gone(&self) -> Error {
        Error::ActorGone {
            namespace: self.namespace.to_string(),
            index: self.index,
        }
    }

    async fn send(&self, command: AddressCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| self.gone())
    }

    pub async fn add_address(&self, address: IpNet) -> Result<()> {
        self.send(AddressCommand::Add(address)).await
    }

    pub async fn remove_address(&self, address: IpNet) -> Result<()> {
        self.send(AddressCommand::Remove(address)).await
    }

    pub async fn dump(&self) -> Result<L3Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(AddressCommand::Dump(reply)).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Remove every address, then stop the actor.
    pub async fn delete(&self) -> Result<L3Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(AddressCommand::Delete(reply)).await?;
        rx.await.map_err(|_| self.gone())
    }
}
