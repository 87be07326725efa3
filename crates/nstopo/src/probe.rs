//! Point lookups of kernel links, used to resolve veth peers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use crate::Result;
use crate::update::{DeviceType, LinkUpdate};

/// What a lookup learns about one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedLink {
    pub index: u32,
    pub name: String,
    pub device_type: DeviceType,
    pub peer_index: Option<u32>,
    pub peer_netnsid: Option<i32>,
}

impl From<&LinkUpdate> for ProbedLink {
    fn from(update: &LinkUpdate) -> Self {
        Self {
            index: update.index,
            name: update.name.clone(),
            device_type: update.device_type.clone(),
            peer_index: update.peer_index,
            peer_netnsid: update.peer_netnsid,
        }
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<ProbedLink>>> + Send + 'a>>;

/// Resolve a link by index inside a namespace.
///
/// `Ok(None)` means the link is not (yet) visible there. Implementations
/// must not block the calling task.
pub trait LinkProbe: Send + Sync {
    fn link<'a>(&'a self, namespace: &'a str, index: u32) -> ProbeFuture<'a>;
}

/// A probe that never sees anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl LinkProbe for NoProbe {
    fn link<'a>(&'a self, _namespace: &'a str, _index: u32) -> ProbeFuture<'a> {
        Box::pin(async { Ok(None) })
    }
}

/// A probe answering from an in-memory table.
///
/// Used when replaying recorded updates, where the replayed link updates
/// are the only source of truth.
#[derive(Debug, Default)]
pub struct StaticProbe {
    links: Mutex<HashMap<(String, u32), ProbedLink>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, link: ProbedLink) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((namespace.to_string(), link.index), link);
    }

    pub fn remove(&self, namespace: &str, index: u32) -> Option<ProbedLink> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), index))
    }

    /// Drop every link of a namespace.
    pub fn clear_namespace(&self, namespace: &str) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(ns, _), _| ns != namespace);
    }

    fn get(&self, namespace: &str, index: u32) -> Option<ProbedLink> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), index))
            .cloned()
    }
}

impl LinkProbe for StaticProbe {
    fn link<'a>(&'a self, namespace: &'a str, index: u32) -> ProbeFuture<'a> {
        let found = self.get(namespace, index);
        Box::pin(async move { Ok(found) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_probe() {
        let probe = StaticProbe::new();
        let update = LinkUpdate::added(7, "veth7", DeviceType::Veth).peer(8);
        probe.insert("ns1", ProbedLink::from(&update));

        let link = probe.link("ns1", 7).await.unwrap().unwrap();
        assert_eq!(link.peer_index, Some(8));
        assert!(probe.link("ns2", 7).await.unwrap().is_none());

        probe.clear_namespace("ns1");
        assert!(probe.link("ns1", 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_probe() {
        assert!(NoProbe.link("default", 1).await.unwrap().is_none());
    }
}
