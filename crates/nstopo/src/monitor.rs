//! Glue between the kernel adapter and the [`Topology`].
//!
//! A [`Monitor`] owns one feed task per monitored namespace. Starting a
//! namespace opens its sockets, registers it with the [`NetlinkProbe`],
//! enumerates links, addresses and routes into the topology, and only then
//! starts applying live updates.
//!
//! Feeds are never aborted. Stopping one lets it apply what is already
//! queued, then it returns between two updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};

use crate::netlink::{KernelConnection, NamespaceExecutor, NamespaceSource, NetlinkProbe};
use crate::topology::Topology;
use crate::update::{LifecycleKind, NamespaceLifecycle, TopologyUpdate};
use crate::{Error, Result};

/// `ip netns add` creates the file before bind-mounting the namespace onto it.
const START_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Monitor {
    topology: Arc<Topology>,
    probe: Arc<NetlinkProbe>,
    executor: NamespaceExecutor,
    feeds: Mutex<HashMap<String, FeedTask>>,
}

/// A running feed and the signal that stops it.
///
/// Dropping the task without calling [`FeedTask::stop`] also stops the
/// feed, without waiting for it.
struct FeedTask {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl FeedTask {
    fn spawn<S>(topology: Arc<Topology>, namespace: String, feed: S) -> Self
    where
        S: Stream<Item = Result<TopologyUpdate>> + Send + 'static,
    {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(run_feed(topology, namespace, feed, stopped));
        Self { stop, task }
    }

    /// Signal the feed and wait until its last update is applied.
    async fn stop(self, namespace: &str) {
        // Already gone if the feed ended on its own.
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(namespace, error = %e, "feed task failed");
        }
    }
}

impl Monitor {
    /// `probe` must be the probe `topology` was built with.
    pub fn new(topology: Arc<Topology>, probe: Arc<NetlinkProbe>) -> Result<Self> {
        Ok(Self {
            topology,
            probe,
            executor: NamespaceExecutor::spawn()?,
            feeds: Mutex::new(HashMap::new()),
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Monitor the namespace the process runs in.
    ///
    /// Failure here leaves nothing to monitor, so callers treat it as fatal.
    pub async fn start_default(&self) -> Result<()> {
        let name = self.topology.config().default_namespace.clone();
        self.start_namespace(&name, NamespaceSource::Current).await
    }

    /// Start monitoring a namespace under `name`.
    ///
    /// Starting a namespace that is already monitored does nothing.
    pub async fn start_namespace(&self, name: &str, source: NamespaceSource) -> Result<()> {
        if self.is_monitored(name) {
            tracing::debug!(namespace = name, "namespace already monitored");
            return Ok(());
        }

        let conn = KernelConnection::open(&self.executor, name, &source).await?;
        self.probe.register(name, conn.requester());

        if let Err(e) = self.enumerate(name, &conn).await {
            self.probe.unregister(name);
            return Err(e);
        }

        let feed = FeedTask::spawn(self.topology.clone(), name.to_string(), conn.into_feed());
        let previous = self
            .feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), feed);
        // Lost a race with a concurrent start of the same namespace.
        if let Some(previous) = previous {
            tracing::debug!(namespace = name, "duplicate feed stopped");
            drop(previous);
        }
        tracing::info!(namespace = name, %source, "monitoring namespace");
        Ok(())
    }

    /// Stop the feed and tear the namespace down.
    ///
    /// The feed keeps running through the grace period so updates already
    /// on their way are applied before the devices are deleted.
    pub async fn stop_namespace(&self, name: &str) -> bool {
        let feed = self
            .feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        let Some(namespace) = self.topology.namespace(name) else {
            if let Some(feed) = feed {
                feed.stop(name).await;
            }
            self.probe.unregister(name);
            return false;
        };

        tokio::time::sleep(self.topology.config().namespace_grace_period).await;
        if let Some(feed) = feed {
            feed.stop(name).await;
        }
        self.probe.unregister(name);
        self.topology.teardown_namespace(&namespace).await;
        true
    }

    /// React to a namespace appearing or disappearing.
    ///
    /// Failures are logged; the event is dropped.
    pub async fn handle_lifecycle(&self, event: &NamespaceLifecycle) {
        match event.kind {
            LifecycleKind::Start => {
                let source = NamespaceSource::Named(event.name.clone());
                if let Err(first) = self.start_namespace(&event.name, source.clone()).await {
                    tracing::debug!(namespace = %event.name, error = %first, "start failed, retrying");
                    tokio::time::sleep(START_RETRY_DELAY).await;
                    if let Err(e) = self.start_namespace(&event.name, source).await {
                        tracing::warn!(namespace = %event.name, error = %e, "cannot monitor namespace");
                    }
                }
            }
            LifecycleKind::Destroy => {
                if !self.stop_namespace(&event.name).await {
                    tracing::debug!(namespace = %event.name, "destroy of unmonitored namespace");
                }
            }
        }
    }

    /// Stop every feed and delete every namespace.
    pub async fn shutdown(&self) {
        let feeds: Vec<(String, FeedTask)> = self
            .feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        tokio::time::sleep(self.topology.config().namespace_grace_period).await;
        for (name, feed) in feeds {
            feed.stop(&name).await;
            self.probe.unregister(&name);
        }
        for name in self.topology.namespace_names() {
            if let Some(namespace) = self.topology.namespace(&name) {
                self.topology.teardown_namespace(&namespace).await;
            }
        }
    }

    fn is_monitored(&self, name: &str) -> bool {
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    async fn enumerate(&self, name: &str, conn: &KernelConnection) -> Result<()> {
        let namespace = self.topology.create_namespace(name);

        let links = conn.links().await?;
        let addresses = conn.addresses().await?;
        let routes = conn.routes().await?;
        tracing::debug!(
            namespace = name,
            links = links.len(),
            addresses = addresses.len(),
            routes = routes.len(),
            "enumerated namespace"
        );

        for link in links {
            namespace.apply(&TopologyUpdate::Link(link)).await;
        }
        // One L3 actor per link, created with its whole address set.
        let mut by_link: BTreeMap<u32, Vec<IpNet>> = BTreeMap::new();
        for address in addresses {
            by_link.entry(address.index).or_default().push(address.address);
        }
        for (index, set) in by_link {
            namespace.add_address_device(index, set).await;
        }
        for route in routes {
            namespace.apply(&TopologyUpdate::Route(route)).await;
        }
        Ok(())
    }
}

/// Apply updates from `feed` until it ends, fails, or `stop` fires.
///
/// A ready update always wins over the stop signal, and an update is never
/// interrupted once it is being applied.
async fn run_feed<S>(
    topology: Arc<Topology>,
    namespace: String,
    feed: S,
    mut stop: oneshot::Receiver<()>,
) where
    S: Stream<Item = Result<TopologyUpdate>>,
{
    tokio::pin!(feed);
    loop {
        let item = tokio::select! {
            biased;
            item = feed.next() => item,
            _ = &mut stop => {
                tracing::debug!(namespace = %namespace, "feed stopped");
                return;
            }
        };
        match item {
            Some(Ok(update)) => topology.apply(&namespace, &update).await,
            Some(Err(e)) if is_overrun(&e) => {
                tracing::warn!(namespace = %namespace, "kernel event queue overrun, updates lost");
            }
            Some(Err(e)) => {
                tracing::error!(namespace = %namespace, error = %e, "kernel feed failed");
                return;
            }
            None => {
                tracing::error!(namespace = %namespace, "kernel feed ended");
                return;
            }
        }
    }
}

fn is_overrun(e: &Error) -> bool {
    matches!(e, Error::Io(io) if io.raw_os_error() == Some(libc::ENOBUFS))
        || e.errno() == Some(libc::ENOBUFS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use crate::events::NotificationHub;
    use crate::probe::NoProbe;
    use crate::topology::Namespace;
    use crate::update::{DeviceType, LinkUpdate};
    use crate::TopologyConfig;

    fn topology() -> (Arc<Topology>, Arc<Namespace>) {
        let topology = Topology::new(
            TopologyConfig::default(),
            Arc::new(NotificationHub::new()),
            Arc::new(NoProbe),
        );
        let namespace = topology.create_namespace("ns1");
        (topology, namespace)
    }

    fn link(update: LinkUpdate) -> Result<TopologyUpdate> {
        Ok(TopologyUpdate::Link(update))
    }

    #[tokio::test]
    async fn test_stop_applies_queued_updates() {
        let (topology, namespace) = topology();
        let queued = tokio_stream::iter(vec![
            link(LinkUpdate::added(1, "eth0", DeviceType::Other)),
            link(LinkUpdate::added(2, "eth1", DeviceType::Other)),
            link(LinkUpdate::removed(1)),
        ])
        .chain(tokio_stream::pending());

        let feed = FeedTask::spawn(topology.clone(), "ns1".into(), queued);
        feed.stop("ns1").await;

        assert_eq!(namespace.device_indices(), vec![2]);
    }

    #[tokio::test]
    async fn test_feed_returns_on_error() {
        let (topology, namespace) = topology();
        let failing = tokio_stream::iter(vec![
            link(LinkUpdate::added(1, "eth0", DeviceType::Other)),
            Err(Error::InvalidMessage("truncated".into())),
            link(LinkUpdate::added(2, "eth1", DeviceType::Other)),
        ]);

        let (_stop, stopped) = oneshot::channel();
        run_feed(topology, "ns1".into(), failing, stopped).await;

        assert_eq!(namespace.device_indices(), vec![1]);
    }

    #[test]
    fn test_overrun_detection() {
        assert!(is_overrun(&Error::Io(io::Error::from_raw_os_error(libc::ENOBUFS))));
        assert!(!is_overrun(&Error::Io(io::Error::from_raw_os_error(libc::EBADF))));
        assert!(!is_overrun(&Error::InvalidMessage("x".into())));
    }
}
