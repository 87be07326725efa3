//! Common test utilities for integration tests.
//!
//! Provides a notification recorder, a scripted link probe, a topology
//! builder with short delays, and helpers for tests that need root.

#![allow(dead_code)]

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nstopo::events::EventKind;
use nstopo::probe::{LinkProbe, ProbeFuture, ProbedLink};
use nstopo::update::DeviceType;
use nstopo::{Notification, NotificationHub, SubscriptionId, Topology, TopologyConfig};

/// Captures every notification published on a hub.
#[derive(Clone)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Notification>>>,
    id: SubscriptionId,
}

impl Recorder {
    pub fn attach(hub: &NotificationHub) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = hub.subscribe_all(move |n| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(n.clone());
        });
        Self { seen, id }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn all(&self) -> Vec<Notification> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.all().iter().map(Notification::kind).collect()
    }

    /// Notifications of `kind` raised in `namespace`.
    pub fn of(&self, namespace: &str, kind: EventKind) -> Vec<Notification> {
        self.all()
            .into_iter()
            .filter(|n| n.kind() == kind && n.namespace() == namespace)
            .collect()
    }

    pub fn count(&self, namespace: &str, kind: EventKind) -> usize {
        self.of(namespace, kind).len()
    }

    pub fn clear(&self) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A probe answering from a table, with links that stay hidden for a given
/// number of lookups.
#[derive(Default)]
pub struct ScriptedProbe {
    links: Mutex<HashMap<(String, u32), ProbedLink>>,
    hidden: Mutex<HashMap<(String, u32), usize>>,
    lookups: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a veth visible in `namespace`.
    pub fn veth(&self, namespace: &str, index: u32, peer_index: u32) {
        self.links.lock().unwrap_or_else(PoisonError::into_inner).insert(
            (namespace.to_string(), index),
            ProbedLink {
                index,
                name: format!("veth{index}"),
                device_type: DeviceType::Veth,
                peer_index: Some(peer_index),
                peer_netnsid: None,
            },
        );
    }

    /// Answer "not found" for the next `lookups` lookups of this link.
    pub fn hide_for(&self, namespace: &str, index: u32, lookups: usize) {
        self.hidden
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((namespace.to_string(), index), lookups);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn answer(&self, namespace: &str, index: u32) -> Option<ProbedLink> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let key = (namespace.to_string(), index);
        {
            let mut hidden = self.hidden.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(remaining) = hidden.get_mut(&key)
                && *remaining > 0
            {
                *remaining -= 1;
                return None;
            }
        }
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }
}

impl LinkProbe for ScriptedProbe {
    fn link<'a>(&'a self, namespace: &'a str, index: u32) -> ProbeFuture<'a> {
        Box::pin(async move { Ok(self.answer(namespace, index)) })
    }
}

/// Configuration with delays short enough for tests.
pub fn fast_config() -> TopologyConfig {
    TopologyConfig::default()
        .with_peer_retry_delay(Duration::from_millis(5))
        .with_namespace_grace_period(Duration::from_millis(1))
}

/// A topology backed by `probe`, with a recorder attached before anything
/// is created.
pub fn topology_with(probe: Arc<dyn LinkProbe>) -> (Arc<Topology>, Recorder) {
    let hub = Arc::new(NotificationHub::new());
    let recorder = Recorder::attach(&hub);
    (Topology::new(fast_config(), hub, probe), recorder)
}

pub fn topology() -> (Arc<Topology>, Recorder) {
    topology_with(ScriptedProbe::new())
}

/// Run `ip` with `args`, failing on a non-zero exit.
pub fn ip(args: &[&str]) -> nstopo::Result<()> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(nstopo::Error::InvalidMessage(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// A named network namespace, deleted on drop.
pub struct TestNamespace {
    name: String,
}

impl TestNamespace {
    pub fn new(prefix: &str) -> nstopo::Result<Self> {
        let name = format!("nstopo-test-{}-{}", prefix, std::process::id());
        ip(&["netns", "add", &name])?;
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `ip` inside this namespace.
    pub fn ip(&self, args: &[&str]) -> nstopo::Result<()> {
        let mut full = vec!["-n", self.name.as_str()];
        full.extend_from_slice(args);
        ip(&full)
    }
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        let _ = Command::new("ip").args(["netns", "del", &self.name]).status();
    }
}

/// Check if running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Skip the test if not running as root.
///
/// Use this at the beginning of integration tests that require root privileges.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return Ok(());
        }
    };
}
