//! Named-namespace discovery through inotify.
//!
//! `ip netns add` creates a file under `/var/run/netns`; `ip netns del`
//! removes it. The watcher turns those into [`NamespaceLifecycle`] events.
//! When the directory does not exist yet, `/var/run` is watched until it
//! appears, and entries created in the meantime are reported as they are
//! discovered.
//!
//! # Example
//!
//! ```ignore
//! use nstopo::watcher::NamespaceWatcher;
//!
//! let (existing, mut watcher) = NamespaceWatcher::list_and_watch()?;
//! while let Some(event) = watcher.recv().await? {
//!     println!("{:?} {}", event.kind, event.name);
//! }
//! ```

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use inotify::{EventMask, EventStream, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio_stream::StreamExt;

use crate::netlink::namespace::{NETNS_RUN_DIR, list_dir};
use crate::update::NamespaceLifecycle;
use crate::{Error, Result};

const DIR_MASK: WatchMask = WatchMask::CREATE
    .union(WatchMask::DELETE)
    .union(WatchMask::MOVED_TO)
    .union(WatchMask::MOVED_FROM)
    .union(WatchMask::DELETE_SELF);
const PARENT_MASK: WatchMask = WatchMask::CREATE.union(WatchMask::MOVED_TO);

/// Watches a namespace directory for entries coming and going.
pub struct NamespaceWatcher {
    events: EventStream<Vec<u8>>,
    watches: Watches,
    dir: PathBuf,
    dir_wd: Option<WatchDescriptor>,
    parent_wd: Option<WatchDescriptor>,
    queued: VecDeque<NamespaceLifecycle>,
}

impl NamespaceWatcher {
    /// Watch `/var/run/netns`.
    pub fn new() -> Result<Self> {
        Self::watch_dir(NETNS_RUN_DIR)
    }

    /// Watch an arbitrary directory, falling back to its parent while it
    /// does not exist.
    pub fn watch_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let inotify = Inotify::init()?;
        let mut watches = inotify.watches();

        let mut dir_wd = None;
        let mut parent_wd = None;
        if dir.is_dir() {
            dir_wd = Some(watches.add(&dir, DIR_MASK)?);
        } else {
            let parent = parent_of(&dir)?;
            parent_wd = Some(watches.add(parent, PARENT_MASK)?);
            tracing::debug!(dir = %dir.display(), "namespace directory missing, watching parent");
        }

        Ok(Self {
            events: inotify.into_event_stream(vec![0u8; 4096])?,
            watches,
            dir,
            dir_wd,
            parent_wd,
            queued: VecDeque::new(),
        })
    }

    /// Set up the watch, then list what already exists.
    ///
    /// A namespace created between the two steps may be reported twice;
    /// starting a namespace is idempotent.
    pub fn list_and_watch() -> Result<(Vec<String>, Self)> {
        let watcher = Self::new()?;
        let current = list_dir(&watcher.dir)?;
        Ok((current, watcher))
    }

    /// Whether the namespace directory itself is being watched.
    pub fn is_watching_dir(&self) -> bool {
        self.dir_wd.is_some()
    }

    /// Next lifecycle event; `Ok(None)` once the inotify stream ends.
    pub async fn recv(&mut self) -> Result<Option<NamespaceLifecycle>> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Ok(Some(event));
            }
            let Some(event) = self.events.next().await else {
                return Ok(None);
            };
            let event = event?;
            self.process(event.wd, event.mask, event.name)?;
        }
    }

    fn process(&mut self, wd: WatchDescriptor, mask: EventMask, name: Option<OsString>) -> Result<()> {
        let name = name.map(|n| n.to_string_lossy().into_owned());

        if self.dir_wd.as_ref() == Some(&wd) {
            if mask.contains(EventMask::DELETE_SELF) {
                tracing::debug!(dir = %self.dir.display(), "namespace directory removed");
                self.dir_wd = None;
                let parent = parent_of(&self.dir)?;
                self.parent_wd = Some(self.watches.add(parent, PARENT_MASK)?);
            } else if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
                if let Some(name) = name {
                    self.queued.push_back(NamespaceLifecycle::start(name));
                }
            } else if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM)
                && let Some(name) = name
            {
                self.queued.push_back(NamespaceLifecycle::destroy(name));
            }
        } else if self.parent_wd.as_ref() == Some(&wd) {
            let dir_name = self.dir.file_name().map(|n| n.to_string_lossy().into_owned());
            if name.is_some() && name == dir_name && self.dir.is_dir() {
                self.dir_wd = Some(self.watches.add(&self.dir, DIR_MASK)?);
                if let Some(parent_wd) = self.parent_wd.take() {
                    // The parent watch may already be gone with its directory.
                    let _ = self.watches.remove(parent_wd);
                }
                tracing::debug!(dir = %self.dir.display(), "namespace directory appeared");
                for existing in list_dir(&self.dir)? {
                    self.queued.push_back(NamespaceLifecycle::start(existing));
                }
            }
        }
        Ok(())
    }
}

fn parent_of(dir: &Path) -> Result<&Path> {
    dir.parent()
        .ok_or_else(|| Error::Config(format!("'{}' has no parent directory", dir.display())))
}
