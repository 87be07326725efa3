//! Network namespace handles and a thread that runs work inside them.
//!
//! `setns(2)` switches the calling thread only, which does not mix with a
//! work-stealing runtime. Anything that has to happen inside another
//! namespace (in practice: creating sockets, which stay bound to the
//! namespace they were created in) goes through a [`NamespaceExecutor`],
//! whose single OS thread enters the namespace, runs the job and switches
//! back.
//!
//! # Example
//!
//! ```ignore
//! use nstopo::netlink::namespace::{NamespaceExecutor, NamespaceSource};
//! use nstopo::netlink::socket::raw_socket;
//!
//! let executor = NamespaceExecutor::spawn()?;
//! let socket = executor
//!     .run_in(&NamespaceSource::Named("blue".into()), raw_socket)
//!     .await?;
//! ```

use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;

use crate::{Error, Result};

/// The runtime directory where named network namespaces are stored.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Where a namespace can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceSource {
    /// The namespace this process started in.
    Current,
    /// A named namespace under `/var/run/netns`.
    Named(String),
    /// Any namespace file, e.g. a bind mount.
    Path(PathBuf),
    /// The namespace of a running process.
    Pid(u32),
}

impl NamespaceSource {
    /// The namespace file to enter, or `None` for the current namespace.
    pub fn path(&self) -> Option<PathBuf> {
        match self {
            Self::Current => None,
            Self::Named(name) => Some(PathBuf::from(NETNS_RUN_DIR).join(name)),
            Self::Path(path) => Some(path.clone()),
            Self::Pid(pid) => Some(PathBuf::from(format!("/proc/{pid}/ns/net"))),
        }
    }
}

impl fmt::Display for NamespaceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::Named(name) => f.write_str(name),
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Pid(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// Open a named namespace.
pub fn open(name: &str) -> Result<NamespaceFd> {
    open_path(PathBuf::from(NETNS_RUN_DIR).join(name))
}

pub fn open_path<P: AsRef<Path>>(path: P) -> Result<NamespaceFd> {
    let file = File::open(path.as_ref()).map_err(|e| {
        Error::InvalidMessage(format!(
            "cannot open namespace '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    Ok(NamespaceFd { file })
}

pub fn open_pid(pid: u32) -> Result<NamespaceFd> {
    open_path(format!("/proc/{pid}/ns/net"))
}

/// An open namespace file.
#[derive(Debug)]
pub struct NamespaceFd {
    file: File,
}

impl NamespaceFd {
    /// Switch the calling thread into this namespace.
    pub fn enter(&self) -> Result<NamespaceGuard> {
        let original = File::open("/proc/self/ns/net")
            .map_err(|e| Error::InvalidMessage(format!("cannot open current namespace: {e}")))?;
        setns(self.file.as_raw_fd())?;
        Ok(NamespaceGuard { original })
    }
}

impl AsRawFd for NamespaceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Enter a namespace by path.
pub fn enter_path<P: AsRef<Path>>(path: P) -> Result<NamespaceGuard> {
    open_path(path)?.enter()
}

/// Restores the thread's original namespace when dropped.
#[derive(Debug)]
pub struct NamespaceGuard {
    original: File,
}

impl NamespaceGuard {
    /// Restore explicitly, surfacing the error.
    pub fn restore(self) -> Result<()> {
        setns(self.original.as_raw_fd())
        // Drop runs a second, harmless setns into the same namespace.
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original.as_raw_fd()) {
            tracing::warn!(error = %e, "failed to restore network namespace");
        }
    }
}

fn setns(fd: RawFd) -> Result<()> {
    // SAFETY: setns only reads the descriptor, which the caller keeps open
    // for the duration of the call. CLONE_NEWNET restricts it to the
    // network namespace.
    let ret = unsafe { libc::setns(fd, libc::CLONE_NEWNET) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Whether a named namespace exists.
pub fn exists(name: &str) -> bool {
    PathBuf::from(NETNS_RUN_DIR).join(name).exists()
}

/// Names of the namespaces under `/var/run/netns`, sorted.
pub fn list() -> Result<Vec<String>> {
    list_dir(Path::new(NETNS_RUN_DIR))
}

pub(crate) fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A dedicated OS thread that runs closures inside a target namespace.
///
/// Jobs run one at a time, in submission order. The thread exits once the
/// executor is dropped.
#[derive(Debug, Clone)]
pub struct NamespaceExecutor {
    jobs: mpsc::Sender<Job>,
}

impl NamespaceExecutor {
    pub fn spawn() -> Result<Self> {
        let (jobs, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("nstopo-netns".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
                tracing::trace!("namespace executor stopped");
            })?;
        Ok(Self { jobs })
    }

    /// Run `f` inside `source` and return its result.
    ///
    /// Failing to enter or to leave the namespace is reported as an error
    /// carrying the namespace that was attempted.
    pub async fn run_in<F, T>(&self, source: &NamespaceSource, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let path = source.path();
        let label = source.to_string();

        let job: Job = Box::new(move || {
            let result = match path {
                None => f(),
                Some(path) => run_entered(&path, f),
            };
            let _ = reply.send(result);
        });

        self.jobs.send(job).map_err(|_| stopped())?;
        rx.await
            .map_err(|_| stopped())?
            .map_err(|e| e.with_context(format!("in namespace {label}")))
    }
}

fn run_entered<F, T>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let guard = enter_path(path)?;
    let out = f();
    guard.restore()?;
    out
}

fn stopped() -> Error {
    Error::Io(io::Error::other("namespace executor thread has stopped"))
}
