//! Kernel side of the topology: rtnetlink sockets in each namespace.
//!
//! Everything here turns `RTM_*` traffic into [`crate::update`] values.
//! The topology core never sees raw netlink.

pub mod attr;
pub mod connection;
mod feed;
pub mod message;
pub mod namespace;
pub mod parse;
pub mod probe;
pub mod socket;

pub use connection::{KernelConnection, Requester};
pub use feed::KernelFeed;
pub use namespace::{NamespaceExecutor, NamespaceFd, NamespaceGuard, NamespaceSource};
pub use probe::NetlinkProbe;
pub use socket::NetlinkSocket;
