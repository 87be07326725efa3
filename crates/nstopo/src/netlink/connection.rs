//! Per-namespace kernel connection.
//!
//! A [`KernelConnection`] holds two route sockets created inside the same
//! namespace: one for requests (enumeration and point lookups), one
//! subscribed to the link, address and route multicast groups. The event
//! socket is subscribed before anything is enumerated, so nothing that
//! changes during enumeration is lost; it may be seen twice, which the
//! topology tolerates.
//!
//! # Example
//!
//! ```ignore
//! use nstopo::netlink::{KernelConnection, NamespaceExecutor, NamespaceSource};
//! use tokio_stream::StreamExt;
//!
//! let executor = NamespaceExecutor::spawn()?;
//! let conn = KernelConnection::open(&executor, "blue", &NamespaceSource::Named("blue".into())).await?;
//! for link in conn.links().await? {
//!     println!("{} {}", link.index, link.name);
//! }
//! let mut feed = conn.into_feed();
//! while let Some(update) = feed.next().await {
//!     println!("{:?}", update?);
//! }
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;

use super::feed::KernelFeed;
use super::message::{
    MessageBuilder, MessageIter, NLM_F_DUMP, NLM_F_DUMP_INTR, NLM_F_REQUEST, NlMsgError, NlMsgHdr,
    NlMsgType,
};
use super::namespace::{NamespaceExecutor, NamespaceSource};
use super::parse::{IfAddrMsg, IfInfoMsg, RtMsg, parse_address, parse_link, parse_route};
use super::socket::{NetlinkSocket, groups, raw_socket};
use crate::update::{AddrUpdate, DeviceType, LinkUpdate, RouteUpdate};
use crate::{Error, Result};

/// Request and event sockets for one namespace.
pub struct KernelConnection {
    namespace: String,
    requests: Requester,
    events: NetlinkSocket,
}

impl KernelConnection {
    /// Create both sockets inside `source` and subscribe the event socket.
    pub async fn open(
        executor: &NamespaceExecutor,
        namespace: &str,
        source: &NamespaceSource,
    ) -> Result<Self> {
        let (request, event) = executor
            .run_in(source, || Ok((raw_socket()?, raw_socket()?)))
            .await?;

        let mut events = NetlinkSocket::from_raw(event)?;
        for group in groups::TOPOLOGY {
            events.add_membership(group)?;
        }
        tracing::debug!(namespace, %source, "kernel connection open");

        Ok(Self {
            namespace: namespace.to_string(),
            requests: Requester::new(NetlinkSocket::from_raw(request)?),
            events,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// A cloneable handle on the request socket.
    pub fn requester(&self) -> Requester {
        self.requests.clone()
    }

    pub async fn links(&self) -> Result<Vec<LinkUpdate>> {
        self.requests.links().await
    }

    pub async fn addresses(&self) -> Result<Vec<AddrUpdate>> {
        self.requests.addresses().await
    }

    pub async fn routes(&self) -> Result<Vec<RouteUpdate>> {
        self.requests.routes().await
    }

    pub async fn link(&self, index: u32) -> Result<Option<LinkUpdate>> {
        self.requests.link(index).await
    }

    /// Turn the event socket into a stream of updates.
    ///
    /// Handles from [`requester`](Self::requester) stay usable.
    pub fn into_feed(self) -> KernelFeed {
        KernelFeed::new(self.namespace, self.events)
    }
}

/// Shared request side of a [`KernelConnection`].
///
/// Requests are serialized; replies are matched by sequence number.
#[derive(Clone)]
pub struct Requester {
    socket: Arc<Mutex<NetlinkSocket>>,
}

impl Requester {
    fn new(socket: NetlinkSocket) -> Self {
        Self {
            socket: Arc::new(Mutex::new(socket)),
        }
    }

    /// Every link, announced as a full update, bridges first and the rest
    /// by index.
    ///
    /// Bridges go first so that ports enumerated later find their master.
    pub async fn links(&self) -> Result<Vec<LinkUpdate>> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&IfInfoMsg::default());

        let mut links = self
            .dump(builder, |hdr, payload| {
                parse_link(hdr.nlmsg_type, payload).map(Some)
            })
            .await?;
        for link in &mut links {
            link.full = true;
        }
        sort_links(&mut links);
        Ok(links)
    }

    pub async fn addresses(&self) -> Result<Vec<AddrUpdate>> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETADDR, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&IfAddrMsg::default());
        self.dump(builder, |hdr, payload| {
            parse_address(hdr.nlmsg_type, payload).map(Some)
        })
        .await
    }

    /// Main-table routes.
    pub async fn routes(&self) -> Result<Vec<RouteUpdate>> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETROUTE, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&RtMsg::default());
        self.dump(builder, |hdr, payload| parse_route(hdr.nlmsg_type, payload))
            .await
    }

    /// Look a single link up; `None` if the kernel does not know it.
    pub async fn link(&self, index: u32) -> Result<Option<LinkUpdate>> {
        let mut builder = MessageBuilder::new(NlMsgType::RTM_GETLINK, NLM_F_REQUEST);
        builder.append(&IfInfoMsg {
            ifi_index: index as i32,
            ..Default::default()
        });

        let socket = self.socket.lock().await;
        let seq = send(&socket, builder).await?;
        loop {
            let data = socket.recv_msg().await?;
            for result in MessageIter::new(&data) {
                let (header, payload) = result?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if err.is_ack() {
                        return Ok(None);
                    }
                    let err = Error::from_errno(err.error);
                    if err.is_not_found() {
                        return Ok(None);
                    }
                    return Err(err.with_context(format!("get link {index}")));
                }
                if header.nlmsg_type == NlMsgType::RTM_NEWLINK {
                    let mut link = parse_link(header.nlmsg_type, payload)?;
                    link.full = true;
                    return Ok(Some(link));
                }
            }
        }
    }

    /// Run a dump and decode each reply with `decode`.
    ///
    /// Replies that fail to decode are logged and skipped.
    async fn dump<T, F>(&self, builder: MessageBuilder, decode: F) -> Result<Vec<T>>
    where
        F: Fn(&NlMsgHdr, &[u8]) -> Result<Option<T>>,
    {
        let socket = self.socket.lock().await;
        let seq = send(&socket, builder).await?;

        let mut out = Vec::new();
        loop {
            let data = socket.recv_msg().await?;
            for result in MessageIter::new(&data) {
                let (header, payload) = result?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if !err.is_ack() {
                        return Err(Error::from_errno(err.error));
                    }
                    continue;
                }
                if header.is_done() {
                    return Ok(out);
                }
                if header.nlmsg_flags & NLM_F_DUMP_INTR != 0 {
                    tracing::debug!("dump interrupted by a concurrent change");
                }
                match decode(header, payload) {
                    Ok(Some(item)) => out.push(item),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(
                        msg_type = header.nlmsg_type,
                        error = %e,
                        "skipping undecodable dump entry"
                    ),
                }
            }
        }
    }
}

async fn send(socket: &NetlinkSocket, mut builder: MessageBuilder) -> Result<u32> {
    let seq = socket.next_seq();
    builder.set_seq(seq);
    builder.set_pid(socket.pid());
    socket.send(&builder.finish()).await?;
    Ok(seq)
}

/// Bridges first, then everything else; each group by index.
pub(crate) fn sort_links(links: &mut [LinkUpdate]) {
    links.sort_by_key(|l| (l.device_type != DeviceType::Bridge, l.index));
}
