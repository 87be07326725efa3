//! Stream of kernel updates for one namespace.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio_stream::Stream;

use super::message::MessageIter;
use super::parse::parse_message;
use super::socket::NetlinkSocket;
use crate::Result;
use crate::update::TopologyUpdate;

/// Multicast link, address and route updates from one namespace.
///
/// Created by [`KernelConnection::into_feed`](super::KernelConnection::into_feed).
/// Messages that fail to decode are logged and skipped; socket errors
/// (including `ENOBUFS` after an overrun) are yielded and the stream stays
/// usable.
pub struct KernelFeed {
    namespace: String,
    socket: NetlinkSocket,
    pending: VecDeque<TopologyUpdate>,
}

impl KernelFeed {
    pub(crate) fn new(namespace: String, socket: NetlinkSocket) -> Self {
        Self {
            namespace,
            socket,
            pending: VecDeque::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn decode(&mut self, data: &[u8]) {
        for result in MessageIter::new(data) {
            let (header, payload) = match result {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(namespace = %self.namespace, error = %e, "malformed netlink batch");
                    break;
                }
            };
            if header.is_overrun() {
                tracing::warn!(namespace = %self.namespace, "kernel reported event overrun");
                continue;
            }
            match parse_message(header, payload) {
                Ok(Some(update)) => {
                    tracing::trace!(namespace = %self.namespace, ?update, "kernel update");
                    self.pending.push_back(update);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    namespace = %self.namespace,
                    msg_type = header.nlmsg_type,
                    error = %e,
                    "skipping undecodable update"
                ),
            }
        }
    }
}

impl Stream for KernelFeed {
    type Item = Result<TopologyUpdate>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(update) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(update)));
            }
            match this.socket.poll_recv(cx) {
                Poll::Ready(Ok(data)) => this.decode(&data),
                Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
