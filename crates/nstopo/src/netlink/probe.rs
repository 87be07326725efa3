//! Kernel-backed [`LinkProbe`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::connection::Requester;
use crate::probe::{LinkProbe, ProbeFuture, ProbedLink};

/// Answers link lookups with `RTM_GETLINK` requests in the right namespace.
///
/// Namespaces are registered as their connections come up. A lookup in a
/// namespace that is not registered finds nothing.
#[derive(Default)]
pub struct NetlinkProbe {
    requesters: RwLock<HashMap<String, Requester>>,
}

impl NetlinkProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, namespace: &str, requester: Requester) {
        self.requesters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), requester);
    }

    pub fn unregister(&self, namespace: &str) -> bool {
        self.requesters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)
            .is_some()
    }

    pub fn is_registered(&self, namespace: &str) -> bool {
        self.requesters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(namespace)
    }

    fn requester(&self, namespace: &str) -> Option<Requester> {
        self.requesters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }
}

impl LinkProbe for NetlinkProbe {
    fn link<'a>(&'a self, namespace: &'a str, index: u32) -> ProbeFuture<'a> {
        let requester = self.requester(namespace);
        Box::pin(async move {
            let Some(requester) = requester else {
                tracing::debug!(namespace, index, "probe in unregistered namespace");
                return Ok(None);
            };
            let link = requester.link(index).await?;
            Ok(link.as_ref().map(ProbedLink::from))
        })
    }
}
