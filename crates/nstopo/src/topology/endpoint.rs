//! Namespace-qualified device identifiers.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::Error;

/// A device endpoint, written `<namespace>:<index>`.
///
/// Kernel indices are only unique inside one namespace, so connection
/// edges are recorded against endpoints rather than bare indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointId {
    pub namespace: String,
    pub index: u32,
}

impl EndpointId {
    pub fn new(namespace: impl Into<String>, index: u32) -> Self {
        Self {
            namespace: namespace.into(),
            index,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.index)
    }
}

impl FromStr for EndpointId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (namespace, index) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidEndpoint(format!("'{s}' has no ':<index>' suffix")))?;
        if namespace.is_empty() {
            return Err(Error::InvalidEndpoint(format!("'{s}' has an empty namespace")));
        }
        let index = index
            .parse()
            .map_err(|_| Error::InvalidEndpoint(format!("'{s}' has a non-numeric index")))?;
        Ok(Self::new(namespace, index))
    }
}

/// Namespace portion of a connection identifier.
///
/// Accepts both compound identifiers (`ns1:20`) and bare namespace names.
pub fn namespace_of(id: &str) -> &str {
    match id.parse::<EndpointId>() {
        Ok(_) => id.rsplit_once(':').map_or(id, |(ns, _)| ns),
        Err(_) => id,
    }
}
