//! Acting identities
//!
//! Handlers receive the identity they act under as an explicit parameter.
//! An authenticated satellite acts as itself: it may read what concerns its
//! own node and nothing it was not sent.

use crate::domain::NodeName;
use crate::error::{Error, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSubject {
    /// The controller acting on its own behalf
    System,
    /// An authenticated satellite
    Peer(NodeName),
    /// A connection that has not authenticated yet
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessContext {
    subject: AccessSubject,
    privileged: bool,
}

impl AccessContext {
    pub fn system() -> Self {
        Self {
            subject: AccessSubject::System,
            privileged: true,
        }
    }

    /// Elevated enough to receive its own node's state, scoped to that node
    pub fn peer(node: NodeName) -> Self {
        Self {
            subject: AccessSubject::Peer(node),
            privileged: true,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            subject: AccessSubject::Anonymous,
            privileged: false,
        }
    }

    pub fn subject(&self) -> &AccessSubject {
        &self.subject
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Node this identity is scoped to, failing for anything but a peer
    pub fn require_peer(&self) -> Result<&NodeName> {
        match &self.subject {
            AccessSubject::Peer(node) => Ok(node),
            AccessSubject::System => Err(Error::Implementation(
                "system identity used where a peer identity is required".into(),
            )),
            AccessSubject::Anonymous => Err(Error::AuthenticationFailed {
                node: "<anonymous>".into(),
                reason: "connection is not authenticated".into(),
            }),
        }
    }
}

impl Default for AccessContext {
    fn default() -> Self {
        Self::anonymous()
    }
}
