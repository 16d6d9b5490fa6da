use uuid::Uuid;

use crate::registry::ChannelHandle;

/// Role of a channel, fixed once by the authenticate handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened, handshake not yet received
    Pending,
    Admin,
    /// Signed-in user, registered under their user id
    AuthenticatedUser(i64),
    /// Anonymous visitor, registered under a session-scoped key
    Visitor(i64),
}

impl Role {
    /// The registry key this role is addressable by, if any.
    pub fn registry_key(&self) -> Option<i64> {
        match self {
            Self::AuthenticatedUser(key) | Self::Visitor(key) => Some(*key),
            Self::Pending | Self::Admin => None,
        }
    }
}

/// Per-channel state held by the connection task.
#[derive(Debug)]
pub struct Session {
    pub(crate) handle: ChannelHandle,
    pub(crate) role: Role,
    pub(crate) closed: bool,
}

impl Session {
    pub fn new(handle: ChannelHandle) -> Self {
        Self {
            handle,
            role: Role::Pending,
            closed: false,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.handle.conn_id()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
