use serde::{Deserialize, Serialize};

use crate::models::MessageRecord;

/// Commands sent FROM client TO server over the chat socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// First event on a channel. `user_id` is honoured only together with a
    /// `token` issued for that account; `is_admin` is informational only.
    Authenticate {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_admin: Option<bool>,
    },

    /// A chat message. `user_id` names the recipient when the sender is an admin.
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_admin: Option<bool>,
    },
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A persisted message, either forwarded or echoed back to its sender.
    Message {
        message: MessageRecord,
        /// Registry key of the originating channel for non-admin senders, so an
        /// admin can address a reply to a visitor.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_key: Option<i64>,
    },
}
