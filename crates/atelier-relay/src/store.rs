use anyhow::Result;

use atelier_db::Database;
use atelier_types::models::{MessageRecord, User};

/// Persistence for chat transcripts. Implementations may block; async callers
/// go through `spawn_blocking`.
pub trait MessageStore: Send + Sync + 'static {
    /// Append a message, assigning its id and timestamp.
    fn persist(&self, user_id: Option<i64>, content: &str, is_admin: bool) -> Result<MessageRecord>;

    /// Messages in creation order. `None` returns every conversation.
    fn list_messages(&self, user_id: Option<i64>) -> Result<Vec<MessageRecord>>;

    /// Toggle the read flag. Returns false if no such message exists.
    fn mark_read(&self, id: i64, read: bool) -> Result<bool>;

    /// Lowest participant key on record, so new visitor keys can start below
    /// every key already used in history.
    fn lowest_participant_key(&self) -> Result<Option<i64>>;
}

/// Account lookup used by the handshake to detect admins.
pub trait IdentityProvider: Send + Sync + 'static {
    fn get_user(&self, id: i64) -> Result<Option<User>>;
}

impl MessageStore for Database {
    fn persist(&self, user_id: Option<i64>, content: &str, is_admin: bool) -> Result<MessageRecord> {
        self.insert_message(user_id, content, is_admin)?.into_record()
    }

    fn list_messages(&self, user_id: Option<i64>) -> Result<Vec<MessageRecord>> {
        self.get_messages(user_id)?
            .into_iter()
            .map(|row| row.into_record())
            .collect()
    }

    fn mark_read(&self, id: i64, read: bool) -> Result<bool> {
        self.set_message_read(id, read)
    }

    fn lowest_participant_key(&self) -> Result<Option<i64>> {
        self.min_message_user_id()
    }
}

impl IdentityProvider for Database {
    fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.get_user_by_id(id)?.map(|row| row.into_user()).transpose()
    }
}
