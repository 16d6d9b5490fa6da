//! Database row types — these map directly to SQLite rows.
//! Converted into atelier-types models at the edge of this crate.

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};

use atelier_types::models::{MessageRecord, User, UserRole};

/// Stored timestamp layout. Fixed width, so text ordering matches time ordering.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub role: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub user_id: Option<i64>,
    pub content: String,
    pub is_admin: bool,
    pub is_read: bool,
    pub created_at: String,
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses both our own layout and SQLite's `datetime('now')` output.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| anyhow!("Corrupt timestamp '{}': {}", raw, e))
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            role: self.role.parse::<UserRole>().map_err(|e| anyhow!(e))?,
            created_at: parse_timestamp(&self.created_at)?,
            username: self.username,
        })
    }
}

impl MessageRow {
    pub fn into_record(self) -> Result<MessageRecord> {
        Ok(MessageRecord {
            id: self.id,
            user_id: self.user_id,
            is_admin: self.is_admin,
            read: self.is_read,
            created_at: parse_timestamp(&self.created_at)?,
            content: self.content,
        })
    }
}
