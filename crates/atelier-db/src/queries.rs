use crate::Database;
use crate::models::{MessageRow, UserRow, format_timestamp};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    /// Inserts a user and returns its id.
    pub fn create_user(&self, username: &str, password_hash: &str, role: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, password, role) VALUES (?1, ?2, ?3)",
                (username, password_hash, role),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", &username))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", &id))
    }

    // -- Messages --

    /// Appends a message. The timestamp is taken inside the connection lock and
    /// never precedes the newest stored message.
    pub fn insert_message(
        &self,
        user_id: Option<i64>,
        content: &str,
        is_admin: bool,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let latest: Option<String> =
                conn.query_row("SELECT MAX(created_at) FROM messages", [], |row| row.get(0))?;

            let mut created_at = format_timestamp(chrono::Utc::now());
            if let Some(latest) = latest {
                if latest > created_at {
                    created_at = latest;
                }
            }

            conn.execute(
                "INSERT INTO messages (user_id, content, is_admin, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user_id, content, is_admin, created_at],
            )?;

            Ok(MessageRow {
                id: conn.last_insert_rowid(),
                user_id,
                content: content.to_string(),
                is_admin,
                is_read: false,
                created_at,
            })
        })
    }

    /// Messages in creation order. `None` lists every conversation.
    pub fn get_messages(&self, user_id: Option<i64>) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, user_id))
    }

    /// Smallest participant id on any stored message, visitor keys included.
    pub fn min_message_user_id(&self) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let min: Option<i64> =
                conn.query_row("SELECT MIN(user_id) FROM messages", [], |row| row.get(0))?;
            Ok(min)
        })
    }

    /// Sets the read flag. Returns false if the message does not exist.
    pub fn set_message_read(&self, id: i64, read: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = ?1 WHERE id = ?2",
                rusqlite::params![read, id],
            )?;
            Ok(changed > 0)
        })
    }
}

fn query_user(
    conn: &Connection,
    column: &str,
    value: &dyn rusqlite::types::ToSql,
) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, password, role, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                role: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_messages(conn: &Connection, user_id: Option<i64>) -> Result<Vec<MessageRow>> {
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<MessageRow> {
        Ok(MessageRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            content: row.get(2)?,
            is_admin: row.get(3)?,
            is_read: row.get(4)?,
            created_at: row.get(5)?,
        })
    };

    let rows = match user_id {
        Some(user_id) => {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, content, is_admin, is_read, created_at
                 FROM messages
                 WHERE user_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            stmt.query_map([user_id], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, content, is_admin, is_read, created_at
                 FROM messages
                 ORDER BY created_at ASC, id ASC",
            )?;
            stmt.query_map([], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
