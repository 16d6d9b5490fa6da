use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use atelier_types::events::ServerEvent;

/// Send capability for one live channel. Clones share the same connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelHandle {
    /// Create a handle plus the receiver its writer task drains.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            conn_id: Uuid::new_v4(),
            tx,
        };
        (handle, rx)
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// A channel is open while its writer still holds the receiver.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Best-effort send. Returns false if the writer is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Default)]
struct RegistryState {
    /// participant key -> most recently registered channel
    participants: HashMap<i64, ChannelHandle>,

    /// Channels bound to the admin role, compared by conn_id
    admins: Vec<ChannelHandle>,
}

/// Live channels, keyed by participant, plus the admin pool.
///
/// Owned by a single [`Relay`](crate::Relay); nothing here is global.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,

    /// Visitor keys count down from -1 or lower, so they never collide with
    /// user ids, which SQLite assigns from 1 upwards.
    next_visitor_key: AtomicI64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_visitor_keys_below(None)
    }

    /// Start visitor keys below `lowest`, the smallest key already present in
    /// stored history, so keys from a previous run are never handed out again.
    pub fn with_visitor_keys_below(lowest: Option<i64>) -> Self {
        let first = lowest.map_or(-1, |key| key.saturating_sub(1).min(-1));
        Self {
            state: Mutex::new(RegistryState::default()),
            next_visitor_key: AtomicI64::new(first),
        }
    }

    /// Allocate a session-scoped key for an anonymous visitor.
    pub fn next_visitor_key(&self) -> i64 {
        self.next_visitor_key.fetch_sub(1, Ordering::Relaxed)
    }

    /// Register a channel under a participant key. Last registration wins;
    /// the displaced handle, if any, is returned.
    pub async fn register_participant(
        &self,
        key: i64,
        handle: ChannelHandle,
    ) -> Option<ChannelHandle> {
        self.state.lock().await.participants.insert(key, handle)
    }

    /// Unregister a participant, but only if conn_id still owns the key.
    pub async fn unregister_participant(&self, key: i64, conn_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let owns_key = state
            .participants
            .get(&key)
            .is_some_and(|handle| handle.conn_id == conn_id);

        if owns_key {
            state.participants.remove(&key);
        }
        owns_key
    }

    pub async fn add_admin(&self, handle: ChannelHandle) {
        let mut state = self.state.lock().await;
        if !state.admins.iter().any(|h| h.conn_id == handle.conn_id) {
            state.admins.push(handle);
        }
    }

    pub async fn remove_admin(&self, conn_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let before = state.admins.len();
        state.admins.retain(|h| h.conn_id != conn_id);
        state.admins.len() != before
    }

    /// Send a targeted event to one participant. Returns true if a live channel
    /// accepted it.
    pub async fn send_to_participant(&self, key: i64, event: ServerEvent) -> bool {
        let state = self.state.lock().await;
        match state.participants.get(&key) {
            Some(handle) if handle.is_open() => handle.send(event),
            _ => false,
        }
    }

    /// Send an event to every open admin channel. Closed channels are skipped
    /// and left for their close handler to prune. Returns the delivery count.
    pub async fn send_to_admins(&self, event: ServerEvent) -> usize {
        let state = self.state.lock().await;
        state
            .admins
            .iter()
            .filter(|handle| handle.is_open())
            .filter(|handle| handle.send(event.clone()))
            .count()
    }

    /// The conn_id currently registered under a participant key.
    pub async fn participant_conn(&self, key: i64) -> Option<Uuid> {
        self.state
            .lock()
            .await
            .participants
            .get(&key)
            .map(|handle| handle.conn_id)
    }

    pub async fn is_admin_conn(&self, conn_id: Uuid) -> bool {
        self.state
            .lock()
            .await
            .admins
            .iter()
            .any(|handle| handle.conn_id == conn_id)
    }

    pub async fn admin_count(&self) -> usize {
        self.state.lock().await.admins.len()
    }

    pub async fn participant_count(&self) -> usize {
        self.state.lock().await.participants.len()
    }
}
