use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use atelier_types::events::{ClientCommand, ServerEvent};
use atelier_types::models::{MessageRecord, UserRole};

use crate::error::RelayError;
use crate::registry::{ChannelHandle, ConnectionRegistry};
use crate::session::{Role, Session};
use crate::store::{IdentityProvider, MessageStore};
use crate::token;

/// Routes chat traffic between visitors, users and the admin pool.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    registry: ConnectionRegistry,
    store: Arc<dyn MessageStore>,
    identities: Arc<dyn IdentityProvider>,
    jwt_secret: String,
}

impl Relay {
    /// Build a relay over its collaborators. Visitor keys resume below the
    /// lowest participant key already in the store.
    pub fn new(
        store: Arc<dyn MessageStore>,
        identities: Arc<dyn IdentityProvider>,
        jwt_secret: String,
    ) -> Self {
        let lowest = store.lowest_participant_key().unwrap_or_else(|e| {
            warn!("could not read stored participant keys: {:#}", e);
            None
        });

        Self {
            inner: Arc::new(RelayInner {
                registry: ConnectionRegistry::with_visitor_keys_below(lowest),
                store,
                identities,
                jwt_secret,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Open a pending session. The receiver yields everything sent to it.
    pub fn open_session(&self) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (handle, rx) = ChannelHandle::open();
        (Session::new(handle), rx)
    }

    /// Entry point for one raw inbound frame. Nothing escapes this boundary:
    /// malformed input and failures are logged and the channel carries on.
    pub async fn handle_text(&self, session: &mut Session, text: &str) {
        let cmd = match serde_json::from_str::<ClientCommand>(text) {
            Ok(cmd) => cmd,
            Err(e) => {
                let raw: String = text.chars().take(200).collect();
                warn!("{} bad event: {} -- raw: {}", session.conn_id(), e, raw);
                return;
            }
        };

        if let Err(e) = self.handle_command(session, cmd).await {
            error!("{} event failed: {}", session.conn_id(), e);
        }
    }

    pub async fn handle_command(
        &self,
        session: &mut Session,
        cmd: ClientCommand,
    ) -> Result<(), RelayError> {
        match cmd {
            ClientCommand::Authenticate { user_id, token, .. } => {
                self.authenticate(session, user_id, token.as_deref()).await;
                Ok(())
            }
            ClientCommand::Message {
                user_id, content, ..
            } => self.dispatch(session, user_id, &content).await.map(|_| ()),
        }
    }

    /// Resolve and fix the channel's role. Only the first handshake counts.
    ///
    /// A channel is bound to an account only when it presents a valid token for
    /// that account and the account exists; everything else joins as a visitor.
    pub async fn authenticate(
        &self,
        session: &mut Session,
        user_id: Option<i64>,
        token: Option<&str>,
    ) {
        if session.closed {
            return;
        }
        if session.role != Role::Pending {
            warn!(
                "{} repeated authenticate ignored (role {:?})",
                session.conn_id(),
                session.role
            );
            return;
        }

        let account = match self.verified_subject(session, user_id, token) {
            Some(subject) => self.account_role(subject).await.map(|role| (subject, role)),
            None => None,
        };

        let registry = &self.inner.registry;
        let role = match account {
            Some((_, UserRole::Admin)) => {
                registry.add_admin(session.handle.clone()).await;
                Role::Admin
            }
            Some((user_id, UserRole::User)) => {
                registry
                    .register_participant(user_id, session.handle.clone())
                    .await;
                Role::AuthenticatedUser(user_id)
            }
            None => {
                let key = registry.next_visitor_key();
                registry.register_participant(key, session.handle.clone()).await;
                Role::Visitor(key)
            }
        };

        session.role = role;
        info!("{} authenticated as {:?}", session.conn_id(), role);
    }

    /// Persist a message and forward it. Returns the stored record, or `None`
    /// when the event was dropped.
    pub async fn dispatch(
        &self,
        session: &Session,
        target: Option<i64>,
        content: &str,
    ) -> Result<Option<MessageRecord>, RelayError> {
        if session.closed {
            return Ok(None);
        }
        if content.trim().is_empty() {
            debug!("{} dropped empty message", session.conn_id());
            return Ok(None);
        }

        let (user_id, is_admin) = match session.role {
            Role::Pending => {
                debug!("{} dropped message before authenticate", session.conn_id());
                return Ok(None);
            }
            Role::Admin => match target {
                Some(target) => (Some(target), true),
                None => {
                    debug!("{} dropped admin message without recipient", session.conn_id());
                    return Ok(None);
                }
            },
            Role::AuthenticatedUser(user_id) => (Some(user_id), false),
            Role::Visitor(_) => (None, false),
        };

        let record = self.persist(user_id, content, is_admin).await?;

        let event = ServerEvent::Message {
            message: record.clone(),
            sender_key: session.role.registry_key(),
        };

        let registry = &self.inner.registry;
        match (session.role, user_id) {
            (Role::Admin, Some(target)) => {
                if !registry.send_to_participant(target, event.clone()).await {
                    debug!("participant {} offline, reply {} stored only", target, record.id);
                }
            }
            _ => {
                let delivered = registry.send_to_admins(event.clone()).await;
                debug!("message {} forwarded to {} admins", record.id, delivered);
            }
        }

        session.handle.send(event);

        Ok(Some(record))
    }

    /// Tear down the channel's registry entry. Safe to call more than once.
    pub async fn close(&self, session: &mut Session) {
        if session.closed {
            return;
        }
        session.closed = true;

        let registry = &self.inner.registry;
        let conn_id = session.conn_id();
        match session.role {
            Role::AuthenticatedUser(key) | Role::Visitor(key) => {
                registry.unregister_participant(key, conn_id).await;
            }
            Role::Admin => {
                registry.remove_admin(conn_id).await;
            }
            Role::Pending => {}
        }
    }

    async fn persist(
        &self,
        user_id: Option<i64>,
        content: &str,
        is_admin: bool,
    ) -> Result<MessageRecord, RelayError> {
        let store = self.inner.store.clone();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || store.persist(user_id, &content, is_admin))
            .await?
            .map_err(RelayError::Storage)
    }

    /// The account a handshake may claim: the token's subject, provided the
    /// token verifies and agrees with any `userId` sent alongside it.
    fn verified_subject(
        &self,
        session: &Session,
        user_id: Option<i64>,
        token: Option<&str>,
    ) -> Option<i64> {
        let Some(token) = token else {
            if let Some(user_id) = user_id {
                warn!("{} claimed user {} without a token", session.conn_id(), user_id);
            }
            return None;
        };

        let claims = match token::verify(&self.inner.jwt_secret, token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!("{} handshake token rejected: {}", session.conn_id(), e);
                return None;
            }
        };

        match user_id {
            Some(user_id) if user_id != claims.sub => {
                warn!(
                    "{} token for user {} presented as user {}",
                    session.conn_id(),
                    claims.sub,
                    user_id
                );
                None
            }
            _ => Some(claims.sub),
        }
    }

    /// Role of a verified account, or `None` if it no longer exists. A failed
    /// lookup counts as a regular user.
    async fn account_role(&self, user_id: i64) -> Option<UserRole> {
        let identities = self.inner.identities.clone();
        let lookup = tokio::task::spawn_blocking(move || identities.get_user(user_id)).await;

        match lookup {
            Ok(Ok(user)) => user.map(|user| user.role),
            Ok(Err(e)) => {
                warn!("identity lookup for {} failed: {:#}", user_id, e);
                Some(UserRole::User)
            }
            Err(e) => {
                warn!("identity lookup for {} panicked: {}", user_id, e);
                Some(UserRole::User)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::{Result, anyhow};
    use atelier_types::models::User;

    use super::*;

    const SECRET: &str = "relay-test-secret";

    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
        fail: AtomicBool,
        rows: Mutex<Vec<MessageRecord>>,
    }

    impl MessageStore for CountingStore {
        fn persist(&self, user_id: Option<i64>, content: &str, is_admin: bool) -> Result<MessageRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("disk full"));
            }
            let mut rows = self.rows.lock().unwrap();
            let record = MessageRecord {
                id: rows.len() as i64 + 1,
                user_id,
                content: content.to_string(),
                is_admin,
                read: false,
                created_at: chrono::Utc::now(),
            };
            rows.push(record.clone());
            Ok(record)
        }

        fn list_messages(&self, user_id: Option<i64>) -> Result<Vec<MessageRecord>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|r| user_id.is_none() || r.user_id == user_id)
                .cloned()
                .collect())
        }

        fn mark_read(&self, _id: i64, _read: bool) -> Result<bool> {
            Ok(false)
        }

        fn lowest_participant_key(&self) -> Result<Option<i64>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.iter().filter_map(|r| r.user_id).min())
        }
    }

    struct Accounts(HashMap<i64, UserRole>);

    impl IdentityProvider for Accounts {
        fn get_user(&self, id: i64) -> Result<Option<User>> {
            Ok(self.0.get(&id).map(|role| User {
                id,
                username: format!("user{}", id),
                role: *role,
                created_at: chrono::Utc::now(),
            }))
        }
    }

    fn relay() -> (Relay, Arc<CountingStore>) {
        let store = Arc::new(CountingStore::default());
        let accounts = Accounts(HashMap::from([
            (1, UserRole::Admin),
            (2, UserRole::Admin),
            (3, UserRole::Admin),
            (7, UserRole::User),
        ]));
        (
            Relay::new(store.clone(), Arc::new(accounts), SECRET.to_string()),
            store,
        )
    }

    /// Handshake with a token issued for `user_id`.
    async fn sign_in(relay: &Relay, session: &mut Session, user_id: i64) {
        let token = token::issue(SECRET, user_id, "someone").unwrap();
        relay.authenticate(session, Some(user_id), Some(&token)).await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<MessageRecord> {
        let mut out = Vec::new();
        while let Ok(ServerEvent::Message { message, .. }) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn handshake_assigns_exactly_one_membership() {
        let (relay, _) = relay();

        let (mut admin, _admin_rx) = relay.open_session();
        sign_in(&relay, &mut admin, 1).await;
        assert_eq!(admin.role(), Role::Admin);
        assert!(relay.registry().is_admin_conn(admin.conn_id()).await);
        assert_eq!(relay.registry().participant_conn(1).await, None);

        let (mut user, _user_rx) = relay.open_session();
        sign_in(&relay, &mut user, 7).await;
        assert_eq!(user.role(), Role::AuthenticatedUser(7));
        assert!(!relay.registry().is_admin_conn(user.conn_id()).await);
        assert_eq!(relay.registry().participant_conn(7).await, Some(user.conn_id()));

        // A signed token for an account that no longer exists joins as a visitor
        let (mut stranger, _stranger_rx) = relay.open_session();
        sign_in(&relay, &mut stranger, 99).await;
        assert!(matches!(stranger.role(), Role::Visitor(_)));
        assert_eq!(relay.registry().participant_conn(99).await, None);

        let (mut visitor, _visitor_rx) = relay.open_session();
        relay.authenticate(&mut visitor, None, None).await;
        let Role::Visitor(key) = visitor.role() else {
            panic!("expected visitor role, got {:?}", visitor.role());
        };
        assert_eq!(relay.registry().participant_conn(key).await, Some(visitor.conn_id()));
    }

    #[tokio::test]
    async fn unverified_user_id_cannot_join_admin_pool() {
        let (relay, _) = relay();

        let (mut admin, mut admin_rx) = relay.open_session();
        sign_in(&relay, &mut admin, 1).await;

        // Bare id, forged signature, and a real token presented under another id
        let forged = token::issue("someone-elses-secret", 2, "mallory").unwrap();
        let user_token = token::issue(SECRET, 7, "user7").unwrap();
        let attempts = [
            (Some(2), None),
            (Some(2), Some(forged.as_str())),
            (Some(3), Some(user_token.as_str())),
        ];

        let mut spoofers = Vec::new();
        for (user_id, token) in attempts {
            let (mut spoofer, rx) = relay.open_session();
            relay.authenticate(&mut spoofer, user_id, token).await;
            assert!(
                matches!(spoofer.role(), Role::Visitor(_)),
                "unexpected role {:?}",
                spoofer.role()
            );
            spoofers.push((spoofer, rx));
        }
        assert_eq!(relay.registry().admin_count().await, 1);

        let (mut visitor, _visitor_rx) = relay.open_session();
        relay.authenticate(&mut visitor, None, None).await;
        relay.dispatch(&visitor, None, "my card number").await.unwrap();

        assert_eq!(drain(&mut admin_rx).len(), 1);
        for (_, rx) in spoofers.iter_mut() {
            assert!(drain(rx).is_empty());
        }
    }

    #[tokio::test]
    async fn visitor_key_cannot_be_claimed_by_another_channel() {
        let (relay, _) = relay();

        let (mut admin, _admin_rx) = relay.open_session();
        sign_in(&relay, &mut admin, 1).await;
        let (mut visitor, mut visitor_rx) = relay.open_session();
        relay.authenticate(&mut visitor, None, None).await;
        let key = visitor.role().registry_key().unwrap();

        // Neither a bare claim nor a signed token for the key takes it over
        let (mut bare, mut bare_rx) = relay.open_session();
        relay.authenticate(&mut bare, Some(key), None).await;
        let (mut signed, mut signed_rx) = relay.open_session();
        sign_in(&relay, &mut signed, key).await;

        for hijacker in [&bare, &signed] {
            assert_ne!(hijacker.role(), Role::AuthenticatedUser(key));
            assert_ne!(hijacker.role().registry_key(), Some(key));
        }
        assert_eq!(relay.registry().participant_conn(key).await, Some(visitor.conn_id()));

        relay.dispatch(&admin, Some(key), "reply for visitor").await.unwrap();
        assert_eq!(drain(&mut visitor_rx).len(), 1);
        assert!(drain(&mut bare_rx).is_empty());
        assert!(drain(&mut signed_rx).is_empty());
    }

    #[tokio::test]
    async fn role_is_assigned_once() {
        let (relay, _) = relay();
        let (mut session, _rx) = relay.open_session();

        sign_in(&relay, &mut session, 7).await;
        sign_in(&relay, &mut session, 1).await;

        assert_eq!(session.role(), Role::AuthenticatedUser(7));
        assert_eq!(relay.registry().admin_count().await, 0);
    }

    #[tokio::test]
    async fn visitor_message_reaches_every_admin_plus_echo() {
        let (relay, store) = relay();

        let mut admin_rxs = Vec::new();
        for id in 1..=3 {
            let (mut admin, rx) = relay.open_session();
            sign_in(&relay, &mut admin, id).await;
            admin_rxs.push((admin, rx));
        }

        let (mut visitor, mut visitor_rx) = relay.open_session();
        relay.authenticate(&mut visitor, None, None).await;
        relay
            .handle_text(&mut visitor, r#"{"type":"message","content":"x"}"#)
            .await;

        let mut sends = drain(&mut visitor_rx).len();
        for (_, rx) in admin_rxs.iter_mut() {
            let received = drain(rx);
            assert_eq!(received.len(), 1);
            sends += received.len();
        }
        assert_eq!(sends, 4);

        let rows = store.list_messages(None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, None);
        assert!(!rows[0].is_admin);
    }

    #[tokio::test]
    async fn one_channel_is_forwarded_in_send_order() {
        let (relay, _) = relay();

        let (mut admin_a, mut rx_a) = relay.open_session();
        sign_in(&relay, &mut admin_a, 1).await;
        let (mut admin_b, mut rx_b) = relay.open_session();
        sign_in(&relay, &mut admin_b, 2).await;

        let (mut visitor, mut visitor_rx) = relay.open_session();
        relay.authenticate(&mut visitor, None, None).await;
        for content in ["primeira", "segunda", "terceira"] {
            let frame = format!(r#"{{"type":"message","content":"{}"}}"#, content);
            relay.handle_text(&mut visitor, &frame).await;
        }

        for rx in [&mut rx_a, &mut rx_b, &mut visitor_rx] {
            let received = drain(rx);
            let contents: Vec<&str> = received.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, vec!["primeira", "segunda", "terceira"]);
            assert!(received.windows(2).all(|w| w[0].id < w[1].id));
            assert!(received.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        }
    }

    #[tokio::test]
    async fn admin_reply_goes_only_to_target() {
        let (relay, store) = relay();

        let (mut admin_a, mut rx_a) = relay.open_session();
        sign_in(&relay, &mut admin_a, 1).await;
        let (mut admin_b, mut rx_b) = relay.open_session();
        sign_in(&relay, &mut admin_b, 2).await;
        let (mut user, mut user_rx) = relay.open_session();
        sign_in(&relay, &mut user, 7).await;

        let record = relay
            .dispatch(&admin_a, Some(7), "hi")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.user_id, Some(7));
        assert!(record.is_admin);

        assert_eq!(drain(&mut user_rx), vec![record.clone()]);
        assert_eq!(drain(&mut rx_a), vec![record]);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reply_to_offline_participant_is_stored_and_echoed() {
        let (relay, store) = relay();
        let (mut admin, mut admin_rx) = relay.open_session();
        sign_in(&relay, &mut admin, 1).await;

        let record = relay.dispatch(&admin, Some(42), "later").await.unwrap();
        assert!(record.is_some());
        assert_eq!(drain(&mut admin_rx).len(), 1);
        assert_eq!(store.list_messages(Some(42)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn visitor_keys_resume_below_stored_history() {
        let store = Arc::new(CountingStore::default());
        store.persist(Some(-4), "old reply", true).unwrap();
        let relay = Relay::new(store, Arc::new(Accounts(HashMap::new())), SECRET.to_string());

        let (mut visitor, _rx) = relay.open_session();
        relay.authenticate(&mut visitor, None, None).await;
        assert_eq!(visitor.role(), Role::Visitor(-5));
    }

    #[tokio::test]
    async fn empty_and_unauthenticated_messages_are_dropped() {
        let (relay, store) = relay();
        let (mut admin, mut admin_rx) = relay.open_session();
        sign_in(&relay, &mut admin, 1).await;

        let (mut visitor, mut visitor_rx) = relay.open_session();
        relay.authenticate(&mut visitor, None, None).await;
        for content in ["", "   "] {
            assert!(relay.dispatch(&visitor, None, content).await.unwrap().is_none());
        }

        let (pending, mut pending_rx) = relay.open_session();
        assert!(relay.dispatch(&pending, None, "hello").await.unwrap().is_none());

        // Admin without a recipient would store an orphaned admin message
        assert!(relay.dispatch(&admin, None, "to whom?").await.unwrap().is_none());

        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut admin_rx).is_empty());
        assert!(drain(&mut visitor_rx).is_empty());
        assert!(drain(&mut pending_rx).is_empty());
    }

    #[tokio::test]
    async fn storage_failure_keeps_channel_registered() {
        let (relay, store) = relay();
        store.fail.store(true, Ordering::SeqCst);

        let (mut admin, mut admin_rx) = relay.open_session();
        sign_in(&relay, &mut admin, 1).await;
        let (mut user, mut user_rx) = relay.open_session();
        sign_in(&relay, &mut user, 7).await;

        let result = relay.dispatch(&user, None, "lost").await;
        assert!(matches!(result, Err(RelayError::Storage(_))));

        // The boundary swallows the same failure
        relay
            .handle_text(&mut user, r#"{"type":"message","content":"lost"}"#)
            .await;

        assert!(drain(&mut admin_rx).is_empty());
        assert!(drain(&mut user_rx).is_empty());
        assert_eq!(relay.registry().participant_conn(7).await, Some(user.conn_id()));
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let (relay, store) = relay();
        let (mut session, _rx) = relay.open_session();

        relay.handle_text(&mut session, "not json").await;
        relay.handle_text(&mut session, r#"{"type":"typing"}"#).await;

        assert_eq!(session.role(), Role::Pending);
        assert!(!session.is_closed());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_respects_newer_channels() {
        let (relay, _) = relay();

        let (mut old, _old_rx) = relay.open_session();
        sign_in(&relay, &mut old, 7).await;
        let (mut new, _new_rx) = relay.open_session();
        sign_in(&relay, &mut new, 7).await;

        relay.close(&mut old).await;
        relay.close(&mut old).await;
        assert_eq!(relay.registry().participant_conn(7).await, Some(new.conn_id()));

        let (mut pending, _pending_rx) = relay.open_session();
        relay.close(&mut pending).await;
        assert_eq!(relay.registry().participant_count().await, 1);

        let (mut admin, _admin_rx) = relay.open_session();
        sign_in(&relay, &mut admin, 1).await;
        relay.close(&mut admin).await;
        assert_eq!(relay.registry().admin_count().await, 0);

        // A closed session cannot be re-registered
        sign_in(&relay, &mut pending, 7).await;
        assert_eq!(pending.role(), Role::Pending);
        assert_eq!(relay.registry().participant_conn(7).await, Some(new.conn_id()));
    }
}
