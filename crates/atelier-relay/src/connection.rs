use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use atelier_types::events::ServerEvent;

use crate::dispatcher::Relay;

const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Unanswered pings tolerated before the socket is considered dead.
const MAX_UNANSWERED_PINGS: u32 = 2;

/// Liveness bookkeeping for one socket. The reader counts pongs; the writer
/// consults this at every ping tick.
#[derive(Debug, Default)]
struct Liveness {
    pongs_seen: u64,
    /// Pings sent since the last pong arrived
    unanswered: u32,
}

impl Liveness {
    /// Decide whether to send another ping, given the reader's pong count.
    /// Returns false once the allowed number of pings went unanswered.
    fn on_ping(&mut self, pongs: u64) -> bool {
        if pongs != self.pongs_seen {
            self.pongs_seen = pongs;
            self.unanswered = 0;
        }
        if self.unanswered >= MAX_UNANSWERED_PINGS {
            return false;
        }
        self.unanswered += 1;
        true
    }
}

/// Drive one chat socket from open to close.
///
/// Outbound events are drained by a writer task; inbound frames are handled
/// in order on this task, so each channel is processed FIFO.
pub async fn handle_connection(socket: WebSocket, relay: Relay) {
    let (sink, mut stream) = socket.split();
    let (mut session, outbound_rx) = relay.open_session();
    let conn_id = session.conn_id();

    info!("{} connected to chat relay", conn_id);

    let pongs = Arc::new(AtomicU64::new(0));
    let mut writer = tokio::spawn(write_events(conn_id, sink, outbound_rx, pongs.clone()));

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    relay.handle_text(&mut session, text.as_str()).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    pongs.fetch_add(1, Ordering::Relaxed);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    writer.abort();
    relay.close(&mut session).await;
    info!("{} left chat relay as {:?}", conn_id, session.role());
}

/// Serialize relay events onto the socket and keep it pinged. Returns when
/// the socket fails, the session's sender is dropped, or pings go unanswered.
async fn write_events(
    conn_id: Uuid,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerEvent>,
    pongs: Arc<AtomicU64>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    let mut liveness = Liveness::default();

    loop {
        let frame = tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { return };
                match serde_json::to_string(&event) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        warn!("{} dropped unencodable event: {}", conn_id, e);
                        continue;
                    }
                }
            }
            _ = ping.tick() => {
                if !liveness.on_ping(pongs.load(Ordering::Relaxed)) {
                    warn!("{} stopped answering pings, closing", conn_id);
                    return;
                }
                Message::Ping(Vec::<u8>::new().into())
            }
        };

        if sink.send(frame).await.is_err() {
            return;
        }
    }
}
