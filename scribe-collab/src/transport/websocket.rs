//! Websocket transport.
//!
//! One background task per transport owns the socket:
//!
//! ```text
//! loop {
//!     connect  ──fail──► sleep(backoff) ──► retry
//!        │
//!        ▼
//!     attach (handshake) ──► select { outbound | inbound | heartbeat | shutdown }
//!        │
//!        ▼  link lost
//!     detach ──► sleep(backoff) ──► retry
//! }
//! ```
//!
//! Backoff is `min(base · 2^attempt, max)` and resets after every
//! successful connect.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::peer::PeerState;
use super::{ConnectionStatus, EventKind, Transport, TransportConnector, TransportListener};
use crate::config::TransportConfig;
use crate::error::{CollabError, CollabResult};
use crate::listeners::ListenerId;
use crate::presence::PresenceState;
use crate::protocol::{ConnectionId, SyncMessage};
use crate::replica::Replica;
use crate::room::RoomId;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Delay before reconnect attempt number `attempt` (zero-based).
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Creates [`WsTransport`]s; the session's default connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl TransportConnector for WebSocketConnector {
    fn create(
        &self,
        endpoint: &str,
        room: &RoomId,
        replica: Arc<Replica>,
        config: &TransportConfig,
    ) -> CollabResult<Arc<dyn Transport>> {
        Ok(Arc::new(WsTransport::new(endpoint, room, replica, config.clone())?))
    }
}

pub struct WsTransport {
    peer: Arc<PeerState>,
    url: String,
    config: TransportConfig,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl WsTransport {
    /// Validate the endpoint; nothing is connected until
    /// [`Transport::connect`].
    pub fn new(
        endpoint: &str,
        room: &RoomId,
        replica: Arc<Replica>,
        config: TransportConfig,
    ) -> CollabResult<Self> {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), room);
        let parsed = Url::parse(&url).map_err(|e| CollabError::InvalidEndpoint(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(CollabError::InvalidEndpoint(format!(
                "{url}: expected ws or wss, got {}",
                parsed.scheme()
            )));
        }

        Ok(Self {
            peer: Arc::new(PeerState::new(
                room.as_str(),
                replica,
                config.offline_queue_capacity,
            )),
            url,
            config,
            shutdown: watch::channel(false).0,
            started: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn queued_updates(&self) -> usize {
        self.peer.queued_updates()
    }
}

enum LinkExit {
    Lost,
    Shutdown,
}

async fn send_frame(sink: &mut WsSink, msg: &SyncMessage) -> CollabResult<()> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(|_| CollabError::ConnectionClosed)
}

/// Pump one established connection until it drops or we shut down.
async fn drive_link(
    peer: &PeerState,
    ws: WsStream,
    config: &TransportConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> LinkExit {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<SyncMessage>();
    peer.attach(tx);

    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let sweep_every = config.presence_sweep_interval();
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                // Flush the goodbye queued by destroy, then close politely.
                while let Ok(msg) = outbound.try_recv() {
                    let _ = send_frame(&mut sink, &msg).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                return LinkExit::Shutdown;
            }
            Some(msg) = outbound.recv() => {
                if let Err(e) = send_frame(&mut sink, &msg).await {
                    log::debug!("[{}] Write failed: {e}", peer.room());
                    return LinkExit::Lost;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                    Ok(msg) => peer.handle(msg),
                    Err(e) => log::debug!("[{}] Undecodable frame: {e}", peer.room()),
                },
                Some(Ok(Message::Close(_))) | None => return LinkExit::Lost,
                Some(Err(e)) => {
                    log::debug!("[{}] Read failed: {e}", peer.room());
                    return LinkExit::Lost;
                }
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => {
                let ping = SyncMessage::ping(peer.connection_id(), peer.room());
                if send_frame(&mut sink, &ping).await.is_err() {
                    return LinkExit::Lost;
                }
            }
            _ = sweep.tick() => {
                peer.expire_presence(config.presence_timeout);
            }
        }
    }
}

async fn run_connection(
    peer: Arc<PeerState>,
    url: String,
    config: TransportConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        peer.set_status(ConnectionStatus::Connecting);

        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((ws, _)) => {
                attempt = 0;
                log::info!("[{}] Connected to {url}", peer.room());
                let exit = drive_link(&peer, ws, &config, &mut shutdown).await;
                peer.detach();
                if let LinkExit::Shutdown = exit {
                    break;
                }
                log::info!("[{}] Connection lost, reconnecting", peer.room());
            }
            Err(e) => {
                log::debug!("[{}] Connect to {url} failed: {e}", peer.room());
                peer.set_status(ConnectionStatus::Disconnected);
            }
        }

        let delay = reconnect_delay(attempt, config.reconnect_base, config.reconnect_max);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    peer.set_status(ConnectionStatus::Disconnected);
}

impl Transport for WsTransport {
    fn room(&self) -> &str {
        self.peer.room()
    }

    fn connection_id(&self) -> ConnectionId {
        self.peer.connection_id()
    }

    fn connect(&self) -> CollabResult<()> {
        if self.peer.is_destroyed() {
            return Err(CollabError::TransportDestroyed);
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| CollabError::NoRuntime(e.to_string()))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        runtime.spawn(run_connection(
            self.peer.clone(),
            self.url.clone(),
            self.config.clone(),
            self.shutdown.subscribe(),
        ));
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.peer.status()
    }

    fn is_synced(&self) -> bool {
        self.peer.is_synced()
    }

    fn on(&self, kind: EventKind, listener: TransportListener) -> ListenerId {
        self.peer.on(kind, listener)
    }

    fn off(&self, id: ListenerId) -> CollabResult<()> {
        self.peer.off(id)
    }

    fn set_local_presence(&self, state: Option<PresenceState>) {
        self.peer.set_local_presence(state)
    }

    fn presence_states(&self) -> BTreeMap<ConnectionId, PresenceState> {
        self.peer.presence_states()
    }

    fn send_update(&self, update: &[u8]) -> CollabResult<()> {
        self.peer.send_update(update)
    }

    fn destroy(&self) -> CollabResult<()> {
        if self.peer.destroy() {
            log::debug!("[{}] Closing connection {}", self.peer.room(), self.peer.connection_id());
            self.shutdown.send_replace(true);
        }
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.peer.is_destroyed()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = Transport::destroy(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::for_document("document-", "7")
    }

    #[test]
    fn test_reconnect_delay_doubles_then_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(2500);
        let delays: Vec<u64> = (0..7)
            .map(|n| reconnect_delay(n, base, max).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 2500, 2500]);
        assert_eq!(reconnect_delay(64, base, max), max);
    }

    #[test]
    fn test_url_is_endpoint_plus_room() {
        let t = WsTransport::new(
            "ws://localhost:1234/collab/",
            &room(),
            Arc::new(Replica::new()),
            TransportConfig::default(),
        )
        .unwrap();
        assert_eq!(t.url(), "ws://localhost:1234/collab/document-7");
        assert_eq!(t.room(), "document-7");
        assert_eq!(t.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_rejects_non_websocket_endpoints() {
        for endpoint in ["http://localhost:1234", "not a url"] {
            let result = WebSocketConnector.create(
                endpoint,
                &room(),
                Arc::new(Replica::new()),
                &TransportConfig::default(),
            );
            assert!(matches!(result, Err(CollabError::InvalidEndpoint(_))), "{endpoint}");
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_keeps_retrying_until_destroyed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let replica = Arc::new(Replica::new());
        let t = WsTransport::new(
            &format!("ws://127.0.0.1:{port}"),
            &room(),
            replica.clone(),
            TransportConfig::default(),
        )
        .unwrap();
        t.connect().unwrap();

        let update = replica.push_block(&serde_json::json!({"type": "paragraph"})).unwrap();
        t.send_update(&update).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_ne!(t.status(), ConnectionStatus::Connected);
        assert_eq!(t.queued_updates(), 1);

        t.destroy().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.status(), ConnectionStatus::Disconnected);
        assert!(t.is_destroyed());
    }
}
