//! Websocket transport tests against a loopback relay.
//!
//! The relay below keeps one replica for a single room: it answers
//! `SyncStep1` from that replica, applies and fans out updates, and fans out
//! presence traffic unchanged. It never announces departures itself.

use futures_util::{SinkExt, StreamExt};
use scribe_collab::config::TransportConfig;
use scribe_collab::presence::{ParticipantId, ParticipantPresence, PresenceState, UserIdentity};
use scribe_collab::protocol::{ConnectionId, MessageType, SyncMessage};
use scribe_collab::replica::Replica;
use scribe_collab::retry::{poll_until, BoundedRetry, RetryOutcome};
use scribe_collab::room::RoomId;
use scribe_collab::session::{SessionOptions, SessionState, SyncSession};
use scribe_collab::surface::BufferSurface;
use scribe_collab::transport::{Transport, TransportConnector, WebSocketConnector, WsTransport};
use scribe_collab::CollabConfig;
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

/// Start a relay on a free port. Returns its base url and its replica.
async fn start_relay() -> (String, Arc<Replica>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let replica = Arc::new(Replica::new());
    let (fanout, _) = broadcast::channel::<Arc<SyncMessage>>(256);

    let room_replica = replica.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            tokio::spawn(serve(ws, room_replica.clone(), fanout.clone()));
        }
    });
    (format!("ws://{addr}"), replica)
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    replica: Arc<Replica>,
    fanout: broadcast::Sender<Arc<SyncMessage>>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut inbound = fanout.subscribe();
    let mut peer: Option<ConnectionId> = None;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let Ok(msg) = SyncMessage::decode(&data) else {
                        continue;
                    };
                    peer = Some(msg.connection_id);
                    match msg.msg_type {
                        MessageType::SyncStep1 => {
                            let diff = replica.encode_diff(&msg.payload).unwrap();
                            let reply = SyncMessage::sync_step2(0, &msg.room, diff);
                            if sink.send(Message::Binary(reply.encode().unwrap().into())).await.is_err() {
                                break;
                            }
                        }
                        MessageType::Update => {
                            replica.apply_remote_update(&msg.payload).unwrap();
                            let _ = fanout.send(Arc::new(msg));
                        }
                        MessageType::Ping | MessageType::Pong => {}
                        _ => {
                            let _ = fanout.send(Arc::new(msg));
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Ok(msg) = inbound.recv() => {
                if Some(msg.connection_id) != peer {
                    let bytes = msg.encode().unwrap();
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn room() -> RoomId {
    RoomId::for_document("document-", "ws")
}

fn transport(url: &str, replica: Arc<Replica>) -> Arc<dyn Transport> {
    WebSocketConnector
        .create(url, &room(), replica, &TransportConfig::default())
        .unwrap()
}

fn presence(id: &str) -> PresenceState {
    PresenceState::with_participant(ParticipantPresence {
        id: Some(ParticipantId::Text(id.into())),
        display_name: Some(id.to_uppercase()),
        color: None,
    })
}

/// Up to two seconds of polling.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let retry = BoundedRetry::new(100, Duration::from_millis(20));
    matches!(
        poll_until(retry, || check().then_some(())).await,
        RetryOutcome::Ready(())
    )
}

#[tokio::test]
async fn test_transports_sync_over_websocket() {
    let (url, relay) = start_relay().await;
    let (ra, rb) = (Arc::new(Replica::new()), Arc::new(Replica::new()));
    let a = transport(&url, ra.clone());
    let b = transport(&url, rb.clone());
    a.connect().unwrap();
    b.connect().unwrap();
    assert!(eventually(|| a.is_synced() && b.is_synced()).await);

    let update = ra.push_block(&json!({"type": "heading"})).unwrap();
    a.send_update(&update).unwrap();

    assert!(eventually(|| rb.block_count().unwrap() == 1).await);
    assert_eq!(relay.block_count().unwrap(), 1);

    a.destroy().unwrap();
    b.destroy().unwrap();
}

#[tokio::test]
async fn test_offline_updates_are_replayed_on_connect() {
    let (url, relay) = start_relay().await;
    let replica = Arc::new(Replica::new());
    let t = WsTransport::new(&url, &room(), replica.clone(), TransportConfig::default()).unwrap();

    for kind in ["heading", "paragraph"] {
        let update = replica.push_block(&json!({"type": kind})).unwrap();
        t.send_update(&update).unwrap();
    }
    assert_eq!(t.queued_updates(), 2);

    t.connect().unwrap();
    assert!(eventually(|| relay.block_count().unwrap() == 2).await);
    assert_eq!(t.queued_updates(), 0);
}

#[tokio::test]
async fn test_presence_over_websocket() {
    let (url, _relay) = start_relay().await;
    let a = transport(&url, Arc::new(Replica::new()));
    let b = transport(&url, Arc::new(Replica::new()));
    a.set_local_presence(Some(presence("ada")));
    b.set_local_presence(Some(presence("grace")));
    a.connect().unwrap();
    assert!(eventually(|| a.is_synced()).await);
    b.connect().unwrap();

    assert!(eventually(|| a.presence_states().len() == 2 && b.presence_states().len() == 2).await);

    b.destroy().unwrap();
    assert!(eventually(|| a.presence_states().len() == 1).await);
    a.destroy().unwrap();
}

#[tokio::test]
async fn test_peer_dropped_without_goodbye_expires() {
    let (url, _relay) = start_relay().await;
    let config = TransportConfig {
        presence_timeout: Duration::from_millis(600),
        ..TransportConfig::default()
    };
    let a = WebSocketConnector
        .create(&url, &room(), Arc::new(Replica::new()), &config)
        .unwrap();
    a.set_local_presence(Some(presence("ada")));
    a.connect().unwrap();
    assert!(eventually(|| a.is_synced()).await);

    // A bare client announces itself, then its socket dies.
    let (mut ghost, _) = tokio_tungstenite::connect_async(format!("{url}/{}", room()))
        .await
        .unwrap();
    let hello = SyncMessage::presence(4242, room().as_str(), &presence("ghost")).unwrap();
    ghost.send(Message::Binary(hello.encode().unwrap().into())).await.unwrap();
    assert!(eventually(|| a.presence_states().contains_key(&4242)).await);
    drop(ghost);

    assert!(eventually(|| !a.presence_states().contains_key(&4242)).await);
    assert_eq!(
        a.presence_states().keys().copied().collect::<Vec<_>>(),
        vec![a.connection_id()]
    );
    a.destroy().unwrap();
}

#[tokio::test]
async fn test_session_over_websocket_takes_initial_content() {
    let (url, relay) = start_relay().await;
    let sessions = SyncSession::new(CollabConfig::default().with_endpoint(url));
    let handle = sessions
        .open(
            Some("42"),
            SessionOptions::new()
                .initial_content(json!([{"type": "heading"}, {"type": "paragraph"}, {"type": "paragraph"}]))
                .identity(UserIdentity::new(ParticipantId::Number(7), "Ada")),
        )
        .expect("session should open");
    assert_eq!(handle.room().as_str(), "document-42");

    let surface = Arc::new(BufferSurface::new());
    handle.attach_editor(surface.clone());
    timeout(Duration::from_secs(10), handle.wait_for(|s| *s == SessionState::Steady))
        .await
        .expect("session never reached steady state");

    assert_eq!(surface.document().block_count(), 3);
    assert!(eventually(|| relay.block_count().unwrap() == 3).await);

    handle.destroy();
    assert_eq!(handle.state(), SessionState::Destroyed);
}
