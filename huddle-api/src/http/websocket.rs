//! WebSocket signaling handler
//!
//! One `SignalingSession` per connection. The session starts with no peer
//! and no room; a `join` is the only event accepted until both exist. After
//! that the loop services `offer` / `answer` / `candidate` by delegating to
//! the room, until `leave` or disconnect tears the peer down. If the room
//! is empty afterwards it is deleted from the registry.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use huddle_sfu::message::encode_signal;
use huddle_sfu::{
    CandidatePayload, Error, JoinPayload, MessageEvent, Peer, Result, Room, RoomId, SignalMessage,
    SignalSink,
};

use crate::http::AppState;

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let channel: Arc<dyn SignalSink> = Arc::new(WsSignalSink {
        sink: Mutex::new(sink),
    });

    let mut session = SignalingSession {
        state,
        channel,
        peer: None,
        room: None,
    };
    session.run(stream).await;
    session.cleanup().await;
}

/// Write half of the control channel. Every send takes the mutex, which is
/// what serializes outbound traffic toward one client.
struct WsSignalSink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl SignalSink for WsSignalSink {
    async fn send(&self, text: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::ChannelWrite(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

/// Whether the message loop keeps reading after a dispatch.
enum Flow {
    Continue,
    Stop,
}

/// Per-connection signaling state: no peer and no room until a successful
/// `join` establishes both.
struct SignalingSession {
    state: AppState,
    channel: Arc<dyn SignalSink>,
    peer: Option<Arc<Peer>>,
    room: Option<Arc<Room>>,
}

impl SignalingSession {
    async fn run(&mut self, mut stream: SplitStream<WebSocket>) {
        while let Some(next) = stream.next().await {
            let msg = match next {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(error = %e, "control channel read error");
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let envelope = match SignalMessage::decode(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "malformed control message, closing connection");
                    break;
                }
            };

            match self.dispatch(&envelope).await {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
    }

    async fn dispatch(&mut self, envelope: &SignalMessage) -> Flow {
        match envelope.event {
            MessageEvent::Join => self.on_join(envelope).await,
            MessageEvent::Offer => self.on_offer(envelope).await,
            MessageEvent::Answer => self.on_answer(envelope).await,
            MessageEvent::Candidate => self.on_candidate(envelope).await,
            MessageEvent::Leave => self.on_leave().await,
            MessageEvent::PeerId
            | MessageEvent::PeerLeft
            | MessageEvent::RoomFull
            | MessageEvent::Unknown => {
                warn!(event = envelope.event.as_str(), "unexpected event from client, ignoring");
                Flow::Continue
            }
        }
    }

    async fn on_join(&mut self, envelope: &SignalMessage) -> Flow {
        if self.room.is_some() {
            warn!("join received on an already joined connection, ignoring");
            return Flow::Continue;
        }

        let join: JoinPayload = match envelope.decode_data() {
            Ok(join) => join,
            Err(e) => {
                warn!(error = %e, "malformed join payload");
                return Flow::Stop;
            }
        };
        if !join.peer_id.is_empty() {
            // Identities are server-assigned; the client's is advisory.
            debug!(advisory_peer_id = %join.peer_id, "ignoring client-supplied peer id");
        }

        let sfu = &self.state.config.sfu;
        let room = match self
            .state
            .manager
            .get_or_create(&RoomId::from(join.room_id.as_str()), sfu.room_capacity, &sfu.ice_servers)
            .await
        {
            Ok(room) => room,
            Err(e) => {
                warn!(room = %join.room_id, error = %e, "join rejected");
                return Flow::Stop;
            }
        };

        let peer = match room.initialize_peer(None, Arc::clone(&self.channel)).await {
            Ok(peer) => peer,
            Err(e @ (Error::RoomFull | Error::PeerExists)) => {
                warn!(room = %room.name, error = %e, "join refused");
                match encode_signal(MessageEvent::RoomFull, &e.to_string()) {
                    Ok(text) => {
                        let _ = self.channel.send(text).await;
                    }
                    Err(e) => error!(error = %e, "failed to encode room-full notice"),
                }
                return Flow::Stop;
            }
            Err(e) => {
                error!(room = %room.name, error = %e, "failed to initialize peer");
                return Flow::Stop;
            }
        };

        info!(room = %room.name, peer = %peer.id, "peer joined");
        self.peer = Some(Arc::clone(&peer));
        self.room = Some(room);

        if let Err(e) = peer.signal(MessageEvent::PeerId, &peer.id.to_string()).await {
            error!(peer = %peer.id, error = %e, "failed to send assigned peer id");
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn on_offer(&self, envelope: &SignalMessage) -> Flow {
        let Ok((peer, room)) = self.joined("offer") else {
            return Flow::Stop;
        };
        let sdp: String = match envelope.decode_data() {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(error = %e, "malformed offer payload");
                return Flow::Stop;
            }
        };
        self.report(room.handle_offer(peer, sdp).await, peer, "offer handling error")
    }

    async fn on_answer(&self, envelope: &SignalMessage) -> Flow {
        let Ok((peer, room)) = self.joined("answer") else {
            return Flow::Stop;
        };
        let sdp: String = match envelope.decode_data() {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(error = %e, "malformed answer payload");
                return Flow::Stop;
            }
        };
        self.report(room.handle_answer(peer, sdp).await, peer, "answer handling error")
    }

    async fn on_candidate(&self, envelope: &SignalMessage) -> Flow {
        let Ok((peer, room)) = self.joined("candidate") else {
            return Flow::Stop;
        };
        let candidate: CandidatePayload = match envelope.decode_data() {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, "malformed candidate payload");
                return Flow::Stop;
            }
        };
        self.report(
            room.handle_candidate(peer, candidate).await,
            peer,
            "candidate handling error",
        )
    }

    async fn on_leave(&self) -> Flow {
        if let (Some(peer), Some(room)) = (&self.peer, &self.room) {
            info!(room = %room.name, peer = %peer.id, "peer left room");
            room.remove_peer(peer.id).await;
        }
        Flow::Stop
    }

    /// Both handles, or a logged protocol violation: any session-level
    /// event before `join` disconnects the client without notification.
    fn joined(&self, event: &str) -> Result<(&Arc<Peer>, &Arc<Room>)> {
        let violation = match (&self.peer, &self.room) {
            (Some(peer), Some(room)) => return Ok((peer, room)),
            (None, _) => Error::PeerNotCreated,
            (_, None) => Error::RoomNotCreated,
        };
        warn!(event, error = %violation, "received before join, closing connection");
        Err(violation)
    }

    /// Session failures are logged and left to the state-change callbacks;
    /// only a failed write to this client's own channel stops the loop.
    fn report(&self, result: Result<()>, peer: &Arc<Peer>, context: &str) -> Flow {
        match result {
            Ok(()) => Flow::Continue,
            Err(e) if e.is_fatal_for_channel() => {
                error!(peer = %peer.id, error = %e, "{context}");
                Flow::Stop
            }
            Err(e) => {
                error!(peer = %peer.id, error = %e, "{context}");
                Flow::Continue
            }
        }
    }

    /// Runs on every loop exit: EOF, read error, protocol violation, or
    /// explicit leave. Removing an already-removed peer is a no-op.
    async fn cleanup(&mut self) {
        let (Some(peer), Some(room)) = (self.peer.take(), self.room.take()) else {
            return;
        };
        room.remove_peer(peer.id).await;
        if room.is_empty().await {
            self.state.manager.delete(&room.name).await;
        }
    }
}
