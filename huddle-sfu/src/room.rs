//! Room membership and forwarding topology
//!
//! A room owns its peers' lifetimes and every cross-peer operation: the
//! catch-up step that makes existing participants visible to a newcomer,
//! the renegotiation pass when a remote track arrives, broadcasting, and
//! teardown. Membership lives behind a read-write lock; the lock is never
//! held across a control-channel write.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use serde_json::value::to_raw_value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::channel::SignalSink;
use crate::error::{Error, Result};
use crate::message::{CandidatePayload, MessageEvent, SignalMessage};
use crate::peer::{self, Peer};
use crate::pump;
use crate::types::{PeerId, RoomId};

pub struct Room {
    pub name: RoomId,
    capacity: usize,
    ice_servers: Vec<String>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(name: RoomId, capacity: usize, ice_servers: Vec<String>) -> Self {
        Self {
            name,
            capacity,
            ice_servers,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a new peer: enforce capacity, assign a fresh identity,
    /// allocate its media session and outbound track pair, and insert it.
    ///
    /// The membership write lock is held across session allocation so the
    /// capacity bound holds even under concurrent joins.
    pub async fn initialize_peer(
        self: &Arc<Self>,
        display_name: Option<String>,
        channel: Arc<dyn SignalSink>,
    ) -> Result<Arc<Peer>> {
        let mut peers = self.peers.write().await;

        if peers.len() >= self.capacity {
            warn!(room = %self.name, capacity = self.capacity, "room is full");
            return Err(Error::RoomFull);
        }

        let id = PeerId::generate();
        if peers.contains_key(&id) {
            return Err(Error::PeerExists);
        }

        let session = peer::new_session(&self.ice_servers).await?;
        let peer = Arc::new(Peer::new(id, display_name, session, channel));
        self.wire_session(&peer);
        peers.insert(id, Arc::clone(&peer));

        info!(room = %self.name, peer = %id, count = peers.len(), "peer joined room");
        Ok(peer)
    }

    /// Respond to a client's offer.
    ///
    /// Before answering, every other peer's outbound tracks are added to
    /// this peer's session (the catch-up step), so a single offer/answer
    /// round trip makes all existing participants visible to the newcomer.
    /// This path never renegotiates the others; their sessions pick up the
    /// newcomer's media when its tracks actually arrive.
    pub async fn handle_offer(&self, peer: &Arc<Peer>, sdp: String) -> Result<()> {
        let _exchange = peer.signal_lock.lock().await;

        let others = self.peers_snapshot(Some(peer.id)).await;
        for other in &others {
            for track in &other.tracks {
                if let Err(e) = peer
                    .session
                    .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                {
                    error!(
                        room = %self.name,
                        from = %other.id,
                        to = %peer.id,
                        error = %e,
                        "failed to add existing track"
                    );
                }
            }
        }

        let offer = RTCSessionDescription::offer(sdp)?;
        peer.session.set_remote_description(offer).await?;

        let answer = peer.session.create_answer(None).await?;
        let answer_sdp = answer.sdp.clone();
        peer.session.set_local_description(answer).await?;

        peer.signal(MessageEvent::Answer, &answer_sdp).await
    }

    /// Accept a renegotiation answer. An answer arriving in the `stable`
    /// signaling state is unexpected but harmless; it is logged and
    /// swallowed.
    pub async fn handle_answer(&self, peer: &Arc<Peer>, sdp: String) -> Result<()> {
        let _exchange = peer.signal_lock.lock().await;

        if peer.session.signaling_state() == RTCSignalingState::Stable {
            warn!(
                room = %self.name,
                peer = %peer.id,
                "answer received in stable signaling state, ignoring"
            );
            return Ok(());
        }

        let answer = RTCSessionDescription::answer(sdp)?;
        peer.session.set_remote_description(answer).await?;
        Ok(())
    }

    /// Feed a trickled ICE candidate into the peer's media session.
    pub async fn handle_candidate(&self, peer: &Arc<Peer>, candidate: CandidatePayload) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_m_line_index),
            username_fragment: None,
        };
        peer.session.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Emit an envelope to every peer, optionally excluding one.
    /// Best-effort per peer; write failures are logged, never fatal.
    pub async fn broadcast<T: Serialize + ?Sized>(
        &self,
        event: MessageEvent,
        data: &T,
        exclude: Option<PeerId>,
    ) {
        let targets = self.peers_snapshot(exclude).await;
        for peer in targets {
            if let Err(e) = peer.signal(event, data).await {
                warn!(room = %self.name, peer = %peer.id, error = %e, "broadcast write failed");
            }
        }
    }

    /// Tear down a peer: fire its done signal (exactly once, guarded by
    /// the membership write lock), delete it from the mapping, close its
    /// media session, then tell the remaining peers who left. Idempotent
    /// per identity.
    ///
    /// The session is closed only after the peer has left the map and the
    /// lock is released: closing fires the `Closed` state callback, which
    /// re-enters this method and must find the peer already gone.
    pub async fn remove_peer(&self, peer_id: PeerId) {
        let removed = {
            let mut peers = self.peers.write().await;
            if let Some(peer) = peers.get(&peer_id) {
                peer.cancel_done();
            }
            peers.remove(&peer_id)
        };

        let Some(peer) = removed else {
            warn!(room = %self.name, peer = %peer_id, "attempted to remove non-existent peer");
            return;
        };

        if let Err(e) = peer.session.close().await {
            error!(room = %self.name, peer = %peer_id, error = %e, "failed to close media session");
        }
        info!(room = %self.name, peer = %peer_id, "peer removed from room");

        self.broadcast(MessageEvent::PeerLeft, &peer_id.to_string(), None)
            .await;
    }

    pub async fn get_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Clone the current membership out from under the read lock, so no
    /// caller ever writes to a channel while holding it.
    async fn peers_snapshot(&self, exclude: Option<PeerId>) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| Some(p.id) != exclude)
            .cloned()
            .collect()
    }

    /// Wire the session callbacks for a freshly admitted peer.
    ///
    /// Callbacks capture `Weak<Room>` plus the peer's identity and re-look
    /// the peer up on fire, so a session never keeps its own room or peer
    /// alive.
    fn wire_session(self: &Arc<Self>, peer: &Arc<Peer>) {
        let peer_id = peer.id;

        let room = Arc::downgrade(self);
        let channel = peer.channel();
        peer.session
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let room = Weak::clone(&room);
                let channel = Arc::clone(&channel);
                Box::pin(async move {
                    info!(peer = %peer_id, state = %state, "peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Closed
                            | RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Disconnected
                    ) {
                        if let Some(room) = room.upgrade() {
                            room.remove_peer(peer_id).await;
                        }
                        channel.close().await;
                    }
                })
            }));

        let channel = peer.channel();
        peer.session
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let channel = Arc::clone(&channel);
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };

                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            error!(peer = %peer_id, error = %e, "failed to encode ICE candidate");
                            return;
                        }
                    };
                    let payload = CandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid.unwrap_or_default(),
                        sdp_m_line_index: init.sdp_mline_index.unwrap_or_default(),
                    };

                    let text = to_raw_value(&payload)
                        .map_err(Error::from)
                        .and_then(|raw| SignalMessage::from_raw(MessageEvent::Candidate, raw).encode());
                    match text {
                        Ok(text) => {
                            if let Err(e) = channel.send(text).await {
                                error!(peer = %peer_id, error = %e, "failed to send ICE candidate");
                            }
                        }
                        Err(e) => error!(peer = %peer_id, error = %e, "failed to encode ICE candidate"),
                    }
                })
            }));

        let room = Arc::downgrade(self);
        peer.session
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let room = Weak::clone(&room);
                Box::pin(async move {
                    let Some(room) = room.upgrade() else { return };
                    let Some(peer) = room.get_peer(peer_id).await else {
                        return;
                    };
                    info!(
                        room = %room.name,
                        peer = %peer_id,
                        kind = %track.kind(),
                        ssrc = track.ssrc(),
                        "received remote track"
                    );
                    room.forward_track(&peer, &track).await;
                    pump::spawn(peer, track);
                })
            }));
    }

    /// A remote track arrived on `publisher`: subscribe every other peer to
    /// the publisher's same-kind outbound track and renegotiate each of
    /// them, one complete sequence at a time. A failure for one peer never
    /// stops the rest.
    async fn forward_track(&self, publisher: &Arc<Peer>, remote: &Arc<TrackRemote>) {
        let kind = remote.kind();
        let Some(index) = pump::track_index(kind) else {
            warn!(room = %self.name, peer = %publisher.id, "remote track of unknown kind, not forwarding");
            return;
        };
        let local = Arc::clone(&publisher.tracks[index]);

        let subscribers = self.peers_snapshot(Some(publisher.id)).await;
        for other in subscribers {
            info!(
                room = %self.name,
                from = %publisher.id,
                to = %other.id,
                "forwarding track to peer"
            );
            if let Err(e) = self.renegotiate(&other, &local).await {
                error!(room = %self.name, peer = %other.id, error = %e, "renegotiation failed");
                continue;
            }

            if kind == RTPCodecType::Video {
                // Solicit a keyframe right away so the new subscriber does
                // not wait out a full keyframe interval for its first frame.
                let session = Arc::clone(&publisher.session);
                let ssrc = remote.ssrc();
                tokio::spawn(async move {
                    let pli = PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc: ssrc,
                    };
                    if let Err(e) = session.write_rtcp(&[Box::new(pli)]).await {
                        error!(error = %e, "failed to send immediate keyframe request");
                    }
                });
            }
        }
    }

    /// Add one subscribed track to `peer` and push a fresh offer to it.
    async fn renegotiate(&self, peer: &Arc<Peer>, track: &Arc<TrackLocalStaticRTP>) -> Result<()> {
        let _exchange = peer.signal_lock.lock().await;

        peer.session
            .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let offer = peer.session.create_offer(None).await?;
        let offer_sdp = offer.sdp.clone();
        peer.session.set_local_description(offer).await?;

        peer.signal(MessageEvent::Offer, &offer_sdp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingSink;

    fn test_room(capacity: usize) -> Arc<Room> {
        Arc::new(Room::new(
            RoomId::from("test-room"),
            capacity,
            vec!["stun:stun.l.google.com:19302".to_string()],
        ))
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let room = test_room(2);

        room.initialize_peer(None, Arc::new(RecordingSink::default()))
            .await
            .unwrap();
        room.initialize_peer(None, Arc::new(RecordingSink::default()))
            .await
            .unwrap();

        let err = room
            .initialize_peer(None, Arc::new(RecordingSink::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RoomFull));
        assert_eq!(room.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_initialized_peer_has_track_pair() {
        let room = test_room(4);
        let peer = room
            .initialize_peer(Some("alice".to_string()), Arc::new(RecordingSink::default()))
            .await
            .unwrap();

        assert_eq!(peer.tracks[peer::VIDEO_TRACK].kind(), RTPCodecType::Video);
        assert_eq!(peer.tracks[peer::AUDIO_TRACK].kind(), RTPCodecType::Audio);
        assert_eq!(peer.display_name.as_deref(), Some("alice"));
        assert!(peer.is_created());
        assert!(peer.is_connected());
        assert!(room.get_peer(peer.id).await.is_some());
    }

    #[tokio::test]
    async fn test_remove_peer_is_idempotent() {
        let room = test_room(4);
        let peer = room
            .initialize_peer(None, Arc::new(RecordingSink::default()))
            .await
            .unwrap();

        room.remove_peer(peer.id).await;
        assert!(room.is_empty().await);

        // Second removal is a logged no-op.
        room.remove_peer(peer.id).await;
        assert!(room.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_broadcasts_departed_identity() {
        let room = test_room(4);
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());

        let a = room.initialize_peer(None, Arc::clone(&sink_a) as Arc<dyn SignalSink>).await.unwrap();
        let _b = room.initialize_peer(None, Arc::clone(&sink_b) as Arc<dyn SignalSink>).await.unwrap();

        room.remove_peer(a.id).await;

        let sent = sink_b.sent.lock().unwrap();
        let last = sent.last().expect("survivor should be notified");
        let msg = SignalMessage::decode(last).unwrap();
        assert_eq!(msg.event, MessageEvent::PeerLeft);
        assert_eq!(msg.decode_data::<String>().unwrap(), a.id.to_string());

        // The departed peer hears nothing about its own removal.
        assert!(sink_a.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_requested_peer() {
        let room = test_room(4);
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());

        let a = room.initialize_peer(None, Arc::clone(&sink_a) as Arc<dyn SignalSink>).await.unwrap();
        let _b = room.initialize_peer(None, Arc::clone(&sink_b) as Arc<dyn SignalSink>).await.unwrap();

        room.broadcast(MessageEvent::PeerLeft, "someone", Some(a.id))
            .await;

        assert!(sink_a.sent.lock().unwrap().is_empty());
        assert_eq!(sink_b.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_in_stable_state_is_swallowed() {
        let room = test_room(4);
        let peer = room
            .initialize_peer(None, Arc::new(RecordingSink::default()))
            .await
            .unwrap();

        // A fresh session is in stable state; the answer must be ignored
        // without touching the session description.
        room.handle_answer(&peer, "bogus".to_string()).await.unwrap();
    }
}
