//! Peer state and media-session allocation
//!
//! A peer is one server-side endpoint of a single client: its identity, the
//! terminated WebRTC session, the outbound `[video, audio]` track pair that
//! every other participant subscribes to, and the control-channel handle
//! used to signal the client.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::channel::SignalSink;
use crate::error::Result;
use crate::message::{self, MessageEvent};
use crate::types::PeerId;

/// Index of the video track in [`Peer::tracks`].
pub const VIDEO_TRACK: usize = 0;
/// Index of the audio track in [`Peer::tracks`].
pub const AUDIO_TRACK: usize = 1;

pub struct Peer {
    pub id: PeerId,
    /// Advisory only; never consulted by forwarding logic.
    pub display_name: Option<String>,
    /// The peer's terminated media session.
    pub session: Arc<RTCPeerConnection>,
    /// Outbound `[video, audio]` pair. Exists for the peer's whole lifetime
    /// and is never reassigned; only the payload stream flowing through it
    /// changes as the media pump writes into it.
    pub tracks: [Arc<TrackLocalStaticRTP>; 2],
    channel: Arc<dyn SignalSink>,
    /// Serializes offer/answer exchanges against this peer.
    pub(crate) signal_lock: Mutex<()>,
    done: CancellationToken,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl Peer {
    pub(crate) fn new(
        id: PeerId,
        display_name: Option<String>,
        session: Arc<RTCPeerConnection>,
        channel: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            id,
            display_name,
            session,
            tracks: new_track_pair(id),
            channel,
            signal_lock: Mutex::new(()),
            done: CancellationToken::new(),
        }
    }

    /// Whether an identity has been assigned. Identity assignment happens
    /// at construction, so this holds for any peer a caller can observe;
    /// retained as part of the peer's observable surface.
    #[must_use]
    pub fn is_created(&self) -> bool {
        !self.id.as_uuid().is_nil()
    }

    /// Whether the media session and control channel are both in place.
    /// Both are owned for the peer's whole lifetime, so a created peer is
    /// also connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.is_created()
    }

    /// Frame and send one envelope to this peer's client.
    pub async fn signal<T: Serialize + ?Sized>(&self, event: MessageEvent, data: &T) -> Result<()> {
        self.channel.send(message::encode_signal(event, data)?).await
    }

    pub(crate) fn channel(&self) -> Arc<dyn SignalSink> {
        Arc::clone(&self.channel)
    }

    /// The done signal scoping this peer's background tasks. Fired exactly
    /// once, by the remover.
    pub(crate) fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub(crate) fn cancel_done(&self) {
        self.done.cancel();
    }
}

/// Allocate a media session configured with the given ICE servers.
pub(crate) async fn new_session(ice_servers: &[String]) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: ice_servers.to_vec(),
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

/// The outbound `[video (VP8), audio (Opus)]` pair for a fresh peer, both
/// on the `stream-<peer-identity>` stream.
fn new_track_pair(id: PeerId) -> [Arc<TrackLocalStaticRTP>; 2] {
    let stream_id = format!("stream-{id}");
    let video = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        stream_id.clone(),
    ));
    let audio = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        "audio".to_owned(),
        stream_id,
    ));
    [video, audio]
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::track::track_local::TrackLocal;

    #[test]
    fn test_track_pair_kinds_and_stream() {
        let id = PeerId::generate();
        let tracks = new_track_pair(id);
        assert_eq!(tracks[VIDEO_TRACK].kind(), RTPCodecType::Video);
        assert_eq!(tracks[AUDIO_TRACK].kind(), RTPCodecType::Audio);
        assert_eq!(tracks[VIDEO_TRACK].stream_id(), format!("stream-{id}"));
        assert_eq!(tracks[AUDIO_TRACK].stream_id(), format!("stream-{id}"));
    }

    #[tokio::test]
    async fn test_new_session() {
        let session = new_session(&["stun:stun.l.google.com:19302".to_string()])
            .await
            .unwrap();
        session.close().await.unwrap();
    }
}
