//! Per-remote-track media pump
//!
//! Each inbound remote track gets two cooperative tasks, both scoped to the
//! owning peer's done signal: a ticker that periodically solicits a fresh
//! keyframe from the sender, and a forwarder that copies RTP into the
//! peer's own outbound track. Because every other participant has already
//! subscribed to that outbound track, a single write fans out at the media
//! session layer; the hot path never touches the membership lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, error, warn};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::MarshalSize;

use crate::peer::{Peer, AUDIO_TRACK, VIDEO_TRACK};

/// RTP read buffer size; a typical Ethernet MTU. Oversized packets fail the
/// read rather than being truncated.
const MTU: usize = 1500;

/// How often to solicit a fresh keyframe from the sender.
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// Map a track kind onto the peer's outbound pair: `[video, audio]`.
pub(crate) fn track_index(kind: RTPCodecType) -> Option<usize> {
    match kind {
        RTPCodecType::Video => Some(VIDEO_TRACK),
        RTPCodecType::Audio => Some(AUDIO_TRACK),
        _ => None,
    }
}

/// Launch the ticker + forwarder pair for one inbound remote track.
pub(crate) fn spawn(peer: Arc<Peer>, remote: Arc<TrackRemote>) {
    let Some(index) = track_index(remote.kind()) else {
        warn!(peer = %peer.id, "remote track of unknown kind, no pump started");
        return;
    };

    spawn_keyframe_ticker(Arc::clone(&peer), Arc::clone(&remote));
    spawn_forwarder(peer, remote, index);
}

fn spawn_keyframe_ticker(peer: Arc<Peer>, remote: Arc<TrackRemote>) {
    let done = peer.done();
    tokio::spawn(async move {
        let mut ticker = interval(KEYFRAME_INTERVAL);
        loop {
            tokio::select! {
                () = done.cancelled() => break,
                _ = ticker.tick() => {
                    let pli = PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc: remote.ssrc(),
                    };
                    if let Err(e) = peer.session.write_rtcp(&[Box::new(pli)]).await {
                        error!(peer = %peer.id, error = %e, "failed to send keyframe request");
                    }
                }
            }
        }
        debug!(peer = %peer.id, ssrc = remote.ssrc(), "keyframe ticker stopped");
    });
}

fn spawn_forwarder(peer: Arc<Peer>, remote: Arc<TrackRemote>, index: usize) {
    let done = peer.done();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MTU];
        loop {
            tokio::select! {
                () = done.cancelled() => break,
                result = remote.read(&mut buf) => {
                    match result {
                        Ok((packet, _attributes)) => {
                            let n = packet.header.marshal_size() + packet.payload.len();
                            if let Err(e) = peer.tracks[index].write(&buf[..n]).await {
                                error!(peer = %peer.id, error = %e, "failed to write to outbound track");
                            }
                        }
                        Err(e) => {
                            debug!(peer = %peer.id, error = %e, "remote track ended");
                            break;
                        }
                    }
                }
            }
        }
        debug!(peer = %peer.id, "rtp forwarder stopped");
    });
}
