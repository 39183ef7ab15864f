//! Control-channel message codec
//!
//! Every message on the control channel is a JSON envelope
//! `{ "event": <string>, "data": <value> }`. The payload is kept as raw
//! JSON and decoded against the event once the dispatcher knows what to
//! expect.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::Result;

/// The closed set of envelope events.
///
/// An event string outside this set maps to [`MessageEvent::Unknown`]
/// rather than failing the whole envelope; the handler logs and skips those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    Join,
    Offer,
    Answer,
    Candidate,
    Leave,
    PeerId,
    PeerLeft,
    RoomFull,
    Unknown,
}

impl MessageEvent {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Leave => "leave",
            Self::PeerId => "peer-id",
            Self::PeerLeft => "peer-left",
            Self::RoomFull => "room-full",
            Self::Unknown => "unknown",
        }
    }
}

impl From<&str> for MessageEvent {
    fn from(s: &str) -> Self {
        match s {
            "join" => Self::Join,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "candidate" => Self::Candidate,
            "leave" => Self::Leave,
            "peer-id" => Self::PeerId,
            "peer-left" => Self::PeerLeft,
            "room-full" => Self::RoomFull,
            _ => Self::Unknown,
        }
    }
}

impl Serialize for MessageEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageEvent {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Envelope framing a typed event with a deferred payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalMessage {
    pub event: MessageEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl SignalMessage {
    /// Frame an envelope around a serializable payload.
    pub fn new<T: Serialize + ?Sized>(event: MessageEvent, data: &T) -> Result<Self> {
        Ok(Self {
            event,
            data: Some(serde_json::value::to_raw_value(data)?),
        })
    }

    /// Frame an envelope around an already-encoded payload.
    #[must_use]
    pub fn from_raw(event: MessageEvent, data: Box<RawValue>) -> Self {
        Self {
            event,
            data: Some(data),
        }
    }

    /// Parse an envelope off the wire. Fails with `MalformedMessage`.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode the deferred payload against the expected shape for the event.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self
            .data
            .as_deref()
            .map_or("null", RawValue::get);
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Encode a `{event, data}` frame in one step.
pub fn encode_signal<T: Serialize + ?Sized>(event: MessageEvent, data: &T) -> Result<String> {
    SignalMessage::new(event, data)?.encode()
}

/// `join` payload. The client-supplied `peer_id` is advisory; the server
/// assigns the real identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: String,
    #[serde(default)]
    pub peer_id: String,
}

/// Trickled ICE candidate payload, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_m_line_index: u16,
}
