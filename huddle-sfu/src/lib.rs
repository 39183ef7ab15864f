//! huddle SFU core
//!
//! A Selective Forwarding Unit for small-group video conferencing. Each
//! client's WebRTC endpoint terminates here; received audio/video RTP is
//! re-forwarded to every other participant in the same room, with
//! renegotiation coordinated whenever the set of forwarded streams changes.
//!
//! ## Architecture
//!
//! - **`RoomManager`**: process-wide registry of live rooms, created on
//!   first join and deleted on last leave
//! - **`Room`**: bounded peer set owning the forwarding topology and all
//!   cross-peer operations
//! - **`Peer`**: one client's identity, media session, outbound
//!   `[video, audio]` track pair, and control-channel handle
//! - **`SignalMessage`**: the `{event, data}` envelope spoken on the
//!   control channel
//!
//! The media pump (one forwarder + one keyframe ticker per inbound remote
//! track) is internal; it starts when a remote track arrives and stops on
//! the owning peer's done signal.

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod message;
pub mod peer;
mod pump;
pub mod room;
pub mod types;

pub use channel::SignalSink;
pub use config::{Config, LoggingConfig, ServerConfig, SfuConfig};
pub use error::{Error, Result};
pub use manager::RoomManager;
pub use message::{CandidatePayload, JoinPayload, MessageEvent, SignalMessage};
pub use peer::Peer;
pub use room::Room;
pub use types::{PeerId, RoomId};
