use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed control message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("room is not created")]
    RoomNotCreated,

    #[error("peer is not created")]
    PeerNotCreated,

    #[error("room is full")]
    RoomFull,

    #[error("peer already exists in room")]
    PeerExists,

    #[error("media session error: {0}")]
    Session(#[from] webrtc::Error),

    #[error("control channel write failed: {0}")]
    ChannelWrite(String),
}

impl Error {
    /// Errors that must terminate the owning control channel, as opposed to
    /// session failures that are logged and surfaced via state callbacks.
    #[must_use]
    pub fn is_fatal_for_channel(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_)
                | Self::RoomNotCreated
                | Self::PeerNotCreated
                | Self::ChannelWrite(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
