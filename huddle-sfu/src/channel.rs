//! Control-channel write abstraction
//!
//! The room and peer layers signal clients through this trait rather than a
//! concrete WebSocket type, so membership logic stays testable without a
//! live socket. The server's implementation wraps the write half of an axum
//! WebSocket behind a mutex; every send acquires it, which is what gives
//! each client a total order over what the server sends it.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Write one framed envelope. Fails with `ChannelWrite` on I/O error.
    async fn send(&self, text: String) -> Result<()>;

    /// Close the control channel. Idempotent, best-effort.
    async fn close(&self);
}
