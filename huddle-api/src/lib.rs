// huddle API library
//
// WebSocket signaling and HTTP surface for the huddle SFU

pub mod http;

// Re-export commonly used types
pub use http::AppState;
