//! Murmur - Anonymous End-to-End-Encrypted Chat Relay
//!
//! This library implements a realtime chat relay over QUIC. Clients open a
//! single bidirectional stream and exchange JSON text frames of the form
//! `{"event": <name>, "data": <object>}`. The server matches clients into
//! two-person ("couple") rooms or code-identified group rooms and routes
//! opaque ciphertext envelopes, typing signals, file-transfer markers,
//! deletion requests, and WebRTC signaling frames between members. Message
//! contents are never decoded, inspected, or logged.
//!
//! ## Architecture
//!
//! - **Frame codec**: length-prefixed UTF-8 text frames
//! - **Connection actor**: one task per client channel; reads frames,
//!   submits commands, drains a bounded outbound queue
//! - **Room store**: single-owner state (rooms, group codes, waiting pool,
//!   typing) behind a command loop; all mutation is serialized through it
//! - **Dispatcher**: fan-out with per-session backpressure classes
//!
//! ## Example
//!
//! ```rust,ignore
//! use murmur::{Config, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> murmur::Result<()> {
//!     let mut server = RelayServer::new(Config::from_env());
//!     server.start().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use config::Config;
pub use error::{RelayError, Result};
pub use protocol::{
    ClientEvent, EncryptedPayload, Frame, FrameCodec, JoinProfile, SendMessageData, ServerEvent,
    SignalKind,
};
pub use server::{RelayServer, RoomStore, StoreConfig, StoreHandle, StoreStats};
