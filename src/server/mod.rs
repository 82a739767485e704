//! Server side: connection actors, the room store, and the QUIC endpoint

pub mod connection;
pub mod relay;
pub mod rooms;
pub mod store;

pub use connection::ConnectionActor;
pub use relay::RelayServer;
pub use rooms::{RoomId, SessionId};
pub use store::{RoomStore, StoreConfig, StoreHandle, StoreStats};
