//! Wire protocol: text frames and the `{event, data}` envelope

pub mod events;
pub mod frame;

pub use events::{
    ClientEvent, DeleteMessageData, EncryptedPayload, FileStatusData, FrameClass, JoinProfile,
    SendMessageData, ServerEvent, SignalData, SignalKind, TypingData,
};
pub use frame::{Frame, FrameCodec, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
