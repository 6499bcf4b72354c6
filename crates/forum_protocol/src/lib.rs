#![forbid(unsafe_code)]

pub mod framing;
pub mod messages;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameKind, ProtocolError, decode_frame, encode_frame, peek_kind};
pub use messages::{ChatMessage, Frame, PresenceEntry, TypingSignal, UserUpdate};
