#![forbid(unsafe_code)]

use core::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::messages::{ChatMessage, Frame, TypingSignal, UserUpdate};

/// Default maximum size of an inbound text frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("frame has no type discriminator")]
	MissingType,

	#[error("unknown frame type: {0}")]
	UnknownType(String),

	#[error("malformed {kind} frame: {source}")]
	Malformed {
		kind: FrameKind,
		#[source]
		source: serde_json::Error,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Value of the `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
	Message,
	Typing,
	UserUpdate,
}

impl FrameKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			FrameKind::Message => "message",
			FrameKind::Typing => "typing",
			FrameKind::UserUpdate => "user_update",
		}
	}

	fn parse(s: &str) -> Option<Self> {
		match s {
			"message" => Some(FrameKind::Message),
			"typing" => Some(FrameKind::Typing),
			"user_update" => Some(FrameKind::UserUpdate),
			_ => None,
		}
	}
}

impl fmt::Display for FrameKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Deserialize)]
struct Discriminator {
	#[serde(rename = "type", default)]
	kind: Option<String>,
}

/// Read only the `type` field of a frame.
pub fn peek_kind(src: &str, max_frame_size: usize) -> Result<FrameKind, ProtocolError> {
	if src.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	let disc: Discriminator = serde_json::from_str(src).map_err(ProtocolError::Decode)?;
	let kind = disc.kind.ok_or(ProtocolError::MissingType)?;
	FrameKind::parse(&kind).ok_or(ProtocolError::UnknownType(kind))
}

/// Decode a JSON text frame: discriminator first, then the typed body.
pub fn decode_frame(src: &str, max_frame_size: usize) -> Result<Frame, ProtocolError> {
	let kind = peek_kind(src, max_frame_size)?;
	let malformed = |source: serde_json::Error| ProtocolError::Malformed { kind, source };

	match kind {
		FrameKind::Message => serde_json::from_str::<ChatMessage>(src)
			.map(Frame::Message)
			.map_err(malformed),
		FrameKind::Typing => serde_json::from_str::<TypingSignal>(src)
			.map(Frame::Typing)
			.map_err(malformed),
		FrameKind::UserUpdate => serde_json::from_str::<UserUpdate>(src)
			.map(Frame::UserUpdate)
			.map_err(malformed),
	}
}

/// Encode a frame as a JSON text payload.
pub fn encode_frame(frame: &Frame) -> Result<String, ProtocolError> {
	serde_json::to_string(frame).map_err(ProtocolError::Encode)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn peek_kind_reads_only_the_discriminator() {
		let kind = peek_kind(r#"{"type":"typing","whatever":[1,2,3]}"#, DEFAULT_MAX_FRAME_SIZE).expect("kind");
		assert_eq!(kind, FrameKind::Typing);
	}

	#[test]
	fn oversized_frame_is_rejected_before_parsing() {
		let src = format!(r#"{{"type":"message","content":"{}"}}"#, "x".repeat(128));
		let err = peek_kind(&src, 64).unwrap_err();
		assert!(matches!(err, ProtocolError::FrameTooLarge { max: 64, .. }));
	}
}
