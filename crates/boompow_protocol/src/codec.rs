#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum text frame size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

/// Encode a message into a JSON text frame.
pub fn encode_message<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<String, CodecError> {
	let text = serde_json::to_string(msg).map_err(CodecError::Encode)?;
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_message_default<M: Serialize>(msg: &M) -> Result<String, CodecError> {
	encode_message(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a single JSON text frame.
///
/// Frames larger than `max_frame_size` are rejected before parsing.
pub fn decode_message<M: DeserializeOwned>(text: &str, max_frame_size: usize) -> Result<M, CodecError> {
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	serde_json::from_str(text).map_err(CodecError::Decode)
}
