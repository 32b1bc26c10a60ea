#![forbid(unsafe_code)]

pub mod codec;
pub mod messages;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, decode_message, encode_message, encode_message_default};
pub use messages::{RewardEarned, ServerMessage, WorkGenerate, WorkResult, WorkerMessage};
